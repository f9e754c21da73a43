//! JSON model bundle: the fitted classifier together with its label encoder.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::svm::LinearSvm;
use super::{to_matrix, Classifier, LabelEncoder};
use crate::error::{Error, Result};
use crate::media::FEATURE_LEN;

pub const MODEL_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub classifier: LinearSvm,
    pub encoder: LabelEncoder,
    pub feature_len: usize,
    pub trained_at: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `<dir>/<stem>.json`, or `<dir>/<stem>_N.json` with the first free N.
pub fn unique_model_path(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{MODEL_EXTENSION}"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}.{MODEL_EXTENSION}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

impl ModelBundle {
    pub fn new(classifier: LinearSvm, encoder: LabelEncoder) -> Self {
        Self {
            feature_len: classifier.n_features(),
            classifier,
            encoder,
            trained_at: chrono::Utc::now().format(crate::db::TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Write the bundle and return the SHA-256 of the written bytes.
    pub fn save(&self, path: &Path) -> Result<String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(self).map_err(|e| Error::Storage(e.into()))?;
        fs::write(path, &bytes)?;

        let checksum = sha256_hex(&bytes);
        tracing::info!(path = %path.display(), checksum = %checksum, "Saved model");
        Ok(checksum)
    }

    /// Read a bundle, verifying its checksum when one is recorded.
    pub fn load(path: &Path, expected_checksum: Option<&str>) -> Result<Self> {
        let fail = |reason: String| Error::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = fs::read(path).map_err(|e| fail(e.to_string()))?;
        if let Some(expected) = expected_checksum {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(fail(format!("checksum mismatch: expected {expected}, found {actual}")));
            }
        }

        let bundle: Self = serde_json::from_slice(&bytes).map_err(|e| fail(e.to_string()))?;
        if bundle.feature_len != FEATURE_LEN || bundle.classifier.n_features() != FEATURE_LEN {
            return Err(fail(format!(
                "model expects {} features, transform produces {FEATURE_LEN}",
                bundle.classifier.n_features()
            )));
        }
        if bundle.encoder.len() != bundle.classifier.n_classes() {
            return Err(fail(format!(
                "encoder has {} classes, classifier has {}",
                bundle.encoder.len(),
                bundle.classifier.n_classes()
            )));
        }
        Ok(bundle)
    }

    /// Predict a behavior label for each feature row.
    pub fn predict(&self, rows: &[Vec<f32>]) -> Result<Vec<String>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let indices: Vec<usize> = (0..rows.len()).collect();
        let x = to_matrix(rows, &indices)?;
        Ok(self.predict_matrix(x.view()))
    }

    pub fn predict_matrix(&self, x: ArrayView2<f32>) -> Vec<String> {
        let ids = self.classifier.predict(x);
        self.encoder.inverse_transform(&ids)
    }
}
