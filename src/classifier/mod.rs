//! Behavior classifier: label encoding, train/test splitting, a linear SVM and
//! the on-disk model bundle.

pub mod artifact;
pub mod svm;

pub use artifact::ModelBundle;
pub use svm::{LinearSvm, SvmParams};

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Multi-class classifier over dense f32 feature rows and encoded labels.
pub trait Classifier {
    fn fit(&mut self, x: ArrayView2<f32>, y: &[usize]) -> Result<()>;

    /// One margin per (row, class).
    fn decision_function(&self, x: ArrayView2<f32>) -> Array2<f32>;

    fn predict(&self, x: ArrayView2<f32>) -> Vec<usize> {
        self.decision_function(x)
            .rows()
            .into_iter()
            .map(|row| argmax(row.iter().copied()))
            .collect()
    }

    /// Fraction of rows predicted correctly; 0 for an empty input.
    fn score(&self, x: ArrayView2<f32>, y: &[usize]) -> f64 {
        accuracy(y, &self.predict(x))
    }
}

pub(crate) fn argmax(values: impl Iterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

/// Maps behavior labels to dense class ids, in sorted label order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<S: AsRef<str>>(labels: &[S]) -> Self {
        let classes: BTreeSet<&str> = labels.iter().map(|l| l.as_ref()).collect();
        Self {
            classes: classes.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn fit_transform<S: AsRef<str>>(labels: &[S]) -> (Self, Vec<usize>) {
        let encoder = Self::fit(labels);
        let ids = labels
            .iter()
            .filter_map(|l| encoder.encode(l.as_ref()))
            .collect();
        (encoder, ids)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn encode(&self, label: &str) -> Option<usize> {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .ok()
    }

    pub fn decode(&self, id: usize) -> Option<&str> {
        self.classes.get(id).map(String::as_str)
    }

    /// Encode every label; `None` if any label was never seen.
    pub fn transform<S: AsRef<str>>(&self, labels: &[S]) -> Option<Vec<usize>> {
        labels.iter().map(|l| self.encode(l.as_ref())).collect()
    }

    /// Decode ids back to labels. Out-of-range ids are dropped.
    pub fn inverse_transform(&self, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .filter_map(|&id| self.decode(id).map(str::to_string))
            .collect()
    }
}

/// Row indices of a train/test partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffle `0..n` with a seeded generator and hold out `ceil(n * test_ratio)` rows.
pub fn train_test_split(n: usize, test_ratio: f64, seed: u64) -> Split {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_test = ((n as f64) * test_ratio.clamp(0.0, 1.0)).ceil() as usize;
    let n_test = n_test.min(n);
    let train = indices.split_off(n_test);
    Split {
        train,
        test: indices,
    }
}

/// Stack equal-length rows into an `(n, d)` matrix, picking rows by index.
pub fn to_matrix(rows: &[Vec<f32>], indices: &[usize]) -> Result<Array2<f32>> {
    let dim = indices.first().map(|&i| rows[i].len()).unwrap_or(0);
    let mut flat = Vec::with_capacity(indices.len() * dim);
    for &i in indices {
        let row = &rows[i];
        if row.len() != dim {
            return Err(Error::TrainingFailure(format!(
                "feature row {i} has length {}, expected {dim}",
                row.len()
            )));
        }
        flat.extend_from_slice(row);
    }
    Array2::from_shape_vec((indices.len(), dim), flat)
        .map_err(|e| Error::TrainingFailure(e.to_string()))
}

pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// Macro-averaged precision and recall over the classes present in `y_true`.
///
/// A class that is never predicted contributes a precision of 0.
pub fn macro_precision_recall(y_true: &[usize], y_pred: &[usize]) -> (f64, f64) {
    let classes: BTreeSet<usize> = y_true.iter().copied().collect();
    if classes.is_empty() {
        return (0.0, 0.0);
    }

    let mut precision_sum = 0.0;
    let mut recall_sum = 0.0;
    for &class in &classes {
        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut fn_ = 0usize;
        for (&t, &p) in y_true.iter().zip(y_pred) {
            match (t == class, p == class) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }
        if tp + fp > 0 {
            precision_sum += tp as f64 / (tp + fp) as f64;
        }
        if tp + fn_ > 0 {
            recall_sum += tp as f64 / (tp + fn_) as f64;
        }
    }

    let n = classes.len() as f64;
    (precision_sum / n, recall_sum / n)
}
