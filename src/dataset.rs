//! Turn annotated media into aligned (feature vector, label) pairs.
//!
//! Image annotations read the record's own file; video annotations read the
//! cached frame named by their frame index. Nothing here samples video: a
//! frame that is not cached yet is skipped.

use rayon::prelude::*;
use std::path::PathBuf;

use crate::db::{Annotation, MediaKind, MediaRecord};
use crate::error::{Error, Result};
use crate::media::{load_features, FrameStore, PathResolver};

/// A media record together with its annotations.
#[derive(Debug, Clone)]
pub struct AnnotatedMedia {
    pub record: MediaRecord,
    pub annotations: Vec<Annotation>,
}

/// Why an annotation produced no sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    SourceNotFound,
    MissingFrameIndex,
    FrameMissing(PathBuf),
    Unreadable(String),
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub annotation_id: i64,
    pub media_id: i64,
    pub features: Vec<f32>,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Skipped {
    pub annotation_id: i64,
    pub media_id: i64,
    pub reason: SkipReason,
}

pub type SampleOutcome = std::result::Result<Sample, Skipped>;

/// Index-aligned features and labels.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<String>,
    pub skipped: usize,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

type Located = std::result::Result<PathBuf, SkipReason>;

pub struct DatasetBuilder<'a> {
    resolver: &'a PathResolver,
    frames: &'a FrameStore,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(resolver: &'a PathResolver, frames: &'a FrameStore) -> Self {
        Self { resolver, frames }
    }

    /// Lazily load one outcome per annotation, in input order.
    pub fn samples<'b>(&'b self, items: &'b [AnnotatedMedia]) -> impl Iterator<Item = SampleOutcome> + 'b {
        items.iter().flat_map(move |item| {
            let image_source = self.image_source(&item.record);
            item.annotations.iter().map(move |annotation| {
                let located = self.locate(&item.record, annotation, &image_source);
                Self::load(&item.record, annotation, located)
            })
        })
    }

    /// Load every sample, decoding in parallel.
    ///
    /// Fails with [`Error::EmptyDataset`] when no annotation yields a sample.
    pub fn build(&self, items: &[AnnotatedMedia]) -> Result<Dataset> {
        let planned: Vec<(&MediaRecord, &Annotation, Located)> = items
            .iter()
            .flat_map(|item| {
                let image_source = self.image_source(&item.record);
                item.annotations
                    .iter()
                    .map(|annotation| {
                        let located = self.locate(&item.record, annotation, &image_source);
                        (&item.record, annotation, located)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let outcomes: Vec<SampleOutcome> = planned
            .into_par_iter()
            .map(|(record, annotation, located)| Self::load(record, annotation, located))
            .collect();

        let mut dataset = Dataset::default();
        for outcome in outcomes {
            match outcome {
                Ok(sample) => {
                    dataset.features.push(sample.features);
                    dataset.labels.push(sample.label);
                }
                Err(skipped) => {
                    tracing::debug!(
                        annotation_id = skipped.annotation_id,
                        media_id = skipped.media_id,
                        reason = ?skipped.reason,
                        "Skipping annotation"
                    );
                    dataset.skipped += 1;
                }
            }
        }

        tracing::info!(
            samples = dataset.len(),
            skipped = dataset.skipped,
            "Dataset built"
        );

        if dataset.is_empty() {
            return Err(Error::EmptyDataset {
                skipped: dataset.skipped,
            });
        }
        Ok(dataset)
    }

    /// For image records, the resolved file shared by all their annotations.
    fn image_source(&self, record: &MediaRecord) -> Option<Located> {
        (record.kind == MediaKind::Image).then(|| {
            self.resolver
                .resolve(record)
                .map_err(|_| SkipReason::SourceNotFound)
        })
    }

    fn locate(&self, record: &MediaRecord, annotation: &Annotation, image_source: &Option<Located>) -> Located {
        match record.kind {
            MediaKind::Image => image_source
                .clone()
                .unwrap_or(Err(SkipReason::SourceNotFound)),
            MediaKind::Video => {
                let index = annotation.frame_number().ok_or(SkipReason::MissingFrameIndex)?;
                let index = usize::try_from(index).map_err(|_| SkipReason::MissingFrameIndex)?;
                let path = self.frames.frame_path(record.id, index);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(SkipReason::FrameMissing(path))
                }
            }
        }
    }

    fn load(record: &MediaRecord, annotation: &Annotation, located: Located) -> SampleOutcome {
        let skipped = |reason| Skipped {
            annotation_id: annotation.id,
            media_id: record.id,
            reason,
        };
        let path = located.map_err(skipped)?;
        let features = load_features(&path).map_err(|e| skipped(SkipReason::Unreadable(e.to_string())))?;
        Ok(Sample {
            annotation_id: annotation.id,
            media_id: record.id,
            features,
            label: annotation.behavior.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::SamplerConfig;
    use crate::db::{Database, MediaStatus, NewAnnotation};
    use crate::media::video::testing::SyntheticDecoder;
    use crate::media::FrameSampler;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use std::sync::Arc;

    pub fn write_image(path: &Path, color: [u8; 3]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        RgbImage::from_pixel(32, 24, Rgb(color)).save(path).unwrap();
    }

    pub fn frame_store(root: &Path) -> FrameStore {
        let config = SamplerConfig::default();
        let sampler = FrameSampler::new(Arc::new(SyntheticDecoder::new(30.0, 90)), &config);
        FrameStore::new(root, sampler, &config)
    }

    /// Register an image at an absolute path with one annotation per label.
    pub fn annotated_image(db: &Database, path: &Path, color: [u8; 3], labels: &[&str]) -> i64 {
        write_image(path, color);
        let filename = path.file_name().unwrap().to_string_lossy().to_string();
        let id = db
            .insert_media(&filename, path, crate::db::MediaKind::Image)
            .unwrap();
        for label in labels {
            db.insert_annotation(&NewAnnotation::new(id, *label)).unwrap();
        }
        if !labels.is_empty() {
            db.set_media_status(id, MediaStatus::Annotated).unwrap();
        }
        id
    }
}
