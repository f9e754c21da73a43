//! Score a saved model against one annotated media record.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::classifier::ModelBundle;
use crate::db::{Annotation, Database, MediaKind, NewEvaluation};
use crate::error::{Error, Result};
use crate::media::{load_features, FrameStore, PathResolver};

/// One prediction made during an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionItem {
    /// Cached frame index, `None` for image records.
    pub frame_index: Option<usize>,
    pub path: PathBuf,
    pub predicted: String,
    pub ground_truth: Option<String>,
}

impl PredictionItem {
    pub fn is_correct(&self) -> Option<bool> {
        self.ground_truth.as_ref().map(|gt| *gt == self.predicted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClassAccuracy {
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub evaluation_id: i64,
    pub model_id: i64,
    pub media_id: i64,
    pub items: Vec<PredictionItem>,
    /// Predictions per predicted class.
    pub class_counts: BTreeMap<String, usize>,
    /// Accuracy per ground-truth class.
    pub class_accuracy: BTreeMap<String, ClassAccuracy>,
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

pub struct Evaluator<'a> {
    resolver: &'a PathResolver,
    frames: &'a FrameStore,
    max_frames: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(resolver: &'a PathResolver, frames: &'a FrameStore, max_frames: usize) -> Self {
        Self {
            resolver,
            frames,
            max_frames,
        }
    }

    /// Predict every sample of `media_id` with model `model_id`, compare with
    /// the annotations and store the result.
    ///
    /// `vocabulary` keys always appear in both maps, with zero counts when unused.
    pub fn evaluate(&self, db: &Database, model_id: i64, media_id: i64, vocabulary: &[String]) -> Result<EvaluationResult> {
        let model = db.get_model(model_id)?.ok_or(Error::UnknownModel(model_id))?;
        let media = db.get_media(media_id)?.ok_or(Error::UnknownMedia(media_id))?;
        let bundle = ModelBundle::load(&model.path, model.checksum.as_deref())?;
        let annotations = db.annotations_for(media_id)?;

        let items = match media.kind {
            MediaKind::Image => {
                let path = self.resolver.resolve(&media)?;
                let features = load_features(&path)?;
                let predicted = bundle.predict(&[features])?;
                predicted
                    .into_iter()
                    .map(|predicted| PredictionItem {
                        frame_index: None,
                        path: path.clone(),
                        predicted,
                        ground_truth: annotations.first().map(|a| a.behavior.clone()),
                    })
                    .collect()
            }
            MediaKind::Video => self.predict_frames(&bundle, media_id, &annotations)?,
        };

        let mut result = tally(items, vocabulary);
        result.model_id = model_id;
        result.media_id = media_id;
        result.evaluation_id = db.insert_evaluation(&NewEvaluation {
            model_id,
            media_id,
            correct_predictions: result.correct as i64,
            total_predictions: result.total as i64,
            accuracy: result.accuracy,
        })?;

        tracing::info!(
            model_id,
            media_id,
            predictions = result.items.len(),
            correct = result.correct,
            total = result.total,
            accuracy = result.accuracy,
            "Evaluation finished"
        );
        Ok(result)
    }

    /// Predict up to `max_frames` readable cached frames, in index order.
    fn predict_frames(&self, bundle: &ModelBundle, media_id: i64, annotations: &[Annotation]) -> Result<Vec<PredictionItem>> {
        let mut read = Vec::new();
        let mut rows = Vec::new();

        for frame in self.frames.list_frames(media_id)? {
            if rows.len() >= self.max_frames {
                break;
            }
            match load_features(&frame.path) {
                Ok(features) => {
                    rows.push(features);
                    read.push(frame);
                }
                Err(e) => {
                    tracing::warn!(path = %frame.path.display(), error = %e, "Skipping unreadable frame");
                }
            }
        }

        let predicted = bundle.predict(&rows)?;
        Ok(read
            .into_iter()
            .zip(predicted)
            .map(|(frame, predicted)| {
                let ground_truth = annotations
                    .iter()
                    .find(|a| a.frame_number() == Some(frame.index as i64))
                    .map(|a| a.behavior.clone());
                PredictionItem {
                    frame_index: Some(frame.index),
                    path: frame.path,
                    predicted,
                    ground_truth,
                }
            })
            .collect())
    }
}

fn tally(items: Vec<PredictionItem>, vocabulary: &[String]) -> EvaluationResult {
    let mut class_counts: BTreeMap<String, usize> =
        vocabulary.iter().map(|k| (k.clone(), 0)).collect();
    let mut class_accuracy: BTreeMap<String, ClassAccuracy> = vocabulary
        .iter()
        .map(|k| (k.clone(), ClassAccuracy::default()))
        .collect();
    let mut correct = 0;
    let mut total = 0;

    for item in &items {
        *class_counts.entry(item.predicted.clone()).or_default() += 1;

        if let Some(truth) = &item.ground_truth {
            let entry = class_accuracy.entry(truth.clone()).or_default();
            entry.total += 1;
            total += 1;
            if *truth == item.predicted {
                entry.correct += 1;
                correct += 1;
            }
        }
    }

    for entry in class_accuracy.values_mut() {
        entry.accuracy = ratio(entry.correct, entry.total);
    }

    EvaluationResult {
        evaluation_id: 0,
        model_id: 0,
        media_id: 0,
        items,
        class_counts,
        class_accuracy,
        correct,
        total,
        accuracy: ratio(correct, total),
    }
}

fn ratio(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::dataset::test_support::{annotated_image, frame_store, write_image};
    use crate::db::NewAnnotation;
    use crate::training::{detached_reporter, Trainer};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const RED: [u8; 3] = [230, 10, 10];
    const BLUE: [u8; 3] = [10, 10, 230];

    struct Fixture {
        dir: TempDir,
        db: Database,
        resolver: Arc<PathResolver>,
        frames: Arc<FrameStore>,
        model_id: i64,
    }

    fn vocabulary() -> Vec<String> {
        ["lecturing", "questioning", "other"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let resolver = Arc::new(PathResolver::new(Path::new("uploads"), dir.path()));
        let frames = Arc::new(frame_store(&dir.path().join("frames")));
        for i in 0..6 {
            annotated_image(&db, &dir.path().join(format!("train_r{i}.png")), RED, &["lecturing"]);
            annotated_image(&db, &dir.path().join(format!("train_b{i}.png")), BLUE, &["questioning"]);
        }
        let trainer = Trainer::new(
            resolver.clone(),
            frames.clone(),
            dir.path().join("models"),
            TrainingConfig::default(),
        );
        let model_id = trainer.train(&db, &detached_reporter()).unwrap().model_id;
        Fixture {
            dir,
            db,
            resolver,
            frames,
            model_id,
        }
    }

    fn evaluator(f: &Fixture) -> Evaluator<'_> {
        Evaluator::new(&f.resolver, &f.frames, 100)
    }

    #[test]
    fn test_image_uses_first_annotation() {
        let f = fixture();
        let media = annotated_image(&f.db, &f.dir.path().join("eval.png"), RED, &["lecturing", "questioning"]);

        let result = evaluator(&f).evaluate(&f.db, f.model_id, media, &vocabulary()).unwrap();

        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].ground_truth.as_deref(), Some("lecturing"));
        assert_eq!(result.items[0].predicted, "lecturing");
        assert_eq!(result.total, 1);
        assert_eq!(result.correct, 1);
        assert_eq!(result.accuracy, 1.0);
        assert_eq!(result.class_accuracy["lecturing"].accuracy, 1.0);
        assert_eq!(result.class_accuracy["other"], ClassAccuracy::default());
        assert_eq!(result.class_counts["questioning"], 0);

        let stored = f.db.evaluations_for_model(f.model_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, result.evaluation_id);
        assert_eq!(stored[0].correct_predictions, 1);
    }

    #[test]
    fn test_unannotated_image_is_predicted_not_scored() {
        let f = fixture();
        let media = annotated_image(&f.db, &f.dir.path().join("plain.png"), BLUE, &[]);

        let result = evaluator(&f).evaluate(&f.db, f.model_id, media, &vocabulary()).unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.total, 0);
        assert_eq!(result.accuracy, 0.0);
        assert_eq!(result.class_counts.values().sum::<usize>(), 1);
    }

    #[test]
    fn test_video_frames_matched_by_index() {
        let f = fixture();
        let vid = f
            .db
            .insert_media("v.mp4", Path::new("v.mp4"), MediaKind::Video)
            .unwrap();
        write_image(&f.frames.frame_path(vid, 0), RED);
        write_image(&f.frames.frame_path(vid, 1), BLUE);
        write_image(&f.frames.frame_path(vid, 2), RED);
        std::fs::write(f.frames.frame_path(vid, 3), b"corrupt").unwrap();

        f.db.insert_annotation(&NewAnnotation::new(vid, "lecturing").with_frame(0.0))
            .unwrap();
        // Fractional index truncates to frame 1; the truth is wrong on purpose
        f.db.insert_annotation(&NewAnnotation::new(vid, "lecturing").with_frame(1.6))
            .unwrap();

        let result = evaluator(&f).evaluate(&f.db, f.model_id, vid, &vocabulary()).unwrap();

        let indices: Vec<Option<usize>> = result.items.iter().map(|i| i.frame_index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(result.items[2].ground_truth, None);
        assert_eq!(result.total, 2);
        assert_eq!(result.correct, 1);
        assert_eq!(result.accuracy, 0.5);
        assert_eq!(
            result.class_accuracy["lecturing"],
            ClassAccuracy {
                correct: 1,
                total: 2,
                accuracy: 0.5
            }
        );
        assert_eq!(result.class_counts["lecturing"], 2);
        assert_eq!(result.class_counts["questioning"], 1);
    }

    #[test]
    fn test_frame_limit() {
        let f = fixture();
        let vid = f
            .db
            .insert_media("v.mp4", Path::new("v.mp4"), MediaKind::Video)
            .unwrap();
        for i in 0..5 {
            write_image(&f.frames.frame_path(vid, i), BLUE);
        }

        let result = Evaluator::new(&f.resolver, &f.frames, 3)
            .evaluate(&f.db, f.model_id, vid, &vocabulary())
            .unwrap();
        assert_eq!(result.items.len(), 3);
    }

    #[test]
    fn test_unknown_ids() {
        let f = fixture();
        let media = annotated_image(&f.db, &f.dir.path().join("x.png"), RED, &["lecturing"]);
        assert!(matches!(
            evaluator(&f).evaluate(&f.db, 999, media, &vocabulary()),
            Err(Error::UnknownModel(999))
        ));
        assert!(matches!(
            evaluator(&f).evaluate(&f.db, f.model_id, 999, &vocabulary()),
            Err(Error::UnknownMedia(999))
        ));
    }

    #[test]
    fn test_missing_model_file() {
        let f = fixture();
        let media = annotated_image(&f.db, &f.dir.path().join("x.png"), RED, &["lecturing"]);
        let model = f.db.get_model(f.model_id).unwrap().unwrap();
        std::fs::remove_file(&model.path).unwrap();

        let err = evaluator(&f)
            .evaluate(&f.db, f.model_id, media, &vocabulary())
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
        assert!(f.db.evaluations_for_model(f.model_id).unwrap().is_empty());
    }

    #[test]
    fn test_tally_keys_by_ground_truth() {
        let item = |predicted: &str, truth: Option<&str>| PredictionItem {
            frame_index: None,
            path: PathBuf::new(),
            predicted: predicted.to_string(),
            ground_truth: truth.map(str::to_string),
        };
        let result = tally(
            vec![
                item("lecturing", Some("questioning")),
                item("questioning", Some("questioning")),
                item("other", None),
            ],
            &vocabulary(),
        );

        assert_eq!(result.class_accuracy["questioning"].total, 2);
        assert_eq!(result.class_accuracy["questioning"].accuracy, 0.5);
        assert_eq!(result.class_accuracy["lecturing"].total, 0);
        assert_eq!(result.class_accuracy["lecturing"].accuracy, 0.0);
        assert_eq!(result.class_counts["other"], 1);
        assert_eq!(result.total, 2);
        assert_eq!(result.correct, 1);
    }
}
