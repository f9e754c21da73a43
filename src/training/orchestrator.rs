//! One training run: dataset, label encoding, split, fit, score, save.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;

use super::{StatusReporter, StatusUpdate, TrainingPhase, TrainingStatus};
use crate::classifier::artifact::unique_model_path;
use crate::classifier::{
    accuracy, macro_precision_recall, to_matrix, train_test_split, Classifier, LabelEncoder,
    LinearSvm, ModelBundle, SvmParams,
};
use crate::config::TrainingConfig;
use crate::dataset::{AnnotatedMedia, DatasetBuilder};
use crate::db::{Database, MediaStatus, NewModel};
use crate::error::{Error, Result};
use crate::media::{FrameStore, PathResolver};

pub const MODEL_NAME_PREFIX: &str = "teaching_behavior_model";

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub model_id: i64,
    pub model_path: PathBuf,
    pub training_data_size: usize,
    pub skipped: usize,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
}

/// Sends each update to the reporter after writing it to the job's row.
struct Progress<'a> {
    db: &'a Database,
    reporter: &'a StatusReporter,
    status: RefCell<TrainingStatus>,
}

impl<'a> Progress<'a> {
    fn new(db: &'a Database, reporter: &'a StatusReporter) -> Self {
        Self {
            db,
            reporter,
            status: RefCell::new(TrainingStatus::queued(reporter.job_id())),
        }
    }

    fn phase(&self, phase: TrainingPhase, message: &str) {
        self.send(StatusUpdate::Phase {
            phase,
            message: message.to_string(),
        });
    }

    fn send(&self, update: StatusUpdate) {
        let mut status = self.status.borrow_mut();
        status.apply(update.clone());
        if let Err(e) = self.db.update_training_job(&status) {
            tracing::warn!(job_id = self.reporter.job_id().0, error = %e, "Failed to store training status");
        }
        self.reporter.send(update);
    }
}

#[derive(Clone)]
pub struct Trainer {
    resolver: Arc<PathResolver>,
    frames: Arc<FrameStore>,
    models_dir: PathBuf,
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(
        resolver: Arc<PathResolver>,
        frames: Arc<FrameStore>,
        models_dir: impl Into<PathBuf>,
        config: TrainingConfig,
    ) -> Self {
        Self {
            resolver,
            frames,
            models_dir: models_dir.into(),
            config,
        }
    }

    /// Run a full training pass, reporting each phase. Every error is also
    /// reported as a failed status before it is returned.
    pub fn train(&self, db: &Database, reporter: &StatusReporter) -> Result<TrainingOutcome> {
        let progress = Progress::new(db, reporter);
        match self.run(db, &progress) {
            Ok(outcome) => {
                tracing::info!(
                    job_id = reporter.job_id().0,
                    model_id = outcome.model_id,
                    samples = outcome.training_data_size,
                    accuracy = outcome.accuracy,
                    "Training complete"
                );
                progress.send(StatusUpdate::Done {
                    model_id: outcome.model_id,
                    accuracy: outcome.accuracy,
                    message: format!("Model trained, accuracy {:.2}%", outcome.accuracy * 100.0),
                });
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(job_id = reporter.job_id().0, error = %e, "Training failed");
                progress.send(StatusUpdate::Failed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn run(&self, db: &Database, progress: &Progress<'_>) -> Result<TrainingOutcome> {
        progress.phase(TrainingPhase::Preparing, "Collecting annotated media");
        let annotated = db.media_with_status(MediaStatus::Annotated)?;
        if annotated.is_empty() {
            return Err(Error::NoAnnotatedData);
        }

        let mut items = Vec::with_capacity(annotated.len());
        for record in annotated {
            let annotations = db.annotations_for(record.id)?;
            items.push(AnnotatedMedia {
                record,
                annotations,
            });
        }

        progress.phase(TrainingPhase::ExtractingFeatures, "Extracting features");
        let dataset = DatasetBuilder::new(&self.resolver, &self.frames).build(&items)?;

        let (encoder, y) = LabelEncoder::fit_transform(&dataset.labels);
        let split = train_test_split(dataset.len(), self.config.test_ratio, self.config.seed);
        if split.train.is_empty() {
            return Err(Error::TrainingFailure(format!(
                "{} samples leave nothing to train on after the test split",
                dataset.len()
            )));
        }

        progress.phase(TrainingPhase::Training, "Training classifier");
        let x_train = to_matrix(&dataset.features, &split.train)?;
        let y_train: Vec<usize> = split.train.iter().map(|&i| y[i]).collect();
        let mut classifier = LinearSvm::new(encoder.len(), SvmParams::from(&self.config));
        classifier.fit(x_train.view(), &y_train)?;

        progress.phase(TrainingPhase::Evaluating, "Scoring held-out samples");
        // With no held-out rows the training rows are scored instead
        let held_out = if split.test.is_empty() {
            &split.train
        } else {
            &split.test
        };
        let x_test = to_matrix(&dataset.features, held_out)?;
        let y_test: Vec<usize> = held_out.iter().map(|&i| y[i]).collect();
        let y_pred = classifier.predict(x_test.view());
        let accuracy = accuracy(&y_test, &y_pred);
        let (precision, recall) = macro_precision_recall(&y_test, &y_pred);

        progress.phase(TrainingPhase::Saving, "Saving model");
        let stem = format!(
            "{MODEL_NAME_PREFIX}_{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = unique_model_path(&self.models_dir, &stem);
        let bundle = ModelBundle::new(classifier, encoder);
        let checksum = bundle.save(&path)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or(stem);
        let inserted = db.insert_model(&NewModel {
            name,
            path: path.clone(),
            training_data_size: dataset.len() as i64,
            accuracy: Some(accuracy),
            precision: Some(precision),
            recall: Some(recall),
            checksum: Some(checksum),
        });
        let model_id = match inserted {
            Ok(id) => id,
            Err(e) => {
                // No row points at the artifact, so it would never be cleared
                if let Err(rm) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %rm, "Failed to remove orphaned model file");
                }
                return Err(e.into());
            }
        };

        Ok(TrainingOutcome {
            model_id,
            model_path: path,
            training_data_size: dataset.len(),
            skipped: dataset.skipped,
            accuracy,
            precision,
            recall,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::{annotated_image, frame_store};
    use crate::db::NewAnnotation;
    use crate::training::{JobId, StatusStore, TrainingPhase};
    use std::path::Path;
    use tempfile::tempdir;

    struct Fixture {
        dir: tempfile::TempDir,
        db: Database,
        trainer: Trainer,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let resolver = Arc::new(PathResolver::new(Path::new("uploads"), dir.path()));
        let frames = Arc::new(frame_store(&dir.path().join("frames")));
        let trainer = Trainer::new(
            resolver,
            frames,
            dir.path().join("models"),
            TrainingConfig::default(),
        );
        Fixture { dir, db, trainer }
    }

    #[test]
    fn test_no_annotated_media() {
        let f = fixture();
        let store = StatusStore::new();
        let id = f.db.begin_training_job(3600).unwrap().unwrap();
        let reporter = store.try_begin(id).unwrap();

        let err = f.trainer.train(&f.db, &reporter).unwrap_err();
        assert!(matches!(err, Error::NoAnnotatedData));

        let status = store.get(id).unwrap();
        assert_eq!(status.progress, 0);
        assert!(!status.running);
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert_eq!(f.db.training_job(id).unwrap().unwrap(), status);
        assert_eq!(f.db.count_models().unwrap(), 0);
    }

    #[test]
    fn test_only_missing_frame_fails_with_empty_dataset() {
        let f = fixture();
        let video = f.dir.path().join("lesson.mp4");
        std::fs::write(&video, b"data").unwrap();
        let id = f
            .db
            .insert_media("lesson.mp4", &video, crate::db::MediaKind::Video)
            .unwrap();
        f.db.insert_annotation(&NewAnnotation::new(id, "questioning").with_frame(7.0))
            .unwrap();
        f.db.set_media_status(id, MediaStatus::Annotated).unwrap();

        let store = StatusStore::new();
        let reporter = store.try_begin(JobId(1)).unwrap();
        let err = f.trainer.train(&f.db, &reporter).unwrap_err();

        assert!(matches!(err, Error::EmptyDataset { skipped: 1 }));
        let status = store.get(JobId(1)).unwrap();
        assert_eq!(status.progress, 0);
        assert!(!status.running);
        assert_eq!(f.db.count_models().unwrap(), 0);
    }

    #[test]
    fn test_single_class_is_training_failure() {
        let f = fixture();
        for i in 0..5 {
            annotated_image(
                &f.db,
                &f.dir.path().join(format!("img{i}.png")),
                [200, 0, 0],
                &["lecturing"],
            );
        }

        let err = f
            .trainer
            .train(&f.db, &crate::training::detached_reporter())
            .unwrap_err();
        assert!(matches!(err, Error::TrainingFailure(_)));
        assert_eq!(f.db.count_models().unwrap(), 0);
    }

    #[test]
    fn test_trains_and_records_model() {
        let f = fixture();
        for i in 0..6 {
            annotated_image(
                &f.db,
                &f.dir.path().join(format!("red{i}.png")),
                [220, 10, 10],
                &["lecturing"],
            );
            annotated_image(
                &f.db,
                &f.dir.path().join(format!("blue{i}.png")),
                [10, 10, 220],
                &["group_discussion"],
            );
        }

        let store = StatusStore::new();
        let job = f.db.begin_training_job(3600).unwrap().unwrap();
        let reporter = store.try_begin(job).unwrap();
        let outcome = f.trainer.train(&f.db, &reporter).unwrap();

        assert_eq!(outcome.training_data_size, 12);
        assert_eq!(outcome.skipped, 0);
        assert!(outcome.model_path.is_file());
        assert!(outcome
            .model_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("teaching_behavior_model_"));
        assert!((0.0..=1.0).contains(&outcome.accuracy));

        let status = store.get(job).unwrap();
        assert_eq!(status.progress, 100);
        assert_eq!(status.phase, TrainingPhase::Done);
        assert_eq!(status.model_id, Some(outcome.model_id));
        let stored = f.db.latest_training_job().unwrap().unwrap();
        assert_eq!(stored.job_id, Some(job));
        assert_eq!(stored.phase, TrainingPhase::Done);
        assert!(!stored.running);
        assert_eq!(stored.model_id, Some(outcome.model_id));

        let record = f.db.get_model(outcome.model_id).unwrap().unwrap();
        assert_eq!(record.training_data_size, 12);
        assert_eq!(record.path, outcome.model_path);
        let bundle = ModelBundle::load(&record.path, record.checksum.as_deref()).unwrap();
        assert_eq!(bundle.encoder.classes(), &["group_discussion", "lecturing"]);
    }

    #[test]
    fn test_second_run_in_same_second_gets_suffix() {
        let f = fixture();
        for i in 0..3 {
            annotated_image(&f.db, &f.dir.path().join(format!("r{i}.png")), [250, 0, 0], &["lecturing"]);
            annotated_image(&f.db, &f.dir.path().join(format!("g{i}.png")), [0, 250, 0], &["other"]);
        }

        let reporter = crate::training::detached_reporter();
        let first = f.trainer.train(&f.db, &reporter).unwrap();
        let second = f.trainer.train(&f.db, &reporter).unwrap();
        assert_ne!(first.model_path, second.model_path);
        assert_eq!(f.db.count_models().unwrap(), 2);
    }

    #[test]
    fn test_failed_model_insert_removes_artifact() {
        let f = fixture();
        for i in 0..3 {
            annotated_image(&f.db, &f.dir.path().join(format!("r{i}.png")), [250, 0, 0], &["lecturing"]);
            annotated_image(&f.db, &f.dir.path().join(format!("b{i}.png")), [0, 0, 250], &["other"]);
        }
        f.db.conn()
            .execute_batch("DROP TABLE evaluations; DROP TABLE models;")
            .unwrap();

        let err = f
            .trainer
            .train(&f.db, &crate::training::detached_reporter())
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let leftovers = std::fs::read_dir(f.dir.path().join("models"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}
