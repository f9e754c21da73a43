//! Application context: the database, the shared media services and the
//! training job store, with one method per user-facing operation.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::db::{
    Annotation, ClearedFiles, Database, MediaKind, MediaRecord, MediaStatus, ModelRecord, NewAnnotation, Stats,
};
use crate::error::{Error, Result};
use crate::evaluate::{EvaluationResult, Evaluator};
use crate::media::{FfmpegDecoder, FrameSampler, FrameStore, PathResolver, VideoDecoder};
use crate::training::{spawn_training, JobId, StatusStore, StatusUpdate, Trainer, TrainingStatus};
use crate::vocabulary::Vocabulary;

pub const FRAMES_PER_PAGE: usize = 8;
pub const ANNOTATIONS_PER_PAGE: usize = 5;

/// One page of a longer listing. Pages are 1-based.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

impl<T> Page<T> {
    fn total_pages(total_items: usize, per_page: usize) -> usize {
        total_items.div_ceil(per_page).max(1)
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameView {
    pub index: usize,
    pub path: PathBuf,
    pub is_annotated: bool,
}

#[derive(Debug, Clone)]
pub struct AnnotateOutcome {
    pub annotation_id: i64,
    /// False when the label is not in the vocabulary; it is stored anyway.
    pub known_behavior: bool,
    /// Cached frame count for video records.
    pub frames: Option<usize>,
    /// Why frames could not be prepared, if they could not.
    pub frame_warning: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClearReport {
    pub model_files: usize,
    pub media_files: usize,
    pub frame_dirs: usize,
}

pub struct App {
    pub config: Config,
    pub db: Database,
    pub vocabulary: Vocabulary,
    resolver: Arc<PathResolver>,
    frames: Arc<FrameStore>,
    jobs: Arc<StatusStore>,
}

impl App {
    pub fn new(config: Config, db: Database) -> Result<Self> {
        let decoder = FfmpegDecoder::new(&config.sampler.ffmpeg_bin, &config.sampler.ffprobe_bin);
        Self::with_decoder(config, db, Arc::new(decoder))
    }

    pub fn with_decoder(config: Config, db: Database, decoder: Arc<dyn VideoDecoder>) -> Result<Self> {
        db.initialize()?;
        let cwd = std::env::current_dir()?;
        let resolver = PathResolver::new(&config.storage.uploads_dir, &cwd);
        let sampler = FrameSampler::new(decoder, &config.sampler);
        let frames = FrameStore::new(&config.storage.frames_dir, sampler, &config.sampler);
        let vocabulary = Vocabulary::load(&db)?;

        Ok(Self {
            config,
            db,
            vocabulary,
            resolver: Arc::new(resolver),
            frames: Arc::new(frames),
            jobs: Arc::new(StatusStore::new()),
        })
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn frame_store(&self) -> &FrameStore {
        &self.frames
    }

    /// Copy `source` into the uploads directory and register it.
    pub fn import_media(&self, source: &Path) -> Result<MediaRecord> {
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::UnsupportedMedia(source.display().to_string()))?;
        let kind = MediaKind::from_filename(&filename).ok_or_else(|| Error::UnsupportedMedia(filename.clone()))?;

        let uploads = &self.config.storage.uploads_dir;
        fs::create_dir_all(uploads).map_err(|source| Error::Directory {
            path: uploads.clone(),
            source,
        })?;
        let target = unique_upload_path(uploads, &filename);
        fs::copy(source, &target)?;

        let stored_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(filename);
        let id = self.db.insert_media(&stored_name, &target, kind)?;
        tracing::info!(media_id = id, kind = kind.as_str(), path = %target.display(), "Imported media");

        self.db.get_media(id)?.ok_or(Error::UnknownMedia(id))
    }

    pub fn list_media(&self) -> Result<Vec<MediaRecord>> {
        Ok(self.db.list_media()?)
    }

    fn media(&self, media_id: i64) -> Result<MediaRecord> {
        self.db.get_media(media_id)?.ok_or(Error::UnknownMedia(media_id))
    }

    /// Store an annotation, mark its record annotated and, for videos, make
    /// sure the frames it may refer to are cached.
    pub fn annotate(&self, annotation: &NewAnnotation) -> Result<AnnotateOutcome> {
        let record = self.media(annotation.media_id)?;

        let known_behavior = self.vocabulary.contains(&annotation.behavior);
        if !known_behavior {
            tracing::warn!(
                media_id = record.id,
                behavior = %annotation.behavior,
                "Behavior is not in the vocabulary"
            );
        }

        let annotation_id = self.db.insert_annotation(annotation)?;
        self.db.set_media_status(record.id, MediaStatus::Annotated)?;

        let (frames, frame_warning) = match record.kind {
            MediaKind::Image => (None, None),
            MediaKind::Video => match self.frames.ensure_populated(&record, &self.resolver) {
                Ok(frames) => (Some(frames.len()), None),
                Err(e) => {
                    tracing::warn!(media_id = record.id, error = %e, "Frames unavailable for annotated video");
                    (None, Some(e.to_string()))
                }
            },
        };

        Ok(AnnotateOutcome {
            annotation_id,
            known_behavior,
            frames,
            frame_warning,
        })
    }

    /// Cached frames of a video, sampling it first if needed. Image records
    /// have no frames.
    pub fn frame_page(&self, media_id: i64, page: usize) -> Result<Page<FrameView>> {
        let record = self.media(media_id)?;
        let frames = self.frames.ensure_populated(&record, &self.resolver)?;

        let annotated: BTreeSet<i64> = self
            .db
            .annotations_for(media_id)?
            .iter()
            .filter_map(Annotation::frame_number)
            .collect();

        let total_items = frames.len();
        let total_pages = Page::<FrameView>::total_pages(total_items, FRAMES_PER_PAGE);
        let page = page.max(1);
        let items = frames
            .into_iter()
            .skip((page - 1) * FRAMES_PER_PAGE)
            .take(FRAMES_PER_PAGE)
            .map(|f| FrameView {
                is_annotated: annotated.contains(&(f.index as i64)),
                index: f.index,
                path: f.path,
            })
            .collect();

        Ok(Page {
            items,
            page,
            total_pages,
            total_items,
        })
    }

    pub fn annotations_page(&self, media_id: i64, page: usize) -> Result<Page<Annotation>> {
        self.media(media_id)?;
        let total_items = self.db.count_annotations_for(media_id)? as usize;
        let page = page.max(1);
        let items = self.db.annotations_page(media_id, page, ANNOTATIONS_PER_PAGE)?;
        Ok(Page {
            items,
            page,
            total_pages: Page::<Annotation>::total_pages(total_items, ANNOTATIONS_PER_PAGE),
            total_items,
        })
    }

    /// Start a training job on a worker thread. Fails with [`Error::Busy`]
    /// while another job runs, in this process or any other using the same
    /// database.
    pub fn start_training(&self) -> Result<JobId> {
        self.sync_local_job()?;
        let id = self
            .db
            .begin_training_job(self.config.training.stale_job_secs)?
            .ok_or(Error::Busy)?;

        let reporter = match self.jobs.try_begin(id) {
            Ok(reporter) => reporter,
            Err(e) => {
                // Our own worker is still going although its row went stale
                let mut status = TrainingStatus::queued(id);
                status.apply(StatusUpdate::Failed {
                    error: e.to_string(),
                });
                self.db.close_training_job(&status)?;
                return Err(e);
            }
        };

        let trainer = Trainer::new(
            self.resolver.clone(),
            self.frames.clone(),
            &self.config.storage.models_dir,
            self.config.training.clone(),
        );
        // A failed spawn drops the reporter, which marks the job failed
        spawn_training(self.config.db_path.clone(), trainer, reporter)?;
        tracing::info!(job_id = id.0, "Training started");
        Ok(id)
    }

    /// A worker that dies without a final update is only noticed by the
    /// process that spawned it; write that outcome to the job row.
    fn sync_local_job(&self) -> Result<()> {
        let local = self.jobs.latest();
        if local.phase.is_terminal() && self.db.close_training_job(&local)? {
            tracing::warn!(
                job_id = local.job_id.map(|id| id.0),
                phase = local.phase.as_str(),
                "Recorded training outcome missing from the job row"
            );
        }
        Ok(())
    }

    /// Status of the most recent job started against this database.
    pub fn training_status(&self) -> Result<TrainingStatus> {
        self.sync_local_job()?;
        Ok(self
            .db
            .latest_training_job()?
            .unwrap_or_else(TrainingStatus::idle))
    }

    pub fn job_status(&self, id: JobId) -> Result<Option<TrainingStatus>> {
        self.sync_local_job()?;
        Ok(self.db.training_job(id)?)
    }

    pub fn list_models(&self) -> Result<Vec<ModelRecord>> {
        Ok(self.db.list_models()?)
    }

    pub fn evaluate(&self, model_id: i64, media_id: i64) -> Result<EvaluationResult> {
        Evaluator::new(&self.resolver, &self.frames, self.config.evaluation.max_frames).evaluate(
            &self.db,
            model_id,
            media_id,
            &self.vocabulary.keys(),
        )
    }

    pub fn add_behavior(&mut self, key: &str, value: &str, description: Option<&str>) -> Result<i64> {
        let id = self
            .db
            .add_behavior(key, value, description)?
            .ok_or_else(|| Error::DuplicateBehavior(key.to_string()))?;
        self.vocabulary.refresh(&self.db)?;
        Ok(id)
    }

    pub fn update_behavior(&mut self, id: i64, key: &str, value: &str) -> Result<bool> {
        if let Some(existing) = self.db.behavior_by_key(key)? {
            if existing.id != id {
                return Err(Error::DuplicateBehavior(key.to_string()));
            }
        }
        let updated = self.db.update_behavior(id, key, value)?;
        self.vocabulary.refresh(&self.db)?;
        Ok(updated)
    }

    pub fn delete_behavior(&mut self, id: i64) -> Result<bool> {
        let deleted = self.db.delete_behavior(id)?;
        self.vocabulary.refresh(&self.db)?;
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(self.db.stats()?)
    }

    /// Delete every evaluation, model, annotation and media record, together
    /// with their files and the frame cache. The vocabulary is kept.
    pub fn clear_data(&self) -> Result<ClearReport> {
        let ClearedFiles {
            model_paths,
            media_paths,
        } = self.db.clear_all()?;

        let report = ClearReport {
            model_files: remove_files(&model_paths),
            media_files: remove_files(&media_paths),
            frame_dirs: self.frames.clear_all()?,
        };
        tracing::info!(
            model_files = report.model_files,
            media_files = report.media_files,
            frame_dirs = report.frame_dirs,
            "Cleared all data"
        );
        Ok(report)
    }
}

/// `<dir>/<filename>`, or `<dir>/<stem>_N.<ext>` when that is taken.
fn unique_upload_path(dir: &Path, filename: &str) -> PathBuf {
    let first = dir.join(filename);
    if !first.exists() {
        return first;
    }
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn remove_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "File already gone");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::write_image;
    use crate::media::video::testing::SyntheticDecoder;
    use crate::training::TrainingPhase;
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.db_path = root.join("classmark.db");
        config.storage.uploads_dir = root.join("uploads");
        config.storage.frames_dir = root.join("frames");
        config.storage.models_dir = root.join("models");
        config
    }

    fn app_with(decoder: SyntheticDecoder) -> (TempDir, App) {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.db_path).unwrap();
        let app = App::with_decoder(config, db, Arc::new(decoder)).unwrap();
        (dir, app)
    }

    fn app() -> (TempDir, App) {
        app_with(SyntheticDecoder::new(30.0, 270))
    }

    fn wait_for_idle(app: &App) -> TrainingStatus {
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            let status = app.training_status().unwrap();
            if !status.running || Instant::now() > deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn import_image(app: &App, dir: &Path, name: &str, color: [u8; 3]) -> MediaRecord {
        let source = dir.join("incoming").join(name);
        write_image(&source, color);
        app.import_media(&source).unwrap()
    }

    fn import_video(app: &App, dir: &Path) -> MediaRecord {
        let source = dir.join("incoming").join("lesson.mp4");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"synthetic").unwrap();
        app.import_media(&source).unwrap()
    }

    #[test]
    fn test_import_copies_and_classifies() {
        let (dir, app) = app();
        let record = import_image(&app, dir.path(), "class.jpg", [1, 2, 3]);

        assert_eq!(record.kind, MediaKind::Image);
        assert_eq!(record.status, MediaStatus::Uploaded);
        assert!(dir.path().join("uploads").join("class.jpg").is_file());

        let again = import_image(&app, dir.path(), "class.jpg", [1, 2, 3]);
        assert_eq!(again.filename, "class_1.jpg");
        assert_eq!(app.list_media().unwrap().len(), 2);
    }

    #[test]
    fn test_import_rejects_unknown_extension() {
        let (dir, app) = app();
        let source = dir.path().join("notes.txt");
        fs::write(&source, b"hello").unwrap();
        assert!(matches!(
            app.import_media(&source),
            Err(Error::UnsupportedMedia(_))
        ));
    }

    #[test]
    fn test_annotate_image_marks_annotated() {
        let (dir, app) = app();
        let record = import_image(&app, dir.path(), "a.png", [10, 20, 30]);

        let outcome = app
            .annotate(&NewAnnotation::new(record.id, "lecturing").with_coordinates("10,20,30,40"))
            .unwrap();
        assert!(outcome.known_behavior);
        assert_eq!(outcome.frames, None);

        let stored = app.db.get_media(record.id).unwrap().unwrap();
        assert_eq!(stored.status, MediaStatus::Annotated);

        let unknown = app.annotate(&NewAnnotation::new(record.id, "juggling")).unwrap();
        assert!(!unknown.known_behavior);
        assert_eq!(app.db.count_annotations_for(record.id).unwrap(), 2);
    }

    #[test]
    fn test_annotate_unknown_media() {
        let (_dir, app) = app();
        assert!(matches!(
            app.annotate(&NewAnnotation::new(42, "lecturing")),
            Err(Error::UnknownMedia(42))
        ));
    }

    #[test]
    fn test_annotate_video_populates_frames() {
        let (dir, app) = app();
        let record = import_video(&app, dir.path());

        let outcome = app
            .annotate(&NewAnnotation::new(record.id, "questioning").with_frame(1.0))
            .unwrap();
        assert_eq!(outcome.frames, Some(3));
        assert!(outcome.frame_warning.is_none());
        assert!(app.frame_store().is_populated(record.id).unwrap());
    }

    #[test]
    fn test_frame_pages_flag_annotated_frames() {
        // 63 s at 30 fps with a 3 s interval: 21 frames, three pages
        let (dir, app) = app_with(SyntheticDecoder::new(30.0, 1890));
        let record = import_video(&app, dir.path());
        app.annotate(&NewAnnotation::new(record.id, "lecturing").with_frame(9.0))
            .unwrap();

        let first = app.frame_page(record.id, 1).unwrap();
        assert_eq!(first.total_items, 21);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.items.len(), FRAMES_PER_PAGE);
        assert!(first.items.iter().all(|f| !f.is_annotated));

        let second = app.frame_page(record.id, 2).unwrap();
        let flagged: Vec<usize> = second
            .items
            .iter()
            .filter(|f| f.is_annotated)
            .map(|f| f.index)
            .collect();
        assert_eq!(flagged, vec![9]);

        let last = app.frame_page(record.id, 3).unwrap();
        assert_eq!(last.items.len(), 5);
        assert!(!last.has_next());
    }

    #[test]
    fn test_annotation_pages() {
        let (dir, app) = app();
        let record = import_image(&app, dir.path(), "a.png", [0, 0, 0]);
        for _ in 0..7 {
            app.annotate(&NewAnnotation::new(record.id, "other")).unwrap();
        }

        let first = app.annotations_page(record.id, 1).unwrap();
        assert_eq!(first.items.len(), ANNOTATIONS_PER_PAGE);
        assert_eq!(first.total_pages, 2);
        let second = app.annotations_page(record.id, 2).unwrap();
        assert_eq!(second.items.len(), 2);
    }

    #[test]
    fn test_behavior_editing() {
        let (_dir, mut app) = app();
        let id = app.add_behavior("reading", "Reading aloud", Some("Pupils read")).unwrap();
        assert!(app.vocabulary.contains("reading"));

        assert!(matches!(
            app.add_behavior("reading", "Again", None),
            Err(Error::DuplicateBehavior(_))
        ));
        assert!(matches!(
            app.update_behavior(id, "lecturing", "Clash"),
            Err(Error::DuplicateBehavior(_))
        ));

        assert!(app.update_behavior(id, "reading_aloud", "Reading aloud").unwrap());
        assert!(app.vocabulary.contains("reading_aloud"));
        assert!(!app.vocabulary.contains("reading"));

        assert!(app.delete_behavior(id).unwrap());
        assert!(!app.vocabulary.contains("reading_aloud"));
        assert!(!app.delete_behavior(id).unwrap());
    }

    #[test]
    fn test_training_without_annotations_fails_cleanly() {
        let (_dir, app) = app();
        app.start_training().unwrap();

        let status = wait_for_idle(&app);
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert_eq!(status.progress, 0);
        assert!(!status.running);
    }

    #[test]
    fn test_start_while_running_is_busy() {
        let (_dir, app) = app();
        // Another process holding the job slot on the same database
        let other = Database::open(&app.config.db_path).unwrap();
        let held = other.begin_training_job(3600).unwrap().unwrap();

        assert!(matches!(app.start_training(), Err(Error::Busy)));
        let status = app.job_status(held).unwrap().unwrap();
        assert!(status.running);
        assert_eq!(app.training_status().unwrap().job_id, Some(held));
    }

    #[test]
    fn test_status_visible_to_second_app() {
        let (dir, app) = app();
        for i in 0..3 {
            let red = import_image(&app, dir.path(), &format!("r{i}.png"), [240, 0, 0]);
            app.annotate(&NewAnnotation::new(red.id, "lecturing")).unwrap();
            let blue = import_image(&app, dir.path(), &format!("b{i}.png"), [0, 0, 240]);
            app.annotate(&NewAnnotation::new(blue.id, "questioning")).unwrap();
        }

        let config = app.config.clone();
        let other = App::with_decoder(
            config.clone(),
            Database::open(&config.db_path).unwrap(),
            Arc::new(SyntheticDecoder::new(30.0, 270)),
        )
        .unwrap();
        assert_eq!(other.training_status().unwrap().phase, TrainingPhase::Idle);

        let job = app.start_training().unwrap();
        let seen = other.training_status().unwrap();
        assert_eq!(seen.job_id, Some(job));
        if seen.running {
            assert!(matches!(other.start_training(), Err(Error::Busy)));
        }

        let finished = wait_for_idle(&app);
        assert_eq!(finished.phase, TrainingPhase::Done, "{}", finished.message);
        let seen = other.training_status().unwrap();
        assert_eq!(seen, finished);
        assert_eq!(seen.progress, 100);
        assert!(seen.model_id.is_some());
    }

    #[test]
    fn test_dead_worker_recorded_as_failed() {
        let (_dir, app) = app();
        let id = app.db.begin_training_job(3600).unwrap().unwrap();
        drop(app.jobs.try_begin(id).unwrap());

        let status = app.training_status().unwrap();
        assert_eq!(status.job_id, Some(id));
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert!(!status.running);
        // The slot is free again
        assert!(app.db.begin_training_job(3600).unwrap().is_some());
    }

    #[test]
    fn test_train_then_evaluate() {
        let (dir, app) = app();
        for i in 0..5 {
            let red = import_image(&app, dir.path(), &format!("r{i}.png"), [240, 0, 0]);
            app.annotate(&NewAnnotation::new(red.id, "lecturing")).unwrap();
            let green = import_image(&app, dir.path(), &format!("g{i}.png"), [0, 240, 0]);
            app.annotate(&NewAnnotation::new(green.id, "interaction")).unwrap();
        }

        let job = app.start_training().unwrap();
        let status = wait_for_idle(&app);
        assert_eq!(status.job_id, Some(job));
        assert_eq!(status.phase, TrainingPhase::Done, "{}", status.message);
        let model_id = status.model_id.unwrap();

        let probe = import_image(&app, dir.path(), "probe.png", [240, 0, 0]);
        app.annotate(&NewAnnotation::new(probe.id, "lecturing")).unwrap();
        let result = app.evaluate(model_id, probe.id).unwrap();
        assert_eq!(result.total, 1);
        assert!(result.class_accuracy.contains_key("assessment"));

        let stats = app.stats().unwrap();
        assert_eq!(stats.total_files, 11);
        assert_eq!(stats.annotated_files, 11);
        assert_eq!(stats.total_models, 1);
        assert!(stats.latest_accuracy.is_some());
    }

    #[test]
    fn test_clear_data_removes_everything_but_vocabulary() {
        let (dir, app) = app();
        let image = import_image(&app, dir.path(), "a.png", [0, 0, 0]);
        app.annotate(&NewAnnotation::new(image.id, "other")).unwrap();
        let video = import_video(&app, dir.path());
        app.annotate(&NewAnnotation::new(video.id, "other").with_frame(0.0))
            .unwrap();

        let report = app.clear_data().unwrap();
        assert_eq!(report.media_files, 2);
        assert_eq!(report.frame_dirs, 1);

        assert!(app.list_media().unwrap().is_empty());
        assert!(!dir.path().join("uploads").join("a.png").exists());
        assert!(!app.frame_store().is_populated(video.id).unwrap());
        assert_eq!(app.stats().unwrap().total_files, 0);
        assert!(!app.db.list_behaviors().unwrap().is_empty());
    }
}
