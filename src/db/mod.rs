mod schema;
pub mod annotations;
pub mod behaviors;
pub mod jobs;
pub mod media;
pub mod models;

use anyhow::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use schema::SCHEMA;
pub use annotations::{Annotation, NewAnnotation};
pub use behaviors::{Behavior, DEFAULT_BEHAVIORS};
pub use media::{MediaKind, MediaRecord, MediaStatus};
pub use models::{EvaluationRecord, ModelRecord, NewEvaluation, NewModel};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Format used for every timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Counters shown on the overview screen.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total_files: i64,
    pub annotated_files: i64,
    pub total_models: i64,
    pub latest_accuracy: Option<f64>,
}

/// Files that belonged to rows removed by [`Database::clear_all`].
#[derive(Debug, Clone, Default)]
pub struct ClearedFiles {
    pub model_paths: Vec<PathBuf>,
    pub media_paths: Vec<PathBuf>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // Training workers and other processes write to the same file
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        self.seed_default_behaviors()?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            total_files: self.count_media()?,
            annotated_files: self.count_media_with_status(MediaStatus::Annotated)?,
            total_models: self.count_models()?,
            latest_accuracy: self.latest_model()?.and_then(|m| m.accuracy),
        })
    }

    /// Delete every evaluation, model, annotation and media row.
    ///
    /// Returns the artifact and upload paths the rows pointed at so the caller
    /// can remove them from disk.
    pub fn clear_all(&self) -> Result<ClearedFiles> {
        let tx = self.conn.unchecked_transaction()?;

        let model_paths = {
            let mut stmt = tx.prepare("SELECT model_path FROM models")?;
            let paths = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .map(PathBuf::from)
                .collect();
            paths
        };
        let media_paths = {
            let mut stmt = tx.prepare("SELECT filepath FROM media_files")?;
            let paths = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .map(PathBuf::from)
                .collect();
            paths
        };

        tx.execute("DELETE FROM evaluations", [])?;
        tx.execute("DELETE FROM models", [])?;
        tx.execute("DELETE FROM annotations", [])?;
        tx.execute("DELETE FROM media_files", [])?;
        tx.execute("DELETE FROM training_jobs WHERE running = 0", [])?;
        tx.commit()?;

        Ok(ClearedFiles {
            model_paths,
            media_paths,
        })
    }
}
