//! Training job rows. Every process on the same database sees one job table,
//! so status reads and the single-running-job rule hold across processes.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use super::{now_timestamp, Database, TIMESTAMP_FORMAT};
use crate::training::{JobId, TrainingPhase, TrainingStatus};

const ABANDONED_MESSAGE: &str = "training worker stopped reporting";

fn row_to_status(row: &Row) -> rusqlite::Result<TrainingStatus> {
    let phase: String = row.get("phase")?;
    Ok(TrainingStatus {
        job_id: Some(JobId(row.get("id")?)),
        phase: TrainingPhase::from_str(&phase).unwrap_or(TrainingPhase::Failed),
        progress: row.get("progress")?,
        message: row.get("message")?,
        running: row.get("running")?,
        accuracy: row.get("accuracy")?,
        model_id: row.get("model_id")?,
    })
}

impl Database {
    /// Register a running job unless another one is running.
    ///
    /// Running rows untouched for `stale_after_secs` belong to a worker that
    /// died; they are marked failed first. Returns `None` while a live job runs.
    pub fn begin_training_job(&self, stale_after_secs: u64) -> Result<Option<JobId>> {
        let now = now_timestamp();
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(stale_after_secs as i64))
            .format(TIMESTAMP_FORMAT)
            .to_string();

        let abandoned = self.conn.execute(
            r#"
            UPDATE training_jobs
            SET phase = ?, progress = 0, running = 0, message = ?, updated_at = ?
            WHERE running = 1 AND updated_at < ?
            "#,
            params![TrainingPhase::Failed.as_str(), ABANDONED_MESSAGE, now, cutoff],
        )?;
        if abandoned > 0 {
            tracing::warn!(jobs = abandoned, "Marked abandoned training jobs as failed");
        }

        // One statement, so the check and the insert cannot interleave with
        // another connection
        let inserted = self.conn.execute(
            r#"
            INSERT INTO training_jobs (phase, progress, message, running, started_at, updated_at)
            SELECT ?1, 0, 'Queued', 1, ?2, ?2
            WHERE NOT EXISTS (SELECT 1 FROM training_jobs WHERE running = 1)
            "#,
            params![TrainingPhase::Idle.as_str(), now],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(JobId(self.conn.last_insert_rowid())))
    }

    /// Overwrite the stored row for `status.job_id`.
    pub fn update_training_job(&self, status: &TrainingStatus) -> Result<()> {
        let Some(id) = status.job_id else {
            return Ok(());
        };
        self.conn.execute(
            r#"
            UPDATE training_jobs
            SET phase = ?, progress = ?, message = ?, running = ?, accuracy = ?,
                model_id = ?, updated_at = ?
            WHERE id = ?
            "#,
            params![
                status.phase.as_str(),
                status.progress,
                status.message,
                status.running,
                status.accuracy,
                status.model_id,
                now_timestamp(),
                id.0,
            ],
        )?;
        Ok(())
    }

    /// Store a finished status, but only over a row still marked running.
    /// Returns whether the row changed.
    pub fn close_training_job(&self, status: &TrainingStatus) -> Result<bool> {
        let Some(id) = status.job_id else {
            return Ok(false);
        };
        let changed = self.conn.execute(
            r#"
            UPDATE training_jobs
            SET phase = ?, progress = ?, message = ?, running = 0, accuracy = ?,
                model_id = ?, updated_at = ?
            WHERE id = ? AND running = 1
            "#,
            params![
                status.phase.as_str(),
                status.progress,
                status.message,
                status.accuracy,
                status.model_id,
                now_timestamp(),
                id.0,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn training_job(&self, id: JobId) -> Result<Option<TrainingStatus>> {
        let status = self
            .conn
            .query_row(
                "SELECT * FROM training_jobs WHERE id = ?",
                [id.0],
                row_to_status,
            )
            .optional()?;
        Ok(status)
    }

    pub fn latest_training_job(&self) -> Result<Option<TrainingStatus>> {
        let status = self
            .conn
            .query_row(
                "SELECT * FROM training_jobs ORDER BY id DESC LIMIT 1",
                [],
                row_to_status,
            )
            .optional()?;
        Ok(status)
    }
}
