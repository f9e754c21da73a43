use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use super::{StatusReporter, Trainer};
use crate::db::Database;
use crate::error::Result;

/// Run `trainer` on a dedicated thread with its own database connection.
///
/// The returned handle may be joined or dropped; status flows through
/// `reporter` either way.
pub fn spawn_training(db_path: PathBuf, trainer: Trainer, reporter: StatusReporter) -> Result<JoinHandle<()>> {
    let job_id = reporter.job_id();
    let handle = thread::Builder::new()
        .name(format!("training-{job_id}"))
        .spawn(move || {
            let db = match Database::open(&db_path).and_then(|db| {
                db.initialize()?;
                Ok(db)
            }) {
                Ok(db) => db,
                Err(e) => {
                    tracing::error!(job_id = job_id.0, error = %e, "Training worker cannot open database");
                    reporter.failed(format!("cannot open database: {e}"));
                    return;
                }
            };

            // Errors are already reported as a failed status
            let _ = trainer.train(&db, &reporter);
        })?;
    Ok(handle)
}
