//! Background model training.
//!
//! A job is claimed as a row in `training_jobs`, then registered with the
//! in-process [`StatusStore`], which hands back a [`StatusReporter`]. The
//! worker writes each phase change to its row and sends it to the store, so
//! other processes read the row and this one also notices a worker that dies.

pub mod manager;
pub mod orchestrator;
pub mod worker;

use serde::Serialize;
use std::sync::mpsc;

pub use manager::StatusStore;
pub use orchestrator::{Trainer, TrainingOutcome};
pub use worker::spawn_training;

/// Identifier of a training job: its row id in `training_jobs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    Idle,
    Preparing,
    ExtractingFeatures,
    Training,
    Evaluating,
    Saving,
    Done,
    Failed,
}

impl TrainingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingPhase::Idle => "idle",
            TrainingPhase::Preparing => "preparing",
            TrainingPhase::ExtractingFeatures => "extracting_features",
            TrainingPhase::Training => "training",
            TrainingPhase::Evaluating => "evaluating",
            TrainingPhase::Saving => "saving",
            TrainingPhase::Done => "done",
            TrainingPhase::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(TrainingPhase::Idle),
            "preparing" => Some(TrainingPhase::Preparing),
            "extracting_features" => Some(TrainingPhase::ExtractingFeatures),
            "training" => Some(TrainingPhase::Training),
            "evaluating" => Some(TrainingPhase::Evaluating),
            "saving" => Some(TrainingPhase::Saving),
            "done" => Some(TrainingPhase::Done),
            "failed" => Some(TrainingPhase::Failed),
            _ => None,
        }
    }

    /// Progress percentage reported on entering this phase.
    pub fn milestone(&self) -> u8 {
        match self {
            TrainingPhase::Idle | TrainingPhase::Failed => 0,
            TrainingPhase::Preparing => 10,
            TrainingPhase::ExtractingFeatures => 20,
            TrainingPhase::Training => 80,
            TrainingPhase::Evaluating => 90,
            TrainingPhase::Saving => 95,
            TrainingPhase::Done => 100,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TrainingPhase::Done | TrainingPhase::Failed)
    }
}

/// Snapshot of a training job as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingStatus {
    pub job_id: Option<JobId>,
    pub phase: TrainingPhase,
    pub progress: u8,
    pub message: String,
    pub running: bool,
    pub accuracy: Option<f64>,
    pub model_id: Option<i64>,
}

impl TrainingStatus {
    pub fn idle() -> Self {
        Self {
            job_id: None,
            phase: TrainingPhase::Idle,
            progress: 0,
            message: "No training has run".to_string(),
            running: false,
            accuracy: None,
            model_id: None,
        }
    }

    pub(crate) fn queued(id: JobId) -> Self {
        Self {
            job_id: Some(id),
            message: "Queued".to_string(),
            running: true,
            ..Self::idle()
        }
    }

    pub(crate) fn apply(&mut self, update: StatusUpdate) {
        match update {
            StatusUpdate::Phase { phase, message } => {
                self.phase = phase;
                self.progress = phase.milestone();
                self.message = message;
            }
            StatusUpdate::Done {
                model_id,
                accuracy,
                message,
            } => {
                self.phase = TrainingPhase::Done;
                self.progress = TrainingPhase::Done.milestone();
                self.running = false;
                self.accuracy = Some(accuracy);
                self.model_id = Some(model_id);
                self.message = message;
            }
            StatusUpdate::Failed { error } => {
                self.phase = TrainingPhase::Failed;
                self.progress = 0;
                self.running = false;
                self.message = error;
            }
        }
    }
}

/// Messages sent from the training worker.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Phase { phase: TrainingPhase, message: String },
    Done { model_id: i64, accuracy: f64, message: String },
    Failed { error: String },
}

/// Sending half handed to the code that runs a job.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    id: JobId,
    sender: mpsc::Sender<StatusUpdate>,
}

impl StatusReporter {
    pub(crate) fn new(id: JobId, sender: mpsc::Sender<StatusUpdate>) -> Self {
        Self { id, sender }
    }

    pub fn job_id(&self) -> JobId {
        self.id
    }

    pub fn phase(&self, phase: TrainingPhase, message: impl Into<String>) {
        self.send(StatusUpdate::Phase {
            phase,
            message: message.into(),
        });
    }

    pub fn done(&self, model_id: i64, accuracy: f64, message: impl Into<String>) {
        self.send(StatusUpdate::Done {
            model_id,
            accuracy,
            message: message.into(),
        });
    }

    pub fn failed(&self, error: impl Into<String>) {
        self.send(StatusUpdate::Failed {
            error: error.into(),
        });
    }

    pub(crate) fn send(&self, update: StatusUpdate) {
        // Nobody listening is not an error for the worker
        if self.sender.send(update).is_err() {
            tracing::debug!(job_id = self.id.0, "Status store dropped, update discarded");
        }
    }
}

/// Reporter whose updates go nowhere, for running a [`Trainer`] inline.
/// Its job id matches no stored row.
pub fn detached_reporter() -> StatusReporter {
    let (tx, _rx) = mpsc::channel();
    StatusReporter::new(JobId(0), tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_round_trip() {
        for phase in [
            TrainingPhase::Idle,
            TrainingPhase::ExtractingFeatures,
            TrainingPhase::Done,
            TrainingPhase::Failed,
        ] {
            assert_eq!(TrainingPhase::from_str(phase.as_str()), Some(phase));
        }
        assert_eq!(TrainingPhase::from_str("paused"), None);
    }

    #[test]
    fn test_milestones_increase() {
        let phases = [
            TrainingPhase::Preparing,
            TrainingPhase::ExtractingFeatures,
            TrainingPhase::Training,
            TrainingPhase::Evaluating,
            TrainingPhase::Saving,
            TrainingPhase::Done,
        ];
        let milestones: Vec<u8> = phases.iter().map(|p| p.milestone()).collect();
        assert_eq!(milestones, vec![10, 20, 80, 90, 95, 100]);
    }

    #[test]
    fn test_failure_resets_progress() {
        let mut status = TrainingStatus::queued(JobId(1));
        status.apply(StatusUpdate::Phase {
            phase: TrainingPhase::Training,
            message: "Training".to_string(),
        });
        assert_eq!(status.progress, 80);
        assert!(status.running);

        status.apply(StatusUpdate::Failed {
            error: "boom".to_string(),
        });
        assert_eq!(status.progress, 0);
        assert!(!status.running);
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert_eq!(status.message, "boom");
    }

    #[test]
    fn test_done_records_model() {
        let mut status = TrainingStatus::queued(JobId(1));
        status.apply(StatusUpdate::Done {
            model_id: 7,
            accuracy: 0.5,
            message: "ok".to_string(),
        });
        assert_eq!(status.phase.as_str(), "done");
        assert_eq!(status.progress, 100);
        assert_eq!(status.model_id, Some(7));
        assert_eq!(status.accuracy, Some(0.5));
        assert!(!status.running);
    }
}
