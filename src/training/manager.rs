//! In-process status store for training jobs started by this process.

use std::collections::HashMap;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use super::{JobId, StatusReporter, StatusUpdate, TrainingStatus};
use crate::error::{Error, Result};

struct TrainingJob {
    status: TrainingStatus,
    receiver: mpsc::Receiver<StatusUpdate>,
    started_at: Instant,
}

impl TrainingJob {
    /// Drain every pending update without blocking.
    fn drain(&mut self, id: JobId) {
        loop {
            match self.receiver.try_recv() {
                Ok(update) => self.status.apply(update),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.status.running {
                        tracing::warn!(job_id = id.0, "Training worker exited without a final status");
                        self.status.apply(StatusUpdate::Failed {
                            error: "training worker exited unexpectedly".to_string(),
                        });
                    }
                    break;
                }
            }
        }
    }
}

#[derive(Default)]
struct Jobs {
    jobs: HashMap<JobId, TrainingJob>,
    order: Vec<JobId>,
}

impl Jobs {
    /// Drop finished jobs other than the most recent one.
    fn prune(&mut self) {
        let latest = self.order.last().copied();
        self.jobs
            .retain(|id, job| job.status.running || Some(*id) == latest);
        let jobs = &self.jobs;
        self.order.retain(|id| jobs.contains_key(id));
    }

    fn poll(&mut self) {
        for (id, job) in self.jobs.iter_mut() {
            let was_running = job.status.running;
            job.drain(*id);
            if was_running && !job.status.running {
                tracing::info!(
                    job_id = id.0,
                    phase = job.status.phase.as_str(),
                    elapsed_ms = job.started_at.elapsed().as_millis() as u64,
                    "Training job finished"
                );
            }
        }
    }
}

/// Shared record of training jobs, keyed by [`JobId`].
#[derive(Default)]
pub struct StatusStore {
    inner: Mutex<Jobs>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register job `id`, or fail with [`Error::Busy`] while another job of
    /// this process runs.
    ///
    /// The check and the registration happen under one lock.
    pub fn try_begin(&self, id: JobId) -> Result<StatusReporter> {
        let mut jobs = self.lock();
        jobs.poll();

        if jobs.jobs.values().any(|j| j.status.running) {
            return Err(Error::Busy);
        }
        jobs.prune();

        let (tx, rx) = mpsc::channel();
        jobs.jobs.insert(
            id,
            TrainingJob {
                status: TrainingStatus::queued(id),
                receiver: rx,
                started_at: Instant::now(),
            },
        );
        jobs.order.push(id);
        tracing::info!(job_id = id.0, "Training job registered");

        Ok(StatusReporter::new(id, tx))
    }

    pub fn get(&self, id: JobId) -> Option<TrainingStatus> {
        let mut jobs = self.lock();
        jobs.poll();
        jobs.jobs.get(&id).map(|j| j.status.clone())
    }

    /// Status of the most recently registered job, or idle when none ran.
    pub fn latest(&self) -> TrainingStatus {
        let mut jobs = self.lock();
        jobs.poll();
        jobs.order
            .last()
            .and_then(|id| jobs.jobs.get(id))
            .map(|j| j.status.clone())
            .unwrap_or_else(TrainingStatus::idle)
    }

    pub fn is_running(&self) -> bool {
        let mut jobs = self.lock();
        jobs.poll();
        jobs.jobs.values().any(|j| j.status.running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::TrainingPhase;

    #[test]
    fn test_idle_before_any_job() {
        let store = StatusStore::new();
        let status = store.latest();
        assert_eq!(status.phase, TrainingPhase::Idle);
        assert_eq!(status.progress, 0);
        assert!(!status.running);
    }

    #[test]
    fn test_second_start_while_running_is_busy() {
        let store = StatusStore::new();
        let reporter = store.try_begin(JobId(1)).unwrap();
        reporter.phase(TrainingPhase::Training, "Training classifier");

        assert!(matches!(store.try_begin(JobId(2)), Err(Error::Busy)));

        // The rejected start leaves the running job untouched
        let status = store.get(JobId(1)).unwrap();
        assert!(status.running);
        assert_eq!(status.progress, 80);
        assert_eq!(store.latest().job_id, Some(JobId(1)));
        assert!(store.get(JobId(2)).is_none());
    }

    #[test]
    fn test_new_job_after_completion() {
        let store = StatusStore::new();
        let reporter = store.try_begin(JobId(1)).unwrap();
        reporter.done(3, 0.75, "Model trained");

        let _reporter = store.try_begin(JobId(2)).unwrap();
        assert_eq!(store.get(JobId(1)).unwrap().model_id, Some(3));
        assert_eq!(store.latest().job_id, Some(JobId(2)));
    }

    #[test]
    fn test_finished_jobs_are_pruned() {
        let store = StatusStore::new();
        for id in 1..=3 {
            let reporter = store.try_begin(JobId(id)).unwrap();
            reporter.failed("no annotated media available for training");
        }

        assert!(store.get(JobId(1)).is_none());
        assert_eq!(store.get(JobId(2)).unwrap().phase, TrainingPhase::Failed);
        assert_eq!(store.latest().job_id, Some(JobId(3)));
        assert_eq!(store.lock().order, vec![JobId(2), JobId(3)]);
    }

    #[test]
    fn test_dropped_reporter_marks_failure() {
        let store = StatusStore::new();
        let reporter = store.try_begin(JobId(1)).unwrap();
        drop(reporter);

        let status = store.get(JobId(1)).unwrap();
        assert!(!status.running);
        assert_eq!(status.phase, TrainingPhase::Failed);
        assert!(!store.is_running());
    }

    #[test]
    fn test_updates_from_another_thread() {
        let store = StatusStore::new();
        let reporter = store.try_begin(JobId(1)).unwrap();
        std::thread::spawn(move || {
            reporter.phase(TrainingPhase::Preparing, "Preparing");
            reporter.failed("no annotated media available for training");
        })
        .join()
        .unwrap();

        let status = store.get(JobId(1)).unwrap();
        assert_eq!(status.progress, 0);
        assert!(!status.running);
        assert_eq!(status.message, "no annotated media available for training");
    }
}
