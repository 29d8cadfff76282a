use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::app::adb::runner::CancelToken;
use crate::app::error::{AppError, ErrorKind};
use crate::app::events::{EngineEvent, EventSink};
use crate::app::models::{Job, JobError, JobKind, JobState, ProgressSample};
use crate::app::session::InteractiveSession;

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { exit_code: Option<i32> },
    Failed { error: JobError, exit_code: Option<i32> },
    Cancelled,
}

impl JobOutcome {
    pub fn failed(kind: ErrorKind, cause: impl Into<String>) -> Self {
        let exit_code = match kind {
            ErrorKind::CommandFailed { exit_code } => Some(exit_code),
            _ => None,
        };
        JobOutcome::Failed {
            error: JobError {
                kind,
                cause: cause.into(),
            },
            exit_code,
        }
    }

    pub fn from_error(err: &AppError) -> Self {
        Self::failed(err.kind, err.error.clone())
    }
}

struct JobRecord {
    job: Job,
    cancel: CancelToken,
    session: Option<Arc<InteractiveSession>>,
    destination: Option<String>,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, JobRecord>,
    /// destination key → owning job id
    destinations: HashMap<String, String>,
}

/// The id → Job table. Every mutation goes through the one lock, and state events are
/// sent before it is released so consumers see transitions in commit order.
pub struct JobRegistry {
    inner: Mutex<Registry>,
    changed: Condvar,
    sink: EventSink,
}

impl JobRegistry {
    pub fn new(sink: EventSink) -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            changed: Condvar::new(),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(registry: &mut Registry, kind: JobKind, label: &str) -> (String, CancelToken) {
        let id = Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        registry.jobs.insert(
            id.clone(),
            JobRecord {
                job: Job {
                    id: id.clone(),
                    kind,
                    label: label.to_string(),
                    state: JobState::Queued,
                    created_at: Utc::now(),
                    started_at: None,
                    ended_at: None,
                    error: None,
                    progress: None,
                    exit_code: None,
                },
                cancel: cancel.clone(),
                session: None,
                destination: None,
            },
        );
        (id, cancel)
    }

    fn emit_state(&self, job: &Job) {
        self.sink.emit(EngineEvent::JobState {
            job_id: job.id.clone(),
            kind: job.kind,
            state: job.state,
            error: job.error.clone(),
        });
    }

    pub fn create(&self, kind: JobKind, label: &str) -> (String, CancelToken) {
        let mut registry = self.lock();
        let (id, cancel) = Self::insert(&mut registry, kind, label);
        self.emit_state(&registry.jobs[&id].job);
        drop(registry);
        debug!(job_id = %id, ?kind, label, "job queued");
        (id, cancel)
    }

    /// Creates a transfer job and reserves `destination_key` in the same critical section.
    /// The reservation is released when the job reaches a terminal state.
    pub fn create_with_destination(
        &self,
        kind: JobKind,
        label: &str,
        destination_key: &str,
        trace_id: &str,
    ) -> Result<(String, CancelToken), AppError> {
        let mut registry = self.lock();
        if let Some(owner) = registry.destinations.get(destination_key) {
            return Err(AppError::new(
                ErrorKind::DestinationBusy,
                format!("Destination {destination_key} is in use by job {owner}"),
                trace_id,
            ));
        }
        let (id, cancel) = Self::insert(&mut registry, kind, label);
        registry
            .destinations
            .insert(destination_key.to_string(), id.clone());
        if let Some(record) = registry.jobs.get_mut(&id) {
            record.destination = Some(destination_key.to_string());
            self.emit_state(&record.job);
        }
        Ok((id, cancel))
    }

    /// Queued → Running. Returns false when the job is gone or already terminal.
    pub fn mark_running(&self, id: &str) -> bool {
        let mut registry = self.lock();
        let Some(record) = registry.jobs.get_mut(id) else {
            return false;
        };
        if !record.job.state.can_transition_to(JobState::Running) {
            return false;
        }
        record.job.state = JobState::Running;
        record.job.started_at = Some(Utc::now());
        self.emit_state(&record.job);
        drop(registry);
        self.changed.notify_all();
        true
    }

    /// Moves the job into its terminal state and frees its destination. A second call
    /// is ignored. An attached session stays reachable until the job is acknowledged.
    pub fn finish(&self, id: &str, outcome: JobOutcome) -> bool {
        let job = {
            let mut registry = self.lock();
            let registry = &mut *registry;
            let Some(record) = registry.jobs.get_mut(id) else {
                return false;
            };
            let next = match &outcome {
                JobOutcome::Succeeded { .. } => JobState::Succeeded,
                JobOutcome::Failed { .. } => JobState::Failed,
                JobOutcome::Cancelled => JobState::Cancelled,
            };
            if !record.job.state.can_transition_to(next) {
                return false;
            }
            record.job.state = next;
            record.job.ended_at = Some(Utc::now());
            match outcome {
                JobOutcome::Succeeded { exit_code } => record.job.exit_code = exit_code,
                JobOutcome::Failed { error, exit_code } => {
                    record.job.error = Some(error);
                    record.job.exit_code = exit_code;
                }
                JobOutcome::Cancelled => {}
            }
            if let Some(key) = record.destination.take() {
                if registry.destinations.get(&key).map(String::as_str) == Some(id) {
                    registry.destinations.remove(&key);
                }
            }
            self.emit_state(&record.job);
            record.job.clone()
        };
        self.changed.notify_all();
        match &job.error {
            Some(error) => info!(job_id = %job.id, state = ?job.state, cause = %error.cause, "job finished"),
            None => info!(job_id = %job.id, state = ?job.state, "job finished"),
        }
        true
    }

    /// Stores the latest sample. Samples for a job that already left Running are dropped.
    pub fn record_progress(&self, id: &str, sample: ProgressSample) {
        let mut registry = self.lock();
        let Some(record) = registry.jobs.get_mut(id) else {
            return;
        };
        if record.job.state != JobState::Running {
            return;
        }
        record.job.progress = Some(sample.clone());
        self.sink.emit(EngineEvent::Progress {
            job_id: id.to_string(),
            sample,
        });
    }

    pub fn attach_session(&self, id: &str, session: Arc<InteractiveSession>) {
        if let Some(record) = self.lock().jobs.get_mut(id) {
            record.session = Some(session);
        }
    }

    pub fn session(&self, id: &str) -> Option<Arc<InteractiveSession>> {
        self.lock()
            .jobs
            .get(id)
            .and_then(|record| record.session.clone())
    }

    /// Fires the job's cancel token. A queued job is cancelled on the spot;
    /// a running one is cancelled by its worker.
    pub fn request_cancel(&self, id: &str, trace_id: &str) -> Result<JobState, AppError> {
        let state = {
            let registry = self.lock();
            let record = registry
                .jobs
                .get(id)
                .ok_or_else(|| AppError::validation(format!("Unknown job {id}"), trace_id))?;
            record.cancel.cancel();
            record.job.state
        };
        if state == JobState::Queued {
            self.finish(id, JobOutcome::Cancelled);
        }
        Ok(self.get(id).map(|job| job.state).unwrap_or(state))
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().jobs.get(id).map(|record| record.job.clone())
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .map(|record| record.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Blocks until the job is terminal or `timeout` elapses; returns the latest snapshot.
    pub fn wait_terminal(&self, id: &str, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut registry = self.lock();
        loop {
            let job = registry.jobs.get(id)?.job.clone();
            let now = Instant::now();
            if job.state.is_terminal() || now >= deadline {
                return Some(job);
            }
            registry = self
                .changed
                .wait_timeout(registry, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Drops a terminal job from the table.
    pub fn acknowledge(&self, id: &str, trace_id: &str) -> Result<Job, AppError> {
        let mut registry = self.lock();
        let state = registry
            .jobs
            .get(id)
            .map(|record| record.job.state)
            .ok_or_else(|| AppError::validation(format!("Unknown job {id}"), trace_id))?;
        if !state.is_terminal() {
            return Err(AppError::validation(
                format!("Job {id} is still {state:?}"),
                trace_id,
            ));
        }
        registry
            .jobs
            .remove(id)
            .map(|record| record.job)
            .ok_or_else(|| AppError::validation(format!("Unknown job {id}"), trace_id))
    }
}
