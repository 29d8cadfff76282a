use std::sync::mpsc::{self, Receiver, Sender};

use serde::Serialize;

use crate::app::models::{JobError, JobKind, JobState, ProgressSample};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    JobState {
        job_id: String,
        kind: JobKind,
        state: JobState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<JobError>,
    },
    Progress {
        job_id: String,
        sample: ProgressSample,
    },
}

impl EngineEvent {
    pub fn job_id(&self) -> &str {
        match self {
            EngineEvent::JobState { job_id, .. } | EngineEvent::Progress { job_id, .. } => job_id,
        }
    }
}

/// Sending half of the worker → consumer channel. A dropped receiver discards events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<EngineEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
