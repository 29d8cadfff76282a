use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::error::ErrorKind;

/// A target resolved against a live listing. The serial is the durable identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub model: String,
}

/// One line of `devices` output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRef {
    /// 1-based position in the current listing.
    Ordinal(usize),
    Serial(String),
}

impl From<usize> for DeviceRef {
    fn from(value: usize) -> Self {
        DeviceRef::Ordinal(value)
    }
}

impl From<&str> for DeviceRef {
    fn from(value: &str) -> Self {
        DeviceRef::Serial(value.to_string())
    }
}

impl From<String> for DeviceRef {
    fn from(value: String) -> Self {
        DeviceRef::Serial(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceProperty {
    pub key: String,
    /// Empty when the property could not be read.
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
    pub brand: String,
    pub chipset: String,
    pub android_version: String,
    pub security_patch: String,
    pub device: String,
    pub sim: String,
    pub encryption_state: String,
    pub build_date: String,
    pub sdk_version: String,
    pub wifi_interface: String,
    pub abi: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Command,
    Transfer,
    Session,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Running => 1,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => 2,
        }
    }

    /// Transitions only move forward; a Queued job may be cancelled directly.
    pub fn can_transition_to(self, next: JobState) -> bool {
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub cause: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Push,
    Pull,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProgressSample {
    pub timestamp: DateTime<Utc>,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub label: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub progress: Option<ProgressSample>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Interrupted,
    Completed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Interrupted | SessionState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_transitions_are_monotonic() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Running.can_transition_to(JobState::Running));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Failed));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Running));
    }

    #[test]
    fn device_ref_conversions() {
        assert_eq!(DeviceRef::from(1usize), DeviceRef::Ordinal(1));
        assert_eq!(
            DeviceRef::from("ABC123"),
            DeviceRef::Serial("ABC123".to_string())
        );
    }
}
