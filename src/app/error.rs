use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    System,
    DeviceNotFound,
    CommandNotFound,
    CommandFailed { exit_code: i32 },
    SizeUnavailable,
    SessionBusy,
    DestinationBusy,
    Timeout,
    TransferIncomplete,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ERR_VALIDATION",
            ErrorKind::System => "ERR_SYSTEM",
            ErrorKind::DeviceNotFound => "ERR_DEVICE_NOT_FOUND",
            ErrorKind::CommandNotFound => "ERR_COMMAND_NOT_FOUND",
            ErrorKind::CommandFailed { .. } => "ERR_COMMAND_FAILED",
            ErrorKind::SizeUnavailable => "ERR_SIZE_UNAVAILABLE",
            ErrorKind::SessionBusy => "ERR_SESSION_BUSY",
            ErrorKind::DestinationBusy => "ERR_DESTINATION_BUSY",
            ErrorKind::Timeout => "ERR_TIMEOUT",
            ErrorKind::TransferIncomplete => "ERR_TRANSFER_INCOMPLETE",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::CommandFailed { exit_code } => {
                write!(f, "command failed with exit code {exit_code}")
            }
            ErrorKind::Validation => f.write_str("invalid request"),
            ErrorKind::System => f.write_str("system error"),
            ErrorKind::DeviceNotFound => f.write_str("device not found"),
            ErrorKind::CommandNotFound => f.write_str("command not found"),
            ErrorKind::SizeUnavailable => f.write_str("size unavailable"),
            ErrorKind::SessionBusy => f.write_str("session busy"),
            ErrorKind::DestinationBusy => f.write_str("destination busy"),
            ErrorKind::Timeout => f.write_str("timed out"),
            ErrorKind::TransferIncomplete => f.write_str("transfer incomplete"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub kind: ErrorKind,
    pub trace_id: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: kind.code().to_string(),
            kind,
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message, trace_id)
    }

    pub fn device_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceNotFound, message, trace_id)
    }

    pub fn command_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandNotFound, message, trace_id)
    }

    pub fn command_failed(
        exit_code: i32,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::CommandFailed { exit_code }, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message, trace_id)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
