use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::app::adb::parse::{parse_adb_devices, parse_du_size_kb, parse_getprop_value};
use crate::app::adb::runner::{ensure_success, run_command_with_timeout};
use crate::app::error::AppError;
use crate::app::models::{CommandOutput, DeviceEntry};

/// Quotes one argument for the device-side shell, which re-splits `shell` arguments.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Argument builders and blocking helpers for the external transport executable.
///
/// `global_args` are placed before every invocation (e.g. `-H <host> -P <port>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    program: String,
    global_args: Vec<String>,
}

impl Transport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
        }
    }

    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn invocation(&self, args: &[String]) -> Vec<String> {
        let mut full = self.global_args.clone();
        full.extend(args.iter().cloned());
        full
    }

    pub fn devices_args() -> Vec<String> {
        vec!["devices".to_string()]
    }

    pub fn shell_args(serial: &str, command: &str) -> Vec<String> {
        vec![
            "-s".to_string(),
            serial.to_string(),
            "shell".to_string(),
            command.to_string(),
        ]
    }

    pub fn getprop_args(serial: &str, key: &str) -> Vec<String> {
        Self::shell_args(serial, &format!("getprop {key}"))
    }

    pub fn du_args(serial: &str, device_path: &str) -> Vec<String> {
        Self::shell_args(serial, &format!("du -s {}", shell_quote(device_path)))
    }

    pub fn push_args(serial: &str, local_path: &Path, device_path: &str) -> Vec<String> {
        vec![
            "-s".to_string(),
            serial.to_string(),
            "push".to_string(),
            local_path.to_string_lossy().to_string(),
            device_path.to_string(),
        ]
    }

    pub fn pull_args(serial: &str, device_path: &str, local_path: &Path) -> Vec<String> {
        vec![
            "-s".to_string(),
            serial.to_string(),
            "pull".to_string(),
            device_path.to_string(),
            local_path.to_string_lossy().to_string(),
        ]
    }

    pub fn run(
        &self,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(&self.program, &self.invocation(args), timeout, trace_id)
    }

    pub fn list_devices(
        &self,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<Vec<DeviceEntry>, AppError> {
        let output = self.run(&Self::devices_args(), timeout, trace_id)?;
        let output = ensure_success("devices", output, trace_id)?;
        Ok(parse_adb_devices(&output.stdout))
    }

    pub fn getprop(
        &self,
        serial: &str,
        key: &str,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let output = self.run(&Self::getprop_args(serial, key), timeout, trace_id)?;
        let output = ensure_success("getprop", output, trace_id)?;
        Ok(parse_getprop_value(&output.stdout))
    }

    /// Aggregate size of a device path in bytes; `0` when `du` fails or prints nothing usable.
    pub fn remote_size_bytes(
        &self,
        serial: &str,
        device_path: &str,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<u64, AppError> {
        let output = self.run(&Self::du_args(serial, device_path), timeout, trace_id)?;
        if !output.succeeded() {
            warn!(
                trace_id = %trace_id,
                serial,
                device_path,
                exit_code = ?output.exit_code,
                "remote size query failed"
            );
            return Ok(0);
        }
        Ok(parse_du_size_kb(&output.stdout).unwrap_or(0) * 1024)
    }
}
