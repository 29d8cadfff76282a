use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransportSettings {
    pub command_path: String,
    #[serde(default)]
    pub global_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSettings {
    pub timeout_secs: u64,
    pub property_timeout_secs: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            property_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSettings {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    pub min_complete_ratio: f64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            timeout_secs: 3600,
            min_complete_ratio: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    pub interrupt_grace_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            interrupt_grace_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    pub max_workers: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureSettings {
    pub artifact_root: String,
    /// Device directory where screenshots and recordings are written before the pull.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

fn default_remote_dir() -> String {
    "/sdcard".to_string()
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            artifact_root: "./device-pull".to_string(),
            remote_dir: default_remote_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command.timeout_secs)
    }

    pub fn property_timeout(&self) -> Duration {
        Duration::from_secs(self.command.property_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.transfer.poll_interval_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.session.interrupt_grace_ms)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ADB_JOB_ENGINE_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".adb_job_engine.json")
}

fn backup_path_for(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

pub fn load_config() -> Result<EngineConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &EngineConfig) -> Result<(), AppError> {
    let path = config_path();
    save_config_to_path(config, &path, &backup_path_for(&path))
}

pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, AppError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: EngineConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &EngineConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

pub fn validate_config(mut config: EngineConfig) -> EngineConfig {
    let defaults = EngineConfig::default();
    if config.command.timeout_secs == 0 {
        config.command.timeout_secs = defaults.command.timeout_secs;
    }
    if config.command.property_timeout_secs == 0 {
        config.command.property_timeout_secs = defaults.command.property_timeout_secs;
    }
    if !(50..=10_000).contains(&config.transfer.poll_interval_ms) {
        config.transfer.poll_interval_ms = defaults.transfer.poll_interval_ms;
    }
    if config.transfer.timeout_secs == 0 {
        config.transfer.timeout_secs = defaults.transfer.timeout_secs;
    }
    if !(0.0..=1.0).contains(&config.transfer.min_complete_ratio) {
        config.transfer.min_complete_ratio = defaults.transfer.min_complete_ratio;
    }
    if config.session.interrupt_grace_ms < 100 {
        config.session.interrupt_grace_ms = defaults.session.interrupt_grace_ms;
    }
    if config.scheduler.max_workers == 0 {
        config.scheduler.max_workers = defaults.scheduler.max_workers;
    }
    if config.capture.artifact_root.trim().is_empty() {
        config.capture.artifact_root = defaults.capture.artifact_root;
    }
    if !config.capture.remote_dir.trim().starts_with('/') {
        config.capture.remote_dir = defaults.capture.remote_dir;
    }
    if config.logging.level.trim().is_empty() {
        config.logging.level = defaults.logging.level;
    }
    config
}
