use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::locator::{resolve_transport_program, validate_transport_program};
use crate::app::adb::paths::device_artifact_dir;
use crate::app::adb::runner::{failure_cause, run_command_cancellable, RunOutcome};
use crate::app::adb::transport::Transport;
use crate::app::capture::{capture_screenshot, CaptureContext, ScreenRecording};
use crate::app::config::{validate_config, EngineConfig};
use crate::app::device::DeviceRegistry;
use crate::app::error::{AppError, ErrorKind};
use crate::app::events::{EngineEvent, EventSink};
use crate::app::jobs::{JobOutcome, JobRegistry};
use crate::app::models::{
    CommandOutput, Device, DeviceEntry, DeviceInfo, DeviceProperty, DeviceRef, Job, JobKind,
    JobState, SessionState,
};
use crate::app::scheduler::TaskScheduler;
use crate::app::session::{InteractiveSession, SessionExit, SessionLines, SessionObserver};
use crate::app::transfer::{self, TransferLimits, TransferPlan, TransferTask};

/// Time allowed for a session's job record to catch up after the process is gone.
const SESSION_SETTLE: Duration = Duration::from_secs(1);

pub fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} is required"), trace_id));
    }
    Ok(())
}

/// Result handle of a pooled job. Yields nothing when the job was cancelled or
/// failed before producing a value; the job record carries the reason.
pub struct JobTicket<T> {
    job_id: String,
    rx: Receiver<T>,
}

impl<T> JobTicket<T> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn wait(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// A running interactive shell and the job that tracks it.
pub struct ShellSession {
    pub job_id: String,
    pub session: Arc<InteractiveSession>,
    pub lines: SessionLines,
}

/// Entry point for callers: resolves devices, starts jobs, and answers job queries.
/// Every operation runs off the caller's thread; results arrive as job state.
pub struct Engine {
    config: EngineConfig,
    transport: Transport,
    devices: DeviceRegistry,
    jobs: Arc<JobRegistry>,
    scheduler: TaskScheduler,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<(Self, Receiver<EngineEvent>), AppError> {
        let trace_id = resolve_trace_id(None);
        let program = resolve_transport_program(&config.transport.command_path);
        validate_transport_program(&program, &trace_id)?;
        let transport =
            Transport::new(program).with_global_args(config.transport.global_args.clone());
        Ok(Self::with_transport(config, transport))
    }

    /// Builds an engine around an already-resolved transport.
    pub fn with_transport(
        config: EngineConfig,
        transport: Transport,
    ) -> (Self, Receiver<EngineEvent>) {
        let config = validate_config(config);
        let (sink, events) = EventSink::channel();
        let devices = DeviceRegistry::new(
            transport.clone(),
            config.command_timeout(),
            config.property_timeout(),
        );
        let scheduler = TaskScheduler::new(config.scheduler.max_workers);
        info!(
            program = %transport.program(),
            workers = scheduler.workers(),
            "engine ready"
        );
        (
            Self {
                config,
                transport,
                devices,
                jobs: Arc::new(JobRegistry::new(sink)),
                scheduler,
            },
            events,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn list_device_entries(&self, trace_id: &str) -> Result<Vec<DeviceEntry>, AppError> {
        self.devices.list_entries(trace_id)
    }

    pub fn list_devices(&self, trace_id: &str) -> Result<Vec<Device>, AppError> {
        self.devices.list_devices(trace_id)
    }

    /// Resolve once per multi-step operation and pass the returned `Device` along.
    pub fn resolve(
        &self,
        reference: impl Into<DeviceRef>,
        trace_id: &str,
    ) -> Result<Device, AppError> {
        self.devices.resolve(&reference.into(), trace_id)
    }

    pub fn device_info(&self, device: &Device, trace_id: &str) -> DeviceInfo {
        self.devices.device_info(&device.serial, trace_id)
    }

    pub fn query_properties(
        &self,
        device: &Device,
        keys: &[&str],
        trace_id: &str,
    ) -> Vec<DeviceProperty> {
        self.devices
            .query_properties(&device.serial, keys, trace_id)
    }

    /// Runs `<transport> -s <serial> shell <command>` on the pool as a Command job.
    pub fn run_command(
        &self,
        device: &Device,
        command: &str,
        timeout: Option<Duration>,
        trace_id: &str,
    ) -> Result<JobTicket<CommandOutput>, AppError> {
        ensure_non_empty(command, "command", trace_id)?;
        let label = format!("shell {}", command.trim());
        let (job_id, cancel) = self.jobs.create(JobKind::Command, &label);
        let (tx, rx) = mpsc::channel();

        let registry = Arc::clone(&self.jobs);
        let program = self.transport.program().to_string();
        let args = self
            .transport
            .invocation(&Transport::shell_args(&device.serial, command.trim()));
        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        let worker_id = job_id.clone();
        let worker_trace = trace_id.to_string();
        let spawned = self.scheduler.spawn(&worker_name("cmd", &job_id), trace_id, move || {
            if !registry.mark_running(&worker_id) {
                return;
            }
            let outcome = match run_command_cancellable(
                &program,
                &args,
                timeout,
                &cancel,
                &worker_trace,
            ) {
                Ok(RunOutcome::Exited(output)) => {
                    let outcome = if output.succeeded() {
                        JobOutcome::Succeeded {
                            exit_code: output.exit_code,
                        }
                    } else {
                        JobOutcome::failed(
                            ErrorKind::CommandFailed {
                                exit_code: output.exit_code.unwrap_or(-1),
                            },
                            failure_cause(&label, &output),
                        )
                    };
                    registry.finish(&worker_id, outcome);
                    let _ = tx.send(output);
                    return;
                }
                Ok(RunOutcome::Cancelled(_)) => JobOutcome::Cancelled,
                Err(err) => JobOutcome::from_error(&err),
            };
            registry.finish(&worker_id, outcome);
        });
        self.fail_if_unspawned(&job_id, spawned)?;
        Ok(JobTicket { job_id, rx })
    }

    pub fn push(
        &self,
        device: &Device,
        local_path: &Path,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let plan = transfer::plan_push(
            &self.transport,
            &device.serial,
            local_path,
            remote_path,
            self.config.property_timeout(),
            trace_id,
        )?;
        self.start_transfer(plan, trace_id)
    }

    pub fn pull(
        &self,
        device: &Device,
        remote_path: &str,
        local_path: &Path,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let plan = transfer::plan_pull(
            &self.transport,
            &device.serial,
            remote_path,
            local_path,
            self.config.property_timeout(),
            trace_id,
        )?;
        self.start_transfer(plan, trace_id)
    }

    /// Pulls into `<artifact_root>/<model>-<serial>/`.
    pub fn pull_to_artifacts(
        &self,
        device: &Device,
        remote_path: &str,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let dir = self.artifact_dir(device);
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::system(format!("Failed to create output dir: {err}"), trace_id)
        })?;
        self.pull(device, remote_path, &dir, trace_id)
    }

    pub fn artifact_dir(&self, device: &Device) -> PathBuf {
        device_artifact_dir(Path::new(&self.config.capture.artifact_root), device)
    }

    fn start_transfer(&self, plan: TransferPlan, trace_id: &str) -> Result<String, AppError> {
        let (job_id, cancel) = self.jobs.create_with_destination(
            JobKind::Transfer,
            &plan.label,
            &plan.destination_key,
            trace_id,
        )?;
        info!(
            trace_id = %trace_id,
            job_id = %job_id,
            direction = ?plan.direction,
            bytes_total = plan.bytes_total(),
            "transfer queued"
        );
        let task = TransferTask {
            job_id: job_id.clone(),
            plan,
            transport: self.transport.clone(),
            registry: Arc::clone(&self.jobs),
            cancel,
            limits: TransferLimits {
                timeout: self.config.transfer_timeout(),
                poll_interval: self.config.poll_interval(),
                min_complete_ratio: self.config.transfer.min_complete_ratio,
            },
            trace_id: trace_id.to_string(),
        };
        let spawned = self
            .scheduler
            .spawn(&worker_name("xfer", &job_id), trace_id, move || {
                transfer::execute(task)
            });
        self.fail_if_unspawned(&job_id, spawned)?;
        Ok(job_id)
    }

    /// Screenshot into the device's artifact directory, as a Command job.
    pub fn capture_screenshot(
        &self,
        device: &Device,
        trace_id: &str,
    ) -> Result<JobTicket<PathBuf>, AppError> {
        let (job_id, cancel) = self.jobs.create(JobKind::Command, "screenshot");
        let (tx, rx) = mpsc::channel();
        let registry = Arc::clone(&self.jobs);
        let context = self.capture_context();
        let device = device.clone();
        let worker_id = job_id.clone();
        let worker_trace = trace_id.to_string();
        let spawned = self.scheduler.spawn(&worker_name("shot", &job_id), trace_id, move || {
            if !registry.mark_running(&worker_id) {
                return;
            }
            match capture_screenshot(&context, &device, &cancel, &worker_trace) {
                Ok(Some(path)) => {
                    registry.finish(&worker_id, JobOutcome::Succeeded { exit_code: Some(0) });
                    let _ = tx.send(path);
                }
                Ok(None) => {
                    registry.finish(&worker_id, JobOutcome::Cancelled);
                }
                Err(err) => {
                    registry.finish(&worker_id, JobOutcome::from_error(&err));
                }
            }
        });
        self.fail_if_unspawned(&job_id, spawned)?;
        Ok(JobTicket { job_id, rx })
    }

    /// Starts `shell <command>` as a streaming session. Sessions never occupy a pool worker;
    /// they live until the process exits or is interrupted.
    pub fn start_shell_session(
        &self,
        device: &Device,
        command: &str,
        trace_id: &str,
    ) -> Result<ShellSession, AppError> {
        ensure_non_empty(command, "command", trace_id)?;
        let (job_id, session) = self.session_job(&format!("session {}", command.trim()));
        let args = self
            .transport
            .invocation(&Transport::shell_args(&device.serial, command.trim()));
        match session.start(self.transport.program(), &args, trace_id) {
            Ok(lines) => Ok(ShellSession {
                job_id,
                session,
                lines,
            }),
            Err(err) => Err(self.discard_session_job(&job_id, err, trace_id)),
        }
    }

    pub fn start_recording(
        &self,
        device: &Device,
        trace_id: &str,
    ) -> Result<ScreenRecording, AppError> {
        let (job_id, session) = self.session_job("screenrecord");
        ScreenRecording::start(
            self.capture_context(),
            device.clone(),
            session,
            job_id.clone(),
            trace_id,
        )
        .map_err(|err| self.discard_session_job(&job_id, err, trace_id))
    }

    /// Interrupts the session behind `job_id`. Finished sessions are left alone.
    pub fn interrupt_session(&self, job_id: &str, trace_id: &str) -> Result<SessionState, AppError> {
        let session = self.jobs.session(job_id).ok_or_else(|| {
            AppError::validation(format!("Job {job_id} has no session"), trace_id)
        })?;
        let state = session.interrupt(trace_id);
        self.jobs.wait_terminal(job_id, SESSION_SETTLE);
        Ok(state)
    }

    /// Cancels any job. Sessions go through their interrupt path; other jobs get
    /// their process killed by the worker.
    pub fn cancel(&self, job_id: &str, trace_id: &str) -> Result<JobState, AppError> {
        if self.jobs.session(job_id).is_some() {
            self.interrupt_session(job_id, trace_id)?;
            return self
                .jobs
                .get(job_id)
                .map(|job| job.state)
                .ok_or_else(|| AppError::validation(format!("Unknown job {job_id}"), trace_id));
        }
        info!(trace_id = %trace_id, job_id, "cancel requested");
        self.jobs.request_cancel(job_id, trace_id)
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.list()
    }

    pub fn wait_for(&self, job_id: &str, timeout: Duration) -> Option<Job> {
        self.jobs.wait_terminal(job_id, timeout)
    }

    pub fn acknowledge(&self, job_id: &str, trace_id: &str) -> Result<Job, AppError> {
        self.jobs.acknowledge(job_id, trace_id)
    }

    fn capture_context(&self) -> CaptureContext {
        CaptureContext {
            transport: self.transport.clone(),
            artifact_root: PathBuf::from(&self.config.capture.artifact_root),
            remote_dir: self.config.capture.remote_dir.clone(),
            timeout: self.config.command_timeout(),
        }
    }

    /// A Running Session job whose terminal state follows the session's exit.
    fn session_job(&self, label: &str) -> (String, Arc<InteractiveSession>) {
        let (job_id, _cancel) = self.jobs.create(JobKind::Session, label);
        let registry: Weak<JobRegistry> = Arc::downgrade(&self.jobs);
        let observed_id = job_id.clone();
        let observed_label = label.to_string();
        let observer: SessionObserver = Arc::new(move |exit: SessionExit| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.finish(&observed_id, session_outcome(&observed_label, &exit));
        });
        let session = Arc::new(
            InteractiveSession::new(self.config.interrupt_grace()).with_observer(observer),
        );
        self.jobs.mark_running(&job_id);
        self.jobs.attach_session(&job_id, Arc::clone(&session));
        (job_id, session)
    }

    fn discard_session_job(&self, job_id: &str, err: AppError, trace_id: &str) -> AppError {
        self.jobs.finish(job_id, JobOutcome::from_error(&err));
        if let Err(ack) = self.jobs.acknowledge(job_id, trace_id) {
            warn!(trace_id = %trace_id, job_id, error = %ack, "failed to drop session job");
        }
        err
    }

    fn fail_if_unspawned(&self, job_id: &str, spawned: Result<(), AppError>) -> Result<(), AppError> {
        if let Err(err) = &spawned {
            self.jobs.finish(job_id, JobOutcome::from_error(err));
        }
        spawned
    }
}

fn session_outcome(label: &str, exit: &SessionExit) -> JobOutcome {
    match (exit.state, exit.exit_code) {
        (SessionState::Interrupted, _) => JobOutcome::Cancelled,
        (_, Some(0)) => JobOutcome::Succeeded { exit_code: Some(0) },
        (_, code) => {
            let code_text = code.map_or_else(|| "signal".to_string(), |code| code.to_string());
            let cause = if exit.stderr_tail.is_empty() {
                format!("{label} failed (exit {code_text})")
            } else {
                format!("{label} failed (exit {code_text}): {}", exit.stderr_tail)
            };
            JobOutcome::failed(
                ErrorKind::CommandFailed {
                    exit_code: code.unwrap_or(-1),
                },
                cause,
            )
        }
    }
}

fn worker_name(prefix: &str, job_id: &str) -> String {
    let short: String = job_id.chars().take(8).collect();
    format!("{prefix}-{short}")
}

#[cfg(all(test, unix))]
mod tests;
