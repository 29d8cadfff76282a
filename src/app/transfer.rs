use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::paths::{pull_destination, push_destination, validate_device_path};
use crate::app::adb::runner::{failure_cause, run_command_cancellable, CancelToken, RunOutcome};
use crate::app::adb::transport::Transport;
use crate::app::error::{AppError, ErrorKind};
use crate::app::jobs::{JobOutcome, JobRegistry};
use crate::app::models::TransferDirection;
use crate::app::progress::{local_disk_usage, ProgressMonitor, ProgressReporter, ProgressTracker};

pub type SizeProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Everything a transfer needs, worked out before any job exists so that bad
/// paths and unknown sizes surface synchronously.
pub struct TransferPlan {
    pub direction: TransferDirection,
    pub label: String,
    /// Reservation key of the effective destination.
    pub destination_key: String,
    pub args: Vec<String>,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub tracker: ProgressTracker,
    probe: SizeProbe,
}

impl TransferPlan {
    pub fn bytes_total(&self) -> u64 {
        self.tracker.bytes_total()
    }

    pub fn destination_size(&self) -> u64 {
        (self.probe)()
    }
}

fn checked_device_path(path: &str, trace_id: &str) -> Result<String, AppError> {
    validate_device_path(path).map_err(|message| AppError::validation(message, trace_id))?;
    Ok(path.trim().to_string())
}

/// Sizes the remote source once; a zero size fails the request before anything runs.
pub fn plan_pull(
    transport: &Transport,
    serial: &str,
    remote_path: &str,
    local_path: &Path,
    probe_timeout: Duration,
    trace_id: &str,
) -> Result<TransferPlan, AppError> {
    let remote_path = checked_device_path(remote_path, trace_id)?;
    if local_path.as_os_str().is_empty() {
        return Err(AppError::validation("Local path is required", trace_id));
    }
    let destination = pull_destination(&remote_path, local_path);
    let total = transport.remote_size_bytes(serial, &remote_path, probe_timeout, trace_id)?;
    let tracker = ProgressTracker::new(total, trace_id).map_err(|err| {
        AppError::new(
            err.kind,
            format!("Size of {remote_path} on {serial} is unavailable"),
            trace_id,
        )
    })?;

    let probe_path = destination.clone();
    Ok(TransferPlan {
        direction: TransferDirection::Pull,
        label: format!("pull {remote_path} -> {}", destination.display()),
        destination_key: format!("local:{}", destination.display()),
        args: Transport::pull_args(serial, &remote_path, local_path),
        local_path: destination,
        remote_path,
        tracker,
        probe: Arc::new(move || local_disk_usage(&probe_path)),
    })
}

/// Sizes the local source once; progress is read back with `du` on the device.
pub fn plan_push(
    transport: &Transport,
    serial: &str,
    local_path: &Path,
    remote_path: &str,
    probe_timeout: Duration,
    trace_id: &str,
) -> Result<TransferPlan, AppError> {
    let remote_path = checked_device_path(remote_path, trace_id)?;
    if !local_path.exists() {
        return Err(AppError::validation(
            format!("Local path {} does not exist", local_path.display()),
            trace_id,
        ));
    }
    let destination = push_destination(local_path, &remote_path);
    let total = local_disk_usage(local_path);
    let tracker = ProgressTracker::new(total, trace_id).map_err(|err| {
        AppError::new(
            err.kind,
            format!("Size of {} is unavailable", local_path.display()),
            trace_id,
        )
    })?;

    let probe_transport = transport.clone();
    let probe_serial = serial.to_string();
    let probe_path = destination.clone();
    let probe_trace = trace_id.to_string();
    Ok(TransferPlan {
        direction: TransferDirection::Push,
        label: format!("push {} -> {destination}", local_path.display()),
        destination_key: format!("{serial}:{destination}"),
        args: Transport::push_args(serial, local_path, &remote_path),
        local_path: local_path.to_path_buf(),
        remote_path: destination,
        tracker,
        probe: Arc::new(move || {
            probe_transport
                .remote_size_bytes(&probe_serial, &probe_path, probe_timeout, &probe_trace)
                .unwrap_or(0)
        }),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub min_complete_ratio: f64,
}

/// One queued transfer, handed to a pool worker.
pub struct TransferTask {
    pub job_id: String,
    pub plan: TransferPlan,
    pub transport: Transport,
    pub registry: Arc<JobRegistry>,
    pub cancel: CancelToken,
    pub limits: TransferLimits,
    pub trace_id: String,
}

/// Worker body: run the transfer command under a progress monitor and record
/// the terminal state. Never returns an error; failures land on the job, and the
/// destination size measured after exit is the job's last progress sample.
pub fn execute(task: TransferTask) {
    let TransferTask {
        job_id,
        plan,
        transport,
        registry,
        cancel,
        limits,
        trace_id,
    } = task;

    if !registry.mark_running(&job_id) {
        info!(trace_id = %trace_id, job_id = %job_id, "transfer cancelled before start");
        return;
    }

    let report_registry = Arc::clone(&registry);
    let report_id = job_id.clone();
    let report: ProgressReporter =
        Arc::new(move |sample| report_registry.record_progress(&report_id, sample));
    let monitor_probe = Arc::clone(&plan.probe);
    let total = plan.bytes_total();
    let monitor = match ProgressMonitor::start(
        plan.tracker.clone(),
        limits.poll_interval,
        move || monitor_probe(),
        report,
        &trace_id,
    ) {
        Ok(monitor) => monitor,
        Err(err) => {
            registry.finish(&job_id, JobOutcome::from_error(&err));
            return;
        }
    };

    let result = run_command_cancellable(
        transport.program(),
        &transport.invocation(&plan.args),
        limits.timeout,
        &cancel,
        &trace_id,
    );

    let (outcome, final_size) = match result {
        Ok(RunOutcome::Cancelled(_)) => (JobOutcome::Cancelled, None),
        Ok(RunOutcome::Exited(output)) if !output.succeeded() => (
            JobOutcome::failed(
                ErrorKind::CommandFailed {
                    exit_code: output.exit_code.unwrap_or(-1),
                },
                failure_cause(&plan.label, &output),
            ),
            Some(plan.destination_size()),
        ),
        Ok(RunOutcome::Exited(_)) => {
            let done = plan.destination_size();
            let floor = (total as f64 * limits.min_complete_ratio).floor() as u64;
            let outcome = if done < floor {
                warn!(
                    trace_id = %trace_id,
                    job_id = %job_id,
                    bytes_done = done,
                    bytes_total = total,
                    "transfer exited cleanly but destination is short"
                );
                JobOutcome::failed(
                    ErrorKind::TransferIncomplete,
                    format!(
                        "{}: destination holds {done} of {total} bytes",
                        plan.label
                    ),
                )
            } else {
                info!(
                    trace_id = %trace_id,
                    job_id = %job_id,
                    bytes_done = done,
                    bytes_total = total,
                    "transfer complete"
                );
                JobOutcome::Succeeded { exit_code: Some(0) }
            };
            (outcome, Some(done))
        }
        Err(err) => (
            JobOutcome::failed(err.kind, format!("{}: {}", plan.label, err.error)),
            None,
        ),
    };

    let succeeded = matches!(outcome, JobOutcome::Succeeded { .. });
    monitor.finish(final_size, succeeded);
    registry.finish(&job_id, outcome);
}
