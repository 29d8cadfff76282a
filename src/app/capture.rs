use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::app::adb::paths::{device_artifact_dir, device_basename, sanitize_component};
use crate::app::adb::runner::{ensure_success, run_command_cancellable, CancelToken, RunOutcome};
use crate::app::adb::transport::{shell_quote, Transport};
use crate::app::error::AppError;
use crate::app::models::{Device, SessionState};
use crate::app::session::InteractiveSession;

const SCREENSHOT_DIR: &str = "screenshot";
const SCREENRECORD_DIR: &str = "screenrecord";

#[derive(Debug, Clone)]
pub struct CaptureContext {
    pub transport: Transport,
    pub artifact_root: PathBuf,
    pub remote_dir: String,
    pub timeout: Duration,
}

impl CaptureContext {
    fn remote_file(&self, prefix: &str, serial: &str, extension: &str) -> String {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%3f");
        format!(
            "{}/{prefix}-{}-{stamp}.{extension}",
            self.remote_dir.trim().trim_end_matches('/'),
            sanitize_component(serial)
        )
    }

    /// `Ok(false)` when `cancel` fired and the process was killed.
    fn run(
        &self,
        what: &str,
        args: &[String],
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        match run_command_cancellable(
            self.transport.program(),
            &self.transport.invocation(args),
            self.timeout,
            cancel,
            trace_id,
        )? {
            RunOutcome::Exited(output) => ensure_success(what, output, trace_id).map(|_| true),
            RunOutcome::Cancelled(_) => Ok(false),
        }
    }

    fn shell(
        &self,
        serial: &str,
        command: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        self.run(command, &Transport::shell_args(serial, command), cancel, trace_id)
    }

    /// Pulls `remote_path` into `<artifact dir>/<subdir>/` and removes the device copy.
    /// `Ok(None)` when cancelled mid-pull.
    fn collect(
        &self,
        device: &Device,
        remote_path: &str,
        subdir: &str,
        cancel: &CancelToken,
        trace_id: &str,
    ) -> Result<Option<PathBuf>, AppError> {
        let dir = device_artifact_dir(&self.artifact_root, device).join(subdir);
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::system(format!("Failed to create output dir: {err}"), trace_id)
        })?;
        let name = device_basename(remote_path).unwrap_or(subdir);
        let local_path = dir.join(name);

        let pulled = self.run(
            "pull",
            &Transport::pull_args(&device.serial, remote_path, &local_path),
            cancel,
            trace_id,
        )?;
        self.remove_remote(&device.serial, remote_path, trace_id);
        Ok(pulled.then_some(local_path))
    }

    fn remove_remote(&self, serial: &str, remote_path: &str, trace_id: &str) {
        let command = format!("rm -f {}", shell_quote(remote_path));
        if let Err(err) = self.shell(serial, &command, &CancelToken::new(), trace_id) {
            warn!(
                trace_id = %trace_id,
                serial,
                remote_path,
                error = %err.error,
                "failed to remove capture from device"
            );
        }
    }
}

/// `screencap` to the device, then pull into the device's screenshot directory.
/// `Ok(None)` when `cancel` fired; the remote file is still removed.
pub fn capture_screenshot(
    context: &CaptureContext,
    device: &Device,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<Option<PathBuf>, AppError> {
    let remote_path = context.remote_file("screenshot", &device.serial, "png");
    let captured = context.shell(
        &device.serial,
        &format!("screencap -p {}", shell_quote(&remote_path)),
        cancel,
        trace_id,
    )?;
    if !captured {
        context.remove_remote(&device.serial, &remote_path, trace_id);
        info!(trace_id = %trace_id, serial = %device.serial, "screenshot cancelled");
        return Ok(None);
    }
    let Some(local_path) =
        context.collect(device, &remote_path, SCREENSHOT_DIR, cancel, trace_id)?
    else {
        info!(trace_id = %trace_id, serial = %device.serial, "screenshot cancelled");
        return Ok(None);
    };
    info!(
        trace_id = %trace_id,
        serial = %device.serial,
        path = %local_path.display(),
        "screenshot saved"
    );
    Ok(Some(local_path))
}

/// One `screenrecord` run on one device. The recording owns its active flag.
pub struct ScreenRecording {
    job_id: String,
    device: Device,
    remote_path: String,
    session: Arc<InteractiveSession>,
    context: CaptureContext,
    active: AtomicBool,
}

impl ScreenRecording {
    pub fn start(
        context: CaptureContext,
        device: Device,
        session: Arc<InteractiveSession>,
        job_id: String,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let remote_path = context.remote_file("screenrecord", &device.serial, "mp4");
        let args = context.transport.invocation(&Transport::shell_args(
            &device.serial,
            &format!("screenrecord {}", shell_quote(&remote_path)),
        ));
        // screenrecord prints nothing useful on stdout; the reader keeps draining it.
        let _lines = session.start(context.transport.program(), &args, trace_id)?;
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            remote_path = %remote_path,
            "screen recording started"
        );
        Ok(Self {
            job_id,
            device,
            remote_path,
            session,
            context,
            active: AtomicBool::new(true),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Stops the device-side recorder, ends the local session and pulls the file.
    pub fn stop(&self, trace_id: &str) -> Result<PathBuf, AppError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(AppError::validation("No recording in progress", trace_id));
        }

        // SIGINT on the device lets screenrecord finalize the mp4.
        let uncancellable = CancelToken::new();
        if let Err(err) = self.context.shell(
            &self.device.serial,
            "pkill -l 2 screenrecord",
            &uncancellable,
            trace_id,
        ) {
            warn!(trace_id = %trace_id, error = %err.error, "remote pkill failed");
        }
        let state = self.session.interrupt(trace_id);
        info!(trace_id = %trace_id, state = ?state, "screen recording stopped");

        self.context
            .collect(
                &self.device,
                &self.remote_path,
                SCREENRECORD_DIR,
                &uncancellable,
                trace_id,
            )?
            .ok_or_else(|| AppError::system("Recording pull was interrupted", trace_id))
    }
}
