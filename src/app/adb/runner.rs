use std::io::{ErrorKind as IoErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::error::AppError;
use crate::app::models::CommandOutput;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_CHARS: usize = 2000;

/// Cooperative cancellation flag shared between a job and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(CommandOutput),
    /// The process was killed because the token fired; output is whatever was drained.
    Cancelled(CommandOutput),
}

pub fn spawn_error(program: &str, err: std::io::Error, trace_id: &str) -> AppError {
    if err.kind() == IoErrorKind::NotFound {
        AppError::command_not_found(format!("Command not found: {program}"), trace_id)
    } else {
        AppError::system(format!("Failed to spawn {program}: {err}"), trace_id)
    }
}

/// Reads a pipe to EOF on its own thread.
pub fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

fn collect(
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
    exit_code: Option<i32>,
) -> CommandOutput {
    let stdout_bytes = stdout.join().unwrap_or_default();
    let stderr_bytes = stderr.join().unwrap_or_default();
    CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    match run_command_cancellable(program, args, timeout, &CancelToken::new(), trace_id)? {
        RunOutcome::Exited(output) | RunOutcome::Cancelled(output) => Ok(output),
    }
}

/// Runs `program` to completion, timeout, or cancellation. Blocks the calling worker.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancelToken,
    trace_id: &str,
) -> Result<RunOutcome, AppError> {
    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, err, trace_id))?;

    // Drain both pipes in parallel; a chatty child blocks once the pipe buffer fills.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = collect(stdout_handle, stderr_handle, status.code());
                debug!(
                    trace_id = %trace_id,
                    program,
                    exit_code = ?output.exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "command exited"
                );
                return Ok(RunOutcome::Exited(output));
            }
            Ok(None) => {
                if cancel.is_cancelled() {
                    reap(&mut child);
                    return Ok(RunOutcome::Cancelled(collect(
                        stdout_handle,
                        stderr_handle,
                        None,
                    )));
                }
                if started.elapsed() > timeout {
                    reap(&mut child);
                    let _ = collect(stdout_handle, stderr_handle, None);
                    return Err(AppError::timeout(
                        format!("Command timed out after {}s", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                reap(&mut child);
                let _ = collect(stdout_handle, stderr_handle, None);
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    }
}

/// Last lines of stderr, bounded for display.
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(|line| line.trim_end())
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let joined = lines[start..].join("\n");
    let overflow = joined.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    joined.chars().skip(overflow).collect()
}

pub fn failure_cause(what: &str, output: &CommandOutput) -> String {
    let tail = stderr_tail(&output.stderr);
    let code = output
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());
    if tail.is_empty() {
        format!("{what} failed (exit {code})")
    } else {
        format!("{what} failed (exit {code}): {tail}")
    }
}

/// Maps a non-zero exit into `CommandFailed`; a missing code (signal) becomes `-1`.
pub fn ensure_success(
    what: &str,
    output: CommandOutput,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    if output.succeeded() {
        return Ok(output);
    }
    Err(AppError::command_failed(
        output.exit_code.unwrap_or(-1),
        failure_cause(what, &output),
        trace_id,
    ))
}
