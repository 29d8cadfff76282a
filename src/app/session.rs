use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::runner::{drain, spawn_error, stderr_tail};
use crate::app::error::{AppError, ErrorKind};
use crate::app::models::SessionState;

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// How a session run ended, handed to the terminal observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

pub type SessionObserver = Arc<dyn Fn(SessionExit) + Send + Sync>;

/// Stdout of one `start` call, line by line. Ends when the process's stdout closes.
pub struct SessionLines {
    rx: Receiver<String>,
}

impl SessionLines {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<String, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Iterator for SessionLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.rx.recv().ok()
    }
}

struct Status {
    state: SessionState,
    exit_code: Option<i32>,
    interrupting: bool,
    child: Option<Arc<Mutex<Child>>>,
}

/// A long-lived streaming command with an explicit interrupt.
///
/// The process handle lives only inside the session: the watcher thread reaps it and
/// `interrupt` is the one way to signal it.
pub struct InteractiveSession {
    grace: Duration,
    status: Arc<(Mutex<Status>, Condvar)>,
    observer: Option<SessionObserver>,
}

fn lock_status(status: &Mutex<Status>) -> MutexGuard<'_, Status> {
    status
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // Holding the child lock keeps the watcher from reaping, so the pid is still ours.
    if !matches!(child.try_wait(), Ok(None)) {
        return false;
    }
    match i32::try_from(child.id()) {
        Ok(pid) => kill(Pid::from_raw(pid), Signal::SIGINT).is_ok(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) -> bool {
    child.kill().is_ok()
}

impl InteractiveSession {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            status: Arc::new((
                Mutex::new(Status {
                    state: SessionState::Idle,
                    exit_code: None,
                    interrupting: false,
                    child: None,
                }),
                Condvar::new(),
            )),
            observer: None,
        }
    }

    /// Called once per run, after the last line has been delivered.
    pub fn with_observer(mut self, observer: SessionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SessionState {
        lock_status(&self.status.0).state
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock_status(&self.status.0).exit_code
    }

    pub fn start(
        &self,
        program: &str,
        args: &[String],
        trace_id: &str,
    ) -> Result<SessionLines, AppError> {
        let mut status = lock_status(&self.status.0);
        if status.state == SessionState::Running {
            return Err(AppError::new(
                ErrorKind::SessionBusy,
                "Session already has a running process",
                trace_id,
            ));
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(program, err, trace_id))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AppError::system("Failed to capture session output", trace_id));
        };

        let child = Arc::new(Mutex::new(child));
        status.state = SessionState::Running;
        status.exit_code = None;
        status.interrupting = false;
        status.child = Some(Arc::clone(&child));
        drop(status);
        info!(trace_id = %trace_id, program, "session started");

        let (line_tx, line_rx) = mpsc::channel::<String>();
        let (eof_tx, eof_rx) = mpsc::channel::<()>();
        let trace_reader = trace_id.to_string();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buffer = Vec::<u8>::new();
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buffer);
                        let line = line.trim_end_matches(['\n', '\r']).to_string();
                        // Keep draining after the consumer goes away so the child never blocks.
                        let _ = line_tx.send(line);
                    }
                    Err(err) => {
                        warn!(trace_id = %trace_reader, error = %err, "failed to read session stdout");
                        break;
                    }
                }
            }
            let _ = eof_tx.send(());
        });
        let stderr_handle = drain(stderr);

        let shared = Arc::clone(&self.status);
        let observer = self.observer.clone();
        let grace = self.grace;
        let trace_watch = trace_id.to_string();
        thread::spawn(move || {
            let exit = wait_for_exit(&child, &trace_watch);
            // Flush the reader before reporting the terminal state. One deadline covers
            // both pipes so a grandchild holding them pins the session for at most `grace`.
            let flush_deadline = Instant::now() + grace;
            if eof_rx
                .recv_timeout(flush_deadline.saturating_duration_since(Instant::now()))
                .is_err()
            {
                warn!(trace_id = %trace_watch, "session output still open after exit");
            }
            while !stderr_handle.is_finished() && Instant::now() < flush_deadline {
                thread::sleep(Duration::from_millis(10));
            }
            let stderr = if stderr_handle.is_finished() {
                stderr_handle.join().unwrap_or_default()
            } else {
                Vec::new()
            };

            let (lock, changed) = &*shared;
            let result = {
                let mut status = lock_status(lock);
                status.state = if status.interrupting {
                    SessionState::Interrupted
                } else {
                    SessionState::Completed
                };
                status.exit_code = exit.and_then(|status| status.code());
                status.child = None;
                SessionExit {
                    state: status.state,
                    exit_code: status.exit_code,
                    stderr_tail: stderr_tail(&String::from_utf8_lossy(&stderr)),
                }
            };
            changed.notify_all();
            info!(
                trace_id = %trace_watch,
                state = ?result.state,
                exit_code = ?result.exit_code,
                "session ended"
            );
            if let Some(observer) = observer {
                observer(result);
            }
        });

        Ok(SessionLines { rx: line_rx })
    }

    /// SIGINT, then a forced kill once the grace period runs out. Returns the state
    /// after the process has exited. A no-op unless Running.
    pub fn interrupt(&self, trace_id: &str) -> SessionState {
        let (lock, changed) = &*self.status;
        let child = {
            let mut status = lock_status(lock);
            if status.state != SessionState::Running {
                return status.state;
            }
            status.interrupting = true;
            status.child.clone()
        };
        let Some(child) = child else {
            return self.state();
        };

        let signalled = send_interrupt(&mut lock_child(&child));
        debug!(trace_id = %trace_id, signalled, "session interrupt sent");

        if !self.wait_terminal(lock, changed, self.grace) {
            warn!(trace_id = %trace_id, "session ignored interrupt, killing");
            let mut guard = lock_child(&child);
            if matches!(guard.try_wait(), Ok(None)) {
                let _ = guard.kill();
            }
            drop(guard);
            // Reap poll plus the watcher's flush deadline.
            self.wait_terminal(lock, changed, self.grace + WATCH_INTERVAL * 8);
        }
        self.state()
    }

    fn wait_terminal(&self, lock: &Mutex<Status>, changed: &Condvar, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = lock_status(lock);
        loop {
            if status.state.is_terminal() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            status = changed
                .wait_timeout(status, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

fn wait_for_exit(child: &Mutex<Child>, trace_id: &str) -> Option<ExitStatus> {
    loop {
        let polled = lock_child(child).try_wait();
        match polled {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(WATCH_INTERVAL),
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to poll session process");
                let mut guard = lock_child(child);
                let _ = guard.kill();
                return guard.wait().ok();
            }
        }
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        let child = lock_status(&self.status.0).child.clone();
        if let Some(child) = child {
            let mut guard = lock_child(&child);
            if matches!(guard.try_wait(), Ok(None)) {
                let _ = guard.kill();
            }
        }
    }
}
