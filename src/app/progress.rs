use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::app::error::{AppError, ErrorKind};
use crate::app::models::ProgressSample;

/// Allocation unit used to make local sizes comparable with `du -s` output.
pub const BLOCK_SIZE: u64 = 4096;

/// `min(100, floor(done / total * 100))`; `None` when the total is unknown (zero).
pub fn percent(bytes_done: u64, bytes_total: u64) -> Option<u8> {
    if bytes_total == 0 {
        return None;
    }
    let value = (bytes_done as u128 * 100) / bytes_total as u128;
    Some(value.min(100) as u8)
}

fn round_to_block(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Block-rounded size of a local file or directory tree. Missing paths count as zero;
/// symlinks are not followed.
pub fn local_disk_usage(path: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return round_to_block(meta.len());
    }
    if !meta.is_dir() {
        return 0;
    }
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| local_disk_usage(&entry.path()))
        .sum()
}

/// Turns raw size readings into samples whose percentage never goes backwards.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    bytes_total: u64,
    last: Option<ProgressSample>,
}

impl ProgressTracker {
    pub fn new(bytes_total: u64, trace_id: &str) -> Result<Self, AppError> {
        if bytes_total == 0 {
            return Err(AppError::new(
                ErrorKind::SizeUnavailable,
                "Source size is unavailable",
                trace_id,
            ));
        }
        Ok(Self {
            bytes_total,
            last: None,
        })
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    pub fn last(&self) -> Option<&ProgressSample> {
        self.last.as_ref()
    }

    pub fn sample(&mut self, bytes_done: u64) -> ProgressSample {
        let measured = percent(bytes_done, self.bytes_total).unwrap_or(0);
        let (floor_percent, floor_time) = match &self.last {
            Some(last) => (last.percent, Some(last.timestamp)),
            None => (0, None),
        };
        let now = Utc::now();
        let sample = ProgressSample {
            timestamp: floor_time.map_or(now, |previous| previous.max(now)),
            bytes_done,
            bytes_total: self.bytes_total,
            percent: measured.max(floor_percent),
        };
        self.last = Some(sample.clone());
        sample
    }

    /// The forced final sample of a successful transfer. `bytes_done` is the measured
    /// destination size, kept as is even when it differs from the total.
    pub fn complete(&mut self, bytes_done: u64) -> ProgressSample {
        let mut sample = self.sample(bytes_done);
        sample.percent = 100;
        self.last = Some(sample.clone());
        sample
    }
}

pub type ProgressReporter = Arc<dyn Fn(ProgressSample) + Send + Sync>;

/// Samples a destination size on its own thread until told to stop.
/// Purely observational: it never touches the transfer process.
pub struct ProgressMonitor {
    stop_tx: Sender<()>,
    handle: JoinHandle<ProgressTracker>,
    report: ProgressReporter,
}

impl ProgressMonitor {
    pub fn start<P>(
        tracker: ProgressTracker,
        interval: Duration,
        mut probe: P,
        report: ProgressReporter,
        trace_id: &str,
    ) -> Result<Self, AppError>
    where
        P: FnMut() -> u64 + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let report_thread = Arc::clone(&report);
        let handle = thread::Builder::new()
            .name("progress-monitor".to_string())
            .spawn(move || {
                let mut tracker = tracker;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let sample = tracker.sample(probe());
                            (report_thread)(sample);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracker
            })
            .map_err(|err| {
                AppError::system(format!("Failed to start progress monitor: {err}"), trace_id)
            })?;
        Ok(Self {
            stop_tx,
            handle,
            report,
        })
    }

    /// Stops sampling. `final_size` is the destination size read after the transfer
    /// process exited; it is reported as the last sample, forced to 100% on success.
    pub fn finish(self, final_size: Option<u64>, succeeded: bool) -> Option<ProgressSample> {
        let _ = self.stop_tx.send(());
        let mut tracker = match self.handle.join() {
            Ok(tracker) => tracker,
            Err(_) => {
                warn!("progress monitor thread panicked");
                return None;
            }
        };
        let sample = match (final_size, succeeded) {
            (Some(done), true) => tracker.complete(done),
            (None, true) => {
                let done = tracker.last().map_or(0, |last| last.bytes_done);
                tracker.complete(done)
            }
            (Some(done), false) => tracker.sample(done),
            (None, false) => return tracker.last().cloned(),
        };
        (self.report)(sample.clone());
        Some(sample)
    }
}
