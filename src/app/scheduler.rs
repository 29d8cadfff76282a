use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, warn};

use crate::app::error::AppError;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queued {
    name: String,
    task: Task,
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Queued>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next(&self) -> Option<Queued> {
        let mut queue = self.lock();
        loop {
            if let Some(queued) = queue.tasks.pop_front() {
                return Some(queued);
            }
            if queue.closed {
                return None;
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Fixed pool of `limit` worker threads draining one FIFO queue.
/// A task still in the queue is the engine's Queued job.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: usize,
}

impl TaskScheduler {
    pub fn new(limit: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        });
        let mut workers = 0;
        for index in 0..limit.max(1) {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("engine-worker-{index}"))
                .spawn(move || {
                    while let Some(Queued { name, task }) = worker.next() {
                        debug!(task = %name, "task started");
                        task();
                    }
                });
            match spawned {
                Ok(_) => workers += 1,
                Err(err) => warn!(index, error = %err, "failed to start worker"),
            }
        }
        Self { shared, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn spawn<F>(&self, name: &str, trace_id: &str, task: F) -> Result<(), AppError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers == 0 {
            return Err(AppError::system("No worker threads available", trace_id));
        }
        let mut queue = self.shared.lock();
        if queue.closed {
            return Err(AppError::system("Scheduler is shut down", trace_id));
        }
        queue.tasks.push_back(Queued {
            name: name.to_string(),
            task: Box::new(task),
        });
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }
}

impl Drop for TaskScheduler {
    /// Workers finish what is already queued, then exit.
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
    }
}
