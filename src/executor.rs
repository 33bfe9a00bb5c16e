//! Serial executors with bounded queues.
//!
//! The appenderator runs three of these (persist, merge, abandon). Each owns
//! one worker thread over a bounded channel: submission blocks while the
//! queue is full, which is the engine's backpressure signal. A capacity of
//! zero degenerates to a rendezvous hand-off.

use crate::error::{AppenderatorError, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded executor over a bounded queue.
pub struct SerialExecutor {
    name: String,
    sender: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancelled: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl SerialExecutor {
    /// Spawns the worker thread. `queue_capacity` bounds how many tasks may
    /// wait behind the running one; zero means submitters rendezvous with
    /// the worker directly.
    pub fn new(name: impl Into<String>, queue_capacity: usize) -> Result<Arc<Self>> {
        let name = name.into();
        let (sender, receiver) = bounded::<Job>(queue_capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let shutdown = shutdown.clone();
            let thread_name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || Self::worker_loop(&thread_name, receiver, shutdown))?
        };

        Ok(Arc::new(Self {
            name,
            sender,
            worker: Mutex::new(Some(worker)),
            cancelled,
            shutdown,
        }))
    }

    fn worker_loop(name: &str, receiver: Receiver<Job>, shutdown: Arc<AtomicBool>) {
        debug!(executor = name, "Executor worker started");
        loop {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(job) => job(),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(executor = name, "Executor worker exited");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits a task, blocking while the queue is full. The returned future
    /// resolves when the task has run (or was cancelled by shutdown).
    pub fn submit<T, F>(&self, task: F) -> Result<TaskFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(AppenderatorError::ShuttingDown);
        }

        let (result_tx, result_rx) = bounded(1);
        let cancelled = self.cancelled.clone();
        let executor_name = self.name.clone();
        let job: Job = Box::new(move || {
            if cancelled.load(Ordering::Acquire) {
                let _ = result_tx.send(Err(AppenderatorError::TaskCancelled {
                    executor: executor_name.clone(),
                }));
                return;
            }
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
                Ok(value) => {
                    let _ = result_tx.send(Ok(value));
                }
                Err(_) => {
                    error!(executor = %executor_name, "Task panicked");
                    let _ = result_tx.send(Err(AppenderatorError::TaskPanicked {
                        executor: executor_name.clone(),
                    }));
                }
            }
        });

        self.sender
            .send(job)
            .map_err(|_| AppenderatorError::ShuttingDown)?;

        Ok(TaskFuture {
            receiver: result_rx,
            executor: self.name.clone(),
        })
    }

    /// Signals immediate cancellation: tasks that have not started resolve
    /// to `TaskCancelled` instead of running.
    pub fn shutdown_now(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
    }

    /// Waits for the worker to drain its queue and exit. Idempotent.
    pub fn join(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            match handle.join() {
                Ok(()) => info!(executor = %self.name, "Executor terminated"),
                Err(_) => error!(executor = %self.name, "Executor worker panicked"),
            }
        }
    }
}

/// Handle to a task's eventual result.
pub struct TaskFuture<T> {
    receiver: Receiver<Result<T>>,
    executor: String,
}

impl<T> TaskFuture<T> {
    /// A future that is already resolved; used when there is no work to do.
    pub fn ready(value: T) -> TaskFuture<T>
    where
        T: Send,
    {
        let (tx, rx) = bounded(1);
        let _ = tx.send(Ok(value));
        TaskFuture {
            receiver: rx,
            executor: "immediate".to_string(),
        }
    }

    /// Blocks until the task completes and returns its result.
    pub fn wait(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(result) => result,
            // The job was dropped without running (executor torn down).
            Err(_) => Err(AppenderatorError::TaskAborted {
                executor: self.executor,
            }),
        }
    }

    /// Non-blocking poll; `None` while the task is still pending.
    pub fn try_wait(&self) -> Option<Result<T>> {
        self.receiver.try_recv().ok()
    }
}
