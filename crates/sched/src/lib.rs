//! Background worker pool with a priority task queue.
//!
//! Work is submitted with a priority and executed on a fixed set of worker
//! threads; results come back through a completion channel that the main
//! thread drains under a time budget. Nothing here blocks the polling
//! thread, and a worker panic is delivered as an error result rather than
//! taking the process down.
//!
//! Cancellation is cooperative: a task already running is not preempted,
//! its completion is just flagged stale so the caller discards the output.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Identifier of one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Errors surfaced through completions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("cancelled before start")]
    Cancelled,
}

/// Cooperative cancellation flag handed to running jobs.
///
/// Long jobs may poll this to bail out early; the scheduler also reads it
/// after the job returns to mark the completion stale.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// A finished task delivered through `poll_completed`.
#[derive(Debug)]
pub struct Completion<T> {
    pub task_id: TaskId,
    /// True if the task was cancelled before or during execution; the
    /// payload must be discarded, never attached.
    pub stale: bool,
    pub result: Result<T, TaskError>,
    /// Time spent waiting in the queue before a worker picked the task up.
    pub queue_time: Duration,
}

type Job<T> = Box<dyn FnOnce(&CancelFlag) -> T + Send + 'static>;

struct QueuedTask<T> {
    id: TaskId,
    priority: f32,
    sequence: u64,
    enqueued_at: Instant,
    cancel: CancelFlag,
    job: Job<T>,
}

impl<T> PartialEq for QueuedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}
impl<T> Eq for QueuedTask<T> {}

impl<T> Ord for QueuedTask<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on priority; FIFO among equals via the sequence number.
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl<T> PartialOrd for QueuedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedState<T> {
    queue: BinaryHeap<QueuedTask<T>>,
    shutdown: bool,
}

struct Shared<T> {
    state: Mutex<SchedState<T>>,
    available: Condvar,
}

/// Fixed-size worker pool plus priority queue plus completion channel.
pub struct BackgroundScheduler<T> {
    shared: Arc<Shared<T>>,
    completed_rx: crossbeam_channel::Receiver<Completion<T>>,
    in_flight: Mutex<HashMap<TaskId, CancelFlag>>,
    workers: Vec<JoinHandle<()>>,
    next_id: Mutex<u64>,
}

impl<T: Send + 'static> BackgroundScheduler<T> {
    /// Spawn a pool sized to the machine: available cores minus one
    /// reserved for the main thread, at least one.
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism().map_or(2, std::num::NonZero::get);
        Self::with_workers(cores.saturating_sub(1).max(1))
    }

    /// Spawn a pool with an explicit worker count.
    pub fn with_workers(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedState {
                queue: BinaryHeap::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let tx = completed_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("farfield-worker-{i}"))
                .spawn(move || worker_loop(&shared, &tx))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        tracing::debug!(worker_count, "background scheduler started");

        Self {
            shared,
            completed_rx,
            in_flight: Mutex::new(HashMap::new()),
            workers,
            next_id: Mutex::new(1),
        }
    }

    /// Queue a job. Higher priority runs first; ties run in submission
    /// order. The job receives its cancel flag and may return early when
    /// it is set.
    pub fn submit(
        &self,
        priority: f32,
        job: impl FnOnce(&CancelFlag) -> T + Send + 'static,
    ) -> TaskId {
        let id = {
            let mut next = self.next_id.lock().expect("scheduler id lock poisoned");
            let id = TaskId(*next);
            *next += 1;
            id
        };
        let cancel = CancelFlag::default();
        self.in_flight
            .lock()
            .expect("in-flight map poisoned")
            .insert(id, cancel.clone());

        let mut state = self.shared.state.lock().expect("scheduler queue poisoned");
        let task = QueuedTask {
            id,
            priority,
            sequence: id.0,
            enqueued_at: Instant::now(),
            cancel,
            job: Box::new(job),
        };
        state.queue.push(task);
        drop(state);
        self.shared.available.notify_one();
        id
    }

    /// Mark a task stale. Queued tasks are skipped cheaply; a task already
    /// on a worker finishes but its completion arrives with `stale: true`.
    pub fn cancel(&self, task_id: TaskId) {
        let in_flight = self.in_flight.lock().expect("in-flight map poisoned");
        if let Some(flag) = in_flight.get(&task_id) {
            flag.set();
        }
    }

    /// Drain completions on the calling thread until the channel is empty
    /// or the budget is spent. Never blocks waiting for work to finish.
    pub fn poll_completed(&self, budget: Duration) -> Vec<Completion<T>> {
        let start = Instant::now();
        let mut out = Vec::new();
        while let Ok(completion) = self.completed_rx.try_recv() {
            self.in_flight
                .lock()
                .expect("in-flight map poisoned")
                .remove(&completion.task_id);
            out.push(completion);
            if start.elapsed() >= budget {
                break;
            }
        }
        out
    }

    /// Tasks submitted but not yet delivered through `poll_completed`.
    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight map poisoned").len()
    }

    /// Tasks still waiting in the queue (not yet picked up by a worker).
    pub fn queue_depth(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("scheduler queue poisoned")
            .queue
            .len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl<T: Send + 'static> Default for BackgroundScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for BackgroundScheduler<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("scheduler queue poisoned");
            state.shutdown = true;
            state.queue.clear();
        }
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T>(shared: &Shared<T>, tx: &crossbeam_channel::Sender<Completion<T>>) {
    loop {
        let task = {
            let mut state = shared.state.lock().expect("scheduler queue poisoned");
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(task) = state.queue.pop() {
                    break task;
                }
                state = shared
                    .available
                    .wait(state)
                    .expect("scheduler queue poisoned");
            }
        };

        let queue_time = task.enqueued_at.elapsed();

        // Cancelled while queued: report stale without running the job.
        if task.cancel.is_cancelled() {
            let _ = tx.send(Completion {
                task_id: task.id,
                stale: true,
                result: Err(TaskError::Cancelled),
                queue_time,
            });
            continue;
        }

        let cancel = task.cancel.clone();
        let job = task.job;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&cancel)));

        let completion = match result {
            Ok(value) => Completion {
                task_id: task.id,
                stale: task.cancel.is_cancelled(),
                result: Ok(value),
                queue_time,
            },
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                tracing::warn!(task_id = task.id.0, message, "worker task panicked");
                Completion {
                    task_id: task.id,
                    stale: task.cancel.is_cancelled(),
                    result: Err(TaskError::Panicked(message)),
                    queue_time,
                }
            }
        };

        // Receiver gone means the scheduler is shutting down.
        if tx.send(completion).is_err() {
            return;
        }
    }
}

pub fn crate_info() -> &'static str {
    "farfield-sched v0.1.0"
}
