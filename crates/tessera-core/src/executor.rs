//! Executors: the session-affined worker pool and application executors.
//!
//! # Workers
//!
//! A [`WorkerGroup`] owns a fixed number of [`Worker`]s. Each worker is one OS
//! thread driving a single-threaded tokio runtime. A session is pinned to one
//! worker for its whole life (see [`AffinityPolicy`]); its actor task, its
//! heartbeat timer and its transport reader/writer tasks are all spawned on
//! that worker's runtime, so session state never needs a lock.
//!
//! ```text
//!   app thread ──command──▶ ┌──────────── worker 0 ────────────┐
//!                           │ session "a" actor  ◀── reader     │
//!                           │ session "c" actor  ──▶ writer     │
//!                           └───────────────────────────────────┘
//!   app thread ──command──▶ ┌──────────── worker 1 ────────────┐
//!                           │ session "b" actor                 │
//!                           └───────────────────────────────────┘
//! ```
//!
//! # Application executors
//!
//! Request dispatch and asynchronous RPC callbacks never run on a worker.
//! They are handed to an application [`Executor`]: [`SerialExecutor`] (one
//! dedicated thread, FIFO), [`TokioExecutor`] (blocking pool of an existing
//! runtime) or [`InlineExecutor`] (tests and trivial handlers).

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// A unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the worker driving the current thread, if any.
pub fn current_worker() -> Option<usize> {
    CURRENT_WORKER.with(|w| w.get())
}

/// True when called from a session worker thread.
pub fn is_worker_thread() -> bool {
    current_worker().is_some()
}

fn run_contained(job: Job, executor: &'static str) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = panic_message(panic.as_ref());
        tracing::error!(executor, %message, "job panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Chooses the worker a session is bound to.
pub trait AffinityPolicy: Send + Sync + 'static {
    /// Return an index in `0..workers`.
    fn select(&self, session_id: &str, workers: usize) -> usize;
}

/// Binds a session to `hash(session_id) % workers`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashAffinity;

impl AffinityPolicy for HashAffinity {
    fn select(&self, session_id: &str, workers: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        (hasher.finish() % workers.max(1) as u64) as usize
    }
}

/// One single-threaded worker.
pub struct Worker {
    index: usize,
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("index", &self.index).finish_non_exhaustive()
    }
}

impl Worker {
    fn start(index: usize, name_prefix: &str) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(format!("{name_prefix}-{index}"))
            .spawn(move || {
                CURRENT_WORKER.with(|w| w.set(Some(index)));
                tracing::debug!(worker = index, "worker started");
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(std::time::Duration::from_millis(100));
                tracing::debug!(worker = index, "worker stopped");
            })?;

        Ok(Self {
            index,
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Runtime handle used to spawn session tasks on this worker.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        // Joining from the worker itself would never return.
        if current_worker() == Some(self.index) {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Executor for Worker {
    fn execute(&self, job: Job) {
        self.handle.spawn(async move {
            run_contained(job, "worker");
        });
    }
}

/// A fixed pool of session-affined workers.
pub struct WorkerGroup {
    workers: Vec<Arc<Worker>>,
    affinity: Box<dyn AffinityPolicy>,
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl WorkerGroup {
    /// Start `count` workers (at least one) with hash affinity.
    pub fn new(count: usize) -> std::io::Result<Self> {
        Self::with_affinity(count, HashAffinity)
    }

    pub fn with_affinity(count: usize, affinity: impl AffinityPolicy) -> std::io::Result<Self> {
        let count = count.max(1);
        let workers = (0..count)
            .map(|i| Worker::start(i, "tessera-worker").map(Arc::new))
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            workers,
            affinity: Box::new(affinity),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, index: usize) -> Option<&Arc<Worker>> {
        self.workers.get(index)
    }

    /// The worker a session with this id is bound to.
    pub fn select(&self, session_id: &str) -> Arc<Worker> {
        let index = self.affinity.select(session_id, self.workers.len()) % self.workers.len();
        Arc::clone(&self.workers[index])
    }

    /// Stop every worker. Sessions still running are dropped with their
    /// runtime.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs every job immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        run_contained(job, "inline");
    }
}

/// A dedicated application thread that runs jobs one at a time, in
/// submission order.
pub struct SerialExecutor {
    tx: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor").finish_non_exhaustive()
    }
}

impl SerialExecutor {
    /// Spawn the executor thread. The thread exits once every handle is
    /// dropped and the queue is drained.
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    run_contained(job, "serial");
                }
            })?;
        Ok(Self { tx })
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!("serial executor stopped; dropping job");
        }
    }
}

/// Runs jobs on the blocking pool of an existing tokio runtime, so
/// application code may block (for example on a synchronous call).
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context.
    ///
    /// Panics outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn_blocking(move || run_contained(job, "tokio"));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn hash_affinity_is_stable_and_in_range() {
        let policy = HashAffinity;
        for id in ["alpha", "beta", "gamma", "player-42"] {
            let first = policy.select(id, 4);
            assert!(first < 4);
            assert_eq!(first, policy.select(id, 4));
        }
    }

    #[test]
    fn worker_runs_jobs_on_its_own_thread() {
        let group = WorkerGroup::new(2).unwrap();
        let worker = group.select("session-1");
        let (tx, rx) = std::sync::mpsc::channel();
        worker.execute(Box::new(move || {
            tx.send(current_worker()).unwrap();
        }));
        let seen = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(seen, Some(worker.index()));
        assert!(!is_worker_thread());
    }

    #[test]
    fn serial_executor_preserves_order_and_survives_panics() {
        let executor = SerialExecutor::spawn("test-app").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();

        executor.execute(Box::new(|| panic!("boom")));
        for i in 0..5 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                tx.send((i, seen)).unwrap();
            }));
        }

        for expected in 0..5 {
            let (i, seen) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(seen, expected);
        }
    }
}
