//! Promise: a single-assignment result cell with blocking waits and
//! listener notification.
//!
//! Every asynchronous operation in tessera hands back a [`Promise`]. The cell
//! moves from pending to exactly one terminal [`Outcome`]; later completion
//! attempts are rejected. Listeners run exactly once, in registration order,
//! either inline on the completing thread or on the [`Executor`] they were
//! registered with. A listener added after completion runs immediately.
//!
//! Cancellation is a failure whose cause is [`PromiseError::Cancelled`] plus
//! a separate cancelled flag, so `is_cancelled` and `get` stay unambiguous.
//!
//! This is the only structure shared across threads on purpose: completion
//! and listener registration are guarded by the promise's own mutex.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::error::{Cause, PromiseError};
use crate::executor::{Executor, panic_message};

/// Terminal state of a promise.
pub enum Outcome<T> {
    Success(T),
    Failure(Cause),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Outcome::Success(v) => Some(v),
            Outcome::Failure(_) => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(v) => f.debug_tuple("Success").field(v).finish(),
            Outcome::Failure(e) => f.debug_tuple("Failure").field(&e.to_string()).finish(),
        }
    }
}

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

struct Listener<T> {
    callback: Callback<T>,
    executor: Option<Arc<dyn Executor>>,
}

impl<T: Send + Sync + 'static> Listener<T> {
    fn fire(self, outcome: &Arc<Outcome<T>>) {
        match self.executor {
            Some(executor) => {
                let outcome = Arc::clone(outcome);
                let callback = self.callback;
                executor.execute(Box::new(move || callback(&outcome)));
            }
            None => {
                let callback = self.callback;
                if let Err(panic) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome)))
                {
                    tracing::warn!(message = %panic_message(panic.as_ref()), "promise listener panicked");
                }
            }
        }
    }
}

struct Cell<T> {
    outcome: Option<Arc<Outcome<T>>>,
    cancelled: bool,
    listeners: Vec<Listener<T>>,
}

struct Shared<T> {
    cell: Mutex<Cell<T>>,
    done: Condvar,
}

/// Single-assignment asynchronous result.
///
/// Clones share the same cell: one clone completes, any clone observes.
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared {
            None => f.write_str("Promise(void)"),
            Some(shared) => {
                let cell = shared.cell.lock();
                let state = match (&cell.outcome, cell.cancelled) {
                    (None, _) => "pending",
                    (Some(_), true) => "cancelled",
                    (Some(o), false) if o.is_success() => "success",
                    (Some(_), false) => "failure",
                };
                write!(f, "Promise({state})")
            }
        }
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Some(Arc::new(Shared {
                cell: Mutex::new(Cell {
                    outcome: None,
                    cancelled: false,
                    listeners: Vec::new(),
                }),
                done: Condvar::new(),
            })),
        }
    }

    /// A promise for fire-and-forget call sites. It allocates nothing,
    /// records nothing and drops every listener.
    pub const fn void() -> Self {
        Self { shared: None }
    }

    /// An already successful promise.
    pub fn succeeded(value: T) -> Self {
        let promise = Self::new();
        promise.try_success(value);
        promise
    }

    pub fn is_void(&self) -> bool {
        self.shared.is_none()
    }

    fn complete(&self, outcome: Outcome<T>, cancelled: bool) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };

        let (outcome, listeners) = {
            let mut cell = shared.cell.lock();
            if cell.outcome.is_some() {
                return false;
            }
            let outcome = Arc::new(outcome);
            cell.outcome = Some(Arc::clone(&outcome));
            cell.cancelled = cancelled;
            (outcome, std::mem::take(&mut cell.listeners))
        };
        shared.done.notify_all();

        for listener in listeners {
            listener.fire(&outcome);
        }
        true
    }

    /// Complete with a value. Returns `false` if already complete.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(Outcome::Success(value), false)
    }

    /// Complete with a failure. Returns `false` if already complete.
    pub fn try_failure<E>(&self, error: E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.complete(Outcome::Failure(Arc::new(error)), false)
    }

    /// Complete with a value, reporting a second completion as an error.
    pub fn set_success(&self, value: T) -> Result<(), PromiseError> {
        if self.is_void() || self.try_success(value) {
            Ok(())
        } else {
            Err(PromiseError::AlreadyComplete)
        }
    }

    /// Complete with a failure, reporting a second completion as an error.
    pub fn set_failure<E>(&self, error: E) -> Result<(), PromiseError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if self.is_void() || self.try_failure(error) {
            Ok(())
        } else {
            Err(PromiseError::AlreadyComplete)
        }
    }

    /// Cancel a pending promise. Returns `false` if it already completed.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Failure(Arc::new(PromiseError::Cancelled)), true)
    }

    pub fn is_done(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.cell.lock().outcome.is_some(),
            None => false,
        }
    }

    pub fn is_success(&self) -> bool {
        match &self.shared {
            Some(shared) => shared
                .cell
                .lock()
                .outcome
                .as_ref()
                .is_some_and(|o| o.is_success()),
            None => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.cell.lock().cancelled,
            None => false,
        }
    }

    /// Run `listener` once the promise completes, inline on the completing
    /// thread (or right now on this thread if it already has).
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.register(Listener {
            callback: Box::new(listener),
            executor: None,
        });
    }

    /// Run `listener` on `executor` once the promise completes.
    pub fn add_listener_on<F>(&self, executor: Arc<dyn Executor>, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.register(Listener {
            callback: Box::new(listener),
            executor: Some(executor),
        });
    }

    fn register(&self, listener: Listener<T>) {
        let Some(shared) = &self.shared else {
            tracing::trace!("listener added to void promise; dropped");
            return;
        };

        let ready = {
            let mut cell = shared.cell.lock();
            match &cell.outcome {
                Some(outcome) => Arc::clone(outcome),
                None => {
                    cell.listeners.push(listener);
                    return;
                }
            }
        };
        listener.fire(&ready);
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    fn read(cell: &Cell<T>) -> Option<Result<T, PromiseError>> {
        let outcome = cell.outcome.as_ref()?;
        Some(match outcome.as_ref() {
            Outcome::Success(v) => Ok(v.clone()),
            Outcome::Failure(_) if cell.cancelled => Err(PromiseError::Cancelled),
            Outcome::Failure(cause) => Err(PromiseError::Failed(Arc::clone(cause))),
        })
    }

    /// Non-blocking peek: `None` while pending.
    pub fn get_now(&self) -> Option<Result<T, PromiseError>> {
        match &self.shared {
            Some(shared) => Self::read(&shared.cell.lock()),
            None => Some(Err(PromiseError::Void)),
        }
    }

    /// Block the calling thread until the promise completes.
    ///
    /// Never call this on a session worker: the worker is what completes
    /// most promises.
    pub fn get(&self) -> Result<T, PromiseError> {
        let Some(shared) = &self.shared else {
            return Err(PromiseError::Void);
        };
        let mut cell = shared.cell.lock();
        loop {
            if let Some(result) = Self::read(&cell) {
                return result;
            }
            shared.done.wait(&mut cell);
        }
    }

    /// Block for at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, PromiseError> {
        let Some(shared) = &self.shared else {
            return Err(PromiseError::Void);
        };
        let deadline = Instant::now() + timeout;
        let mut cell = shared.cell.lock();
        loop {
            if let Some(result) = Self::read(&cell) {
                return result;
            }
            if shared.done.wait_until(&mut cell, deadline).timed_out() {
                return Self::read(&cell).unwrap_or(Err(PromiseError::Timeout));
            }
        }
    }

    /// Wait without blocking a thread. Dropping the returned future abandons
    /// the wait; the promise itself is unaffected.
    pub async fn wait(&self) -> Result<T, PromiseError> {
        if self.is_void() {
            return Err(PromiseError::Void);
        }
        let (tx, rx) = oneshot::channel::<()>();
        self.add_listener(move |_| {
            let _ = tx.send(());
        });
        let _ = rx.await;
        self.get_now().unwrap_or(Err(PromiseError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::executor::InlineExecutor;

    #[derive(Debug, thiserror::Error)]
    #[error("test failure")]
    struct TestFailure;

    #[test]
    fn second_completion_is_rejected() {
        let promise = Promise::new();
        assert!(promise.try_success(1));
        assert!(!promise.try_success(2));
        assert!(!promise.try_failure(TestFailure));
        assert_eq!(promise.get().unwrap(), 1);
        assert!(matches!(
            promise.set_success(3),
            Err(PromiseError::AlreadyComplete)
        ));
    }

    #[test]
    fn failure_is_reported_through_get() {
        let promise: Promise<u32> = Promise::new();
        assert!(promise.try_failure(TestFailure));
        assert!(!promise.is_success());
        assert!(matches!(promise.get(), Err(PromiseError::Failed(_))));
    }

    #[test]
    fn listeners_fire_once_in_registration_order() {
        let promise = Promise::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            promise.add_listener(move |o: &Outcome<u32>| {
                order.lock().push((i, *o.success().unwrap()));
            });
        }
        promise.try_success(7);
        promise.try_success(8);
        assert_eq!(*order.lock(), vec![(0, 7), (1, 7), (2, 7), (3, 7)]);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let promise = Promise::succeeded("done");
        let (tx, rx) = mpsc::channel();
        promise.add_listener(move |o| tx.send(*o.success().unwrap()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), "done");
    }

    #[test]
    fn listener_on_executor() {
        let promise = Promise::new();
        let (tx, rx) = mpsc::channel();
        promise.add_listener_on(Arc::new(InlineExecutor), move |o: &Outcome<i32>| {
            tx.send(o.is_success()).unwrap();
        });
        promise.try_success(1);
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn cancel_only_from_pending() {
        let promise: Promise<()> = Promise::new();
        assert!(promise.cancel());
        assert!(promise.is_cancelled());
        assert!(matches!(promise.get_now(), Some(Err(PromiseError::Cancelled))));

        let done = Promise::succeeded(());
        assert!(!done.cancel());
        assert!(!done.is_cancelled());
    }

    #[test]
    fn get_timeout_expires_while_pending() {
        let promise: Promise<u8> = Promise::new();
        assert!(promise.get_now().is_none());
        assert!(matches!(
            promise.get_timeout(Duration::from_millis(20)),
            Err(PromiseError::Timeout)
        ));
    }

    #[test]
    fn get_wakes_on_completion_from_another_thread() {
        let promise = Promise::new();
        let completer = promise.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.try_success(99u64);
        });
        assert_eq!(promise.get_timeout(Duration::from_secs(2)).unwrap(), 99);
        handle.join().unwrap();
    }

    #[test]
    fn void_promise_records_nothing() {
        let promise: Promise<u8> = Promise::void();
        assert!(promise.is_void());
        assert!(!promise.try_success(1));
        assert!(promise.set_success(1).is_ok());
        assert!(!promise.is_done());
        promise.add_listener(|_| panic!("void listeners never run"));
        assert!(matches!(promise.get(), Err(PromiseError::Void)));
    }

    #[tokio::test]
    async fn wait_resolves_asynchronously() {
        let promise = Promise::new();
        let completer = promise.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.try_success(String::from("hi"));
        });
        assert_eq!(promise.wait().await.unwrap(), "hi");
    }
}
