//! Executors that run listener callbacks.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::constants::EVENT_THREAD_NAME;

/// A unit of listener work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs listener jobs, preserving submission order.
pub trait Dispatch: Send + Sync + fmt::Debug {
    /// Run or enqueue `job`.
    fn dispatch(&self, job: Job);
}

/// Runs each job on the calling thread.
///
/// Listener latency then adds directly to connect and request latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatch;

impl Dispatch for InlineDispatch {
    fn dispatch(&self, job: Job) {
        run_guarded(job);
    }
}

/// Runs jobs one at a time on a dedicated, named thread.
///
/// The thread is started on first use and exits once the dispatcher is
/// dropped and its queue drained.
pub struct ThreadDispatch {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl ThreadDispatch {
    /// Dispatcher using the default thread name.
    pub fn new() -> Self {
        Self::named(EVENT_THREAD_NAME)
    }

    /// Dispatcher whose thread carries `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sender: Mutex::new(None),
        }
    }

    fn start(&self) -> Option<mpsc::UnboundedSender<Job>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    run_guarded(job);
                }
            });
        match spawned {
            Ok(_) => Some(tx),
            Err(error) => {
                tracing::error!(%error, thread = %self.name, "failed to start event thread");
                None
            }
        }
    }
}

impl Default for ThreadDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDispatch")
            .field("name", &self.name)
            .field("started", &self.sender.lock().is_some())
            .finish()
    }
}

impl Dispatch for ThreadDispatch {
    fn dispatch(&self, job: Job) {
        let mut sender = self.sender.lock();
        if sender.is_none() {
            *sender = self.start();
        }
        let job = match sender.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        // Event thread unavailable: deliver on the caller rather than drop.
        *sender = None;
        drop(sender);
        run_guarded(job);
    }
}

fn run_guarded(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("event listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_inline_runs_on_caller() {
        let caller = thread::current().id();
        let (tx, rx) = std_mpsc::channel();
        InlineDispatch.dispatch(Box::new(move || {
            tx.send(thread::current().id()).unwrap();
        }));
        assert_eq!(rx.recv().unwrap(), caller);
    }

    #[test]
    fn test_thread_dispatch_preserves_order_and_name() {
        let dispatch = ThreadDispatch::named("events-under-test");
        let (tx, rx) = std_mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            dispatch.dispatch(Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            }));
        }
        for expected in 0..100 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some("events-under-test"));
        }
    }

    #[test]
    fn test_panicking_listener_does_not_stop_thread() {
        let dispatch = Arc::new(ThreadDispatch::new());
        dispatch.dispatch(Box::new(|| panic!("listener bug")));

        let (tx, rx) = std_mpsc::channel();
        dispatch.dispatch(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
