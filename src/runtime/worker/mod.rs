//! Workers that own suspended tasks until their wait condition holds
//!
//! Every worker has the same single capability: accept a task waiting on
//! some condition and hand it back to a processor once the condition holds,
//! or once the task was aborted. They differ only in how readiness is
//! detected:
//!
//! - [`BlockingIoWorker`]: a thread pool, each thread polls one source at a time
//! - [`EventIoWorker`]: one thread multiplexing many descriptors via `polling`
//! - [`TimerWorker`]: one thread sleeping until the earliest deadline

mod blocking;
mod event;
mod timer;

pub(crate) use blocking::BlockingIoWorker;
pub(crate) use event::EventIoWorker;
pub(crate) use timer::TimerWorker;

use super::action::{IoSource, PollEvents};
use super::error::{Error, Result};
use super::task::Task;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Condition a suspended task waits for
pub(crate) enum Wait {
    Io {
        source: Arc<dyn IoSource>,
        events: PollEvents,
    },
    Timer(Instant),
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wait::Io { source, events } => f
                .debug_struct("Io")
                .field("fd", &source.raw_fd())
                .field("events", events)
                .finish(),
            Wait::Timer(deadline) => f.debug_tuple("Timer").field(deadline).finish(),
        }
    }
}

/// A variant of suspended-task owner
pub(crate) trait Worker: Send + Sync {
    /// Name used for threads and logs
    fn name(&self) -> &str;

    /// Take ownership of `task` until `wait` holds
    fn push_task(&self, task: Task, wait: Wait);

    /// Ask the worker threads to exit. Tasks still waiting are dropped.
    fn stop(&self);

    /// Join the worker threads
    fn join(&self);
}

/// Spawn a named worker thread, mapping failure to [`Error::Spawn`]
pub(crate) fn spawn_thread<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| Error::Spawn(name, e))
}

/// Join `handles`, skipping the calling thread
pub(crate) fn join_threads(handles: Vec<JoinHandle<()>>) {
    let current = thread::current().id();
    for handle in handles {
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() {
            tracing::error!("Worker thread panicked");
        }
    }
}
