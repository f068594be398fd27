//! Suspension requests
//!
//! Every step of a coroutine returns an [`Action`] telling the processor what
//! to do with the task next: run it again, hand it to a worker until some
//! condition holds, or release it.

use super::error::{BoxError, Error};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Readiness directions a task can wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

impl PollEvents {
    /// Whether read readiness is requested
    pub fn is_read(&self) -> bool {
        matches!(self, PollEvents::Read | PollEvents::Both)
    }

    /// Whether write readiness is requested
    pub fn is_write(&self) -> bool {
        matches!(self, PollEvents::Write | PollEvents::Both)
    }
}

/// Something an I/O worker can wait on
///
/// The blocking worker calls [`poll`](IoSource::poll) from a pool thread; the
/// event worker registers [`raw_fd`](IoSource::raw_fd) with the OS readiness
/// mechanism. Sources without a descriptor are always served by the
/// blocking worker.
pub trait IoSource: Send + Sync {
    /// Wait up to `timeout` for readiness. Returns true when ready.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool>;

    /// Descriptor for readiness multiplexing, if any
    fn raw_fd(&self) -> Option<RawFd>;
}

/// What a task asks the scheduler to do after one step
pub enum Action {
    /// Run the next step right away on the same processor
    Continue,
    /// Re-queue behind other ready tasks on the same processor
    Yield,
    /// Hand the task to an I/O worker until `source` is ready
    WaitIo {
        source: Arc<dyn IoSource>,
        events: PollEvents,
    },
    /// Hand the task to a timer worker until `deadline`
    WaitTimer(Instant),
    /// Park the task until its [`Waker`](super::Waker) asks for a repeat
    WaitRepeat,
    /// The task is done
    Finish,
    /// The step failed; routed to [`Coroutine::handle_error`](super::Coroutine::handle_error)
    Error(Error),
}

impl Action {
    /// Wait for read readiness
    pub fn wait_read(source: Arc<dyn IoSource>) -> Self {
        Action::WaitIo {
            source,
            events: PollEvents::Read,
        }
    }

    /// Wait for write readiness
    pub fn wait_write(source: Arc<dyn IoSource>) -> Self {
        Action::WaitIo {
            source,
            events: PollEvents::Write,
        }
    }

    /// Sleep for `duration`
    pub fn sleep(duration: Duration) -> Self {
        Action::WaitTimer(Instant::now() + duration)
    }

    /// Fail the current step with a task error
    pub fn error<E: Into<BoxError>>(error: E) -> Self {
        Action::Error(Error::task(error))
    }

    /// Name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Continue => "continue",
            Action::Yield => "yield",
            Action::WaitIo { .. } => "wait-io",
            Action::WaitTimer(_) => "wait-timer",
            Action::WaitRepeat => "wait-repeat",
            Action::Finish => "finish",
            Action::Error(_) => "error",
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::WaitIo { source, events } => f
                .debug_struct("WaitIo")
                .field("fd", &source.raw_fd())
                .field("events", events)
                .finish(),
            Action::WaitTimer(deadline) => f.debug_tuple("WaitTimer").field(deadline).finish(),
            Action::Error(err) => f.debug_tuple("Error").field(err).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_events() {
        assert!(PollEvents::Read.is_read());
        assert!(!PollEvents::Read.is_write());
        assert!(PollEvents::Both.is_read() && PollEvents::Both.is_write());
    }

    #[test]
    fn test_action_kind() {
        assert_eq!(Action::Continue.kind(), "continue");
        assert_eq!(Action::sleep(Duration::from_millis(1)).kind(), "wait-timer");
        assert_eq!(Action::error("bad").kind(), "error");
        assert_eq!(format!("{:?}", Action::Finish), "finish");
    }
}
