//! Cooperative coroutine scheduler
//!
//! Lets many connections share a small, fixed pool of threads. A task is an
//! explicit state machine implementing [`Coroutine`]; each call to
//! [`Coroutine::act`] runs one step and returns an [`Action`] naming the
//! suspension it wants. Processors run steps, workers hold suspended tasks
//! until their I/O, timer or wake condition holds, and the [`Scheduler`]
//! ties them together.
//!
//! # Architecture
//!
//! - `Processor`: one ready queue and one thread
//! - Workers: blocking I/O pool, event-driven I/O (`polling`), timers
//! - `Scheduler`: owns both, balances tasks round robin, tracks live tasks

mod action;
mod error;
mod processor;
mod scheduler;
mod task;
mod worker;

pub use action::{Action, IoSource, PollEvents};
pub use error::{BoxError, Error, Result};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use task::{Context, Coroutine, TaskId, Waker};
