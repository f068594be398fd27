//! Tasks, coroutines and wakers
//!
//! A coroutine is an explicit state machine: the scheduler calls
//! [`Coroutine::act`] and the coroutine returns an [`Action`] describing how
//! it wants to be suspended. The "continuation" is whatever state the
//! coroutine stored before returning.

use super::action::Action;
use super::error::{Error, Result};
use super::processor::ProcessorSet;
use super::scheduler::{SchedulerHandle, SchedulerInner};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Stable task identity inside one scheduler
pub type TaskId = u64;

/// A suspendable unit of work
pub trait Coroutine: Send + 'static {
    /// Run one step
    fn act(&mut self, cx: &mut Context<'_>) -> Action;

    /// Recover from a failed step
    ///
    /// Returning [`Action::Error`] again escalates: the task is force-finished
    /// and counted as failed.
    fn handle_error(&mut self, error: Error) -> Action {
        Action::Error(error)
    }

    /// Called once when the task is dropped because it was aborted
    fn on_abort(&mut self) {}

    /// Short name for logs
    fn name(&self) -> &'static str {
        "coroutine"
    }
}

/// State shared between a task, its wakers and the scheduler registry
pub(crate) struct TaskShared {
    id: TaskId,
    aborted: AtomicBool,
    notified: AtomicBool,
    parked: Mutex<Option<Task>>,
}

impl TaskShared {
    pub(crate) fn new(id: TaskId) -> Self {
        TaskShared {
            id,
            aborted: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            parked: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Park `task` until woken. Hands the task back if a wake already arrived.
    pub(crate) fn park(&self, task: Task) -> Option<Task> {
        let mut slot = self.parked.lock();
        if self.notified.swap(false, Ordering::AcqRel) || self.is_aborted() {
            return Some(task);
        }
        *slot = Some(task);
        None
    }

    /// Take the parked task, or remember the wake for the next park.
    pub(crate) fn unpark(&self) -> Option<Task> {
        let mut slot = self.parked.lock();
        match slot.take() {
            Some(task) => Some(task),
            None => {
                self.notified.store(true, Ordering::Release);
                None
            }
        }
    }
}

/// A scheduled coroutine plus its shared state
pub(crate) struct Task {
    pub(crate) shared: Arc<TaskShared>,
    pub(crate) coroutine: Box<dyn Coroutine>,
}

impl Task {
    pub(crate) fn id(&self) -> TaskId {
        self.shared.id
    }

    pub(crate) fn name(&self) -> &'static str {
        self.coroutine.name()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Handle that resumes a task parked with [`Action::WaitRepeat`]
///
/// Waking a task that is not parked is remembered: its next `WaitRepeat`
/// returns immediately instead of parking.
#[derive(Clone)]
pub struct Waker {
    shared: Arc<TaskShared>,
    processors: Weak<ProcessorSet>,
}

impl Waker {
    /// Ask for the task to be repeated
    pub fn wake(&self) {
        if let Some(task) = self.shared.unpark() {
            if let Some(processors) = self.processors.upgrade() {
                processors.push_balanced(task);
            }
        }
    }

    /// Id of the task this waker resumes
    pub fn task_id(&self) -> TaskId {
        self.shared.id
    }

    /// Whether both wakers resume the same task
    pub fn will_wake(&self, other: &Waker) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").field("task_id", &self.shared.id).finish()
    }
}

/// What a running step can see of its scheduler
pub struct Context<'a> {
    shared: &'a Arc<TaskShared>,
    scheduler: &'a Arc<SchedulerInner>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(shared: &'a Arc<TaskShared>, scheduler: &'a Arc<SchedulerInner>) -> Self {
        Context { shared, scheduler }
    }

    /// Id of the running task
    pub fn task_id(&self) -> TaskId {
        self.shared.id
    }

    /// Whether an abort was requested for the running task
    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    /// Waker for the running task
    pub fn waker(&self) -> Waker {
        Waker {
            shared: Arc::clone(self.shared),
            processors: Arc::downgrade(self.scheduler.processors()),
        }
    }

    /// Submit an independent task to the same scheduler
    pub fn spawn<C: Coroutine>(&self, coroutine: C) -> Result<TaskId> {
        self.scheduler.submit(Box::new(coroutine))
    }

    /// Handle to the scheduler running this task
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::from_inner(Arc::clone(self.scheduler))
    }
}
