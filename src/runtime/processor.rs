//! Processors: one ready queue and one thread each

use super::action::Action;
use super::error::Error;
use super::scheduler::{Outcome, SchedulerInner};
use super::task::{Context, Task};
use super::worker::Wait;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace};

/// Ready queue of a single processor
pub(crate) struct ProcessorQueue {
    tasks: Mutex<VecDeque<Task>>,
    available: Condvar,
    stopped: AtomicBool,
}

impl ProcessorQueue {
    fn new() -> Self {
        ProcessorQueue {
            tasks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        let mut tasks = self.tasks.lock();
        tasks.push_back(task);
        self.available.notify_one();
    }

    /// Block until a task is ready. Returns None once stopped.
    fn pop(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = tasks.pop_front() {
                return Some(task);
            }
            self.available.wait(&mut tasks);
        }
    }

    fn stop(&self) -> Vec<Task> {
        let mut tasks = self.tasks.lock();
        self.stopped.store(true, Ordering::Release);
        self.available.notify_all();
        tasks.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// All processor queues plus the round-robin balancer
///
/// Shared by the scheduler, the workers and every [`Waker`](super::Waker).
/// Balancing is a plain counter modulo the processor count, not work stealing.
pub(crate) struct ProcessorSet {
    queues: Vec<Arc<ProcessorQueue>>,
    balancer: AtomicUsize,
}

impl ProcessorSet {
    pub(crate) fn new(count: usize) -> Self {
        ProcessorSet {
            queues: (0..count.max(1)).map(|_| Arc::new(ProcessorQueue::new())).collect(),
            balancer: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn queue(&self, index: usize) -> Arc<ProcessorQueue> {
        Arc::clone(&self.queues[index % self.queues.len()])
    }

    /// Queue `task` on the next processor in turn
    pub(crate) fn push_balanced(&self, task: Task) {
        let index = self.balancer.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[index].push(task);
    }

    /// Stop every processor, returning the tasks still queued
    pub(crate) fn stop(&self) -> Vec<Task> {
        self.queues.iter().flat_map(|queue| queue.stop()).collect()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }
}

/// Compute worker: runs coroutine steps on a dedicated thread
pub(crate) struct Processor {
    index: usize,
    queue: Arc<ProcessorQueue>,
    scheduler: Arc<SchedulerInner>,
}

impl Processor {
    pub(crate) fn new(index: usize, scheduler: Arc<SchedulerInner>) -> Self {
        let queue = scheduler.processors().queue(index);
        Processor {
            index,
            queue,
            scheduler,
        }
    }

    /// Processor loop, returns once the queue is stopped
    pub(crate) fn run(self) {
        debug!(processor = self.index, "Processor started");
        while let Some(task) = self.queue.pop() {
            self.run_task(task);
        }
        debug!(processor = self.index, "Processor stopped");
    }

    fn run_task(&self, mut task: Task) {
        if task.shared.is_aborted() {
            self.abort(task);
            return;
        }

        let mut budget = self.scheduler.continue_budget();
        let mut action = self.step(&mut task);

        loop {
            if task.shared.is_aborted() && !matches!(action, Action::Finish | Action::Error(_)) {
                self.abort(task);
                return;
            }

            trace!(task_id = task.id(), action = action.kind(), "Step done");

            match action {
                Action::Continue => {
                    if budget == 0 {
                        self.queue.push(task);
                        return;
                    }
                    budget -= 1;
                    action = self.step(&mut task);
                }
                Action::Yield => {
                    self.queue.push(task);
                    return;
                }
                Action::WaitIo { source, events } => {
                    self.scheduler.dispatch(task, Wait::Io { source, events });
                    return;
                }
                Action::WaitTimer(deadline) => {
                    if deadline <= Instant::now() {
                        self.queue.push(task);
                    } else {
                        self.scheduler.dispatch(task, Wait::Timer(deadline));
                    }
                    return;
                }
                Action::WaitRepeat => {
                    let shared = Arc::clone(&task.shared);
                    if let Some(task) = shared.park(task) {
                        self.queue.push(task);
                    }
                    return;
                }
                Action::Finish => {
                    self.scheduler.complete(task, Outcome::Finished);
                    return;
                }
                Action::Error(err) => match self.recover(&mut task, err) {
                    Some(next) => action = next,
                    None => {
                        self.scheduler.complete(task, Outcome::Failed);
                        return;
                    }
                },
            }
        }
    }

    /// Run one step, turning a panic into an error
    fn step(&self, task: &mut Task) -> Action {
        let id = task.id();
        let shared = Arc::clone(&task.shared);
        let coroutine = &mut task.coroutine;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut cx = Context::new(&shared, &self.scheduler);
            coroutine.act(&mut cx)
        }));
        result.unwrap_or_else(|payload| Action::Error(Error::Panicked(id, panic_message(&*payload))))
    }

    /// Give the task's error handler a chance. None means force-finish.
    fn recover(&self, task: &mut Task, err: Error) -> Option<Action> {
        let id = task.id();
        let name = task.name();
        debug!(task_id = id, task = name, error = %err, "Task step failed");

        let coroutine = &mut task.coroutine;
        match panic::catch_unwind(AssertUnwindSafe(|| coroutine.handle_error(err))) {
            Ok(Action::Error(err)) => {
                error!(task_id = id, task = name, error = %err, "Task failed");
                None
            }
            Ok(next) => Some(next),
            Err(payload) => {
                error!(
                    task_id = id,
                    task = name,
                    panic = %panic_message(&*payload),
                    "Task error handler panicked"
                );
                None
            }
        }
    }

    fn abort(&self, mut task: Task) {
        debug!(task_id = task.id(), task = task.name(), "Task aborted");
        let coroutine = &mut task.coroutine;
        if panic::catch_unwind(AssertUnwindSafe(|| coroutine.on_abort())).is_err() {
            error!(task_id = task.id(), "Abort hook panicked");
        }
        self.scheduler.complete(task, Outcome::Aborted);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");

        let payload = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "code 7");
    }

    #[test]
    fn test_processor_set_len() {
        let set = ProcessorSet::new(0);
        assert_eq!(set.len(), 1);
        assert_eq!(ProcessorSet::new(4).len(), 4);
        assert_eq!(set.queued(), 0);
    }
}
