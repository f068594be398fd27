//! Scheduler: processors, workers and the live task registry

use super::error::{Error, Result};
use super::processor::{Processor, ProcessorSet};
use super::task::{Coroutine, Task, TaskId, TaskShared};
use super::worker::{
    join_threads, spawn_thread, BlockingIoWorker, EventIoWorker, TimerWorker, Wait, Worker,
};
use crate::config::{IoWorkerKind, SchedulerConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a task left the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Finished,
    Failed,
    Aborted,
}

/// State shared by the scheduler, its handles and every processor thread
pub(crate) struct SchedulerInner {
    processors: Arc<ProcessorSet>,
    event_workers: Vec<Box<dyn Worker>>,
    blocking_worker: Box<dyn Worker>,
    timer_workers: Vec<Box<dyn Worker>>,
    worker_balancer: AtomicUsize,
    registry: Mutex<HashMap<TaskId, Arc<TaskShared>>>,
    idle: Condvar,
    next_id: AtomicU64,
    accepting: AtomicBool,
    failed: AtomicU64,
    continue_budget: u32,
}

impl SchedulerInner {
    fn start(config: &SchedulerConfig) -> Result<Self> {
        let processors = Arc::new(ProcessorSet::new(config.processors()));
        let tick = Duration::from_millis(config.io_tick_ms.max(1));

        let mut event_workers: Vec<Box<dyn Worker>> = Vec::new();
        let blocking_worker: Box<dyn Worker> = match config.io_worker {
            IoWorkerKind::Naive => Box::new(BlockingIoWorker::start(
                "h2sched-io",
                config.io_workers(),
                Arc::clone(&processors),
                tick,
            )?),
            IoWorkerKind::Event => {
                for index in 0..config.io_workers() {
                    let worker = EventIoWorker::start(
                        &format!("h2sched-event-{}", index),
                        Arc::clone(&processors),
                        tick,
                    );
                    match worker {
                        Ok(worker) => event_workers.push(Box::new(worker)),
                        Err(e) => {
                            stop_workers(&event_workers);
                            return Err(e);
                        }
                    }
                }
                // Sources without a descriptor still need somewhere to wait
                match BlockingIoWorker::start("h2sched-io", 1, Arc::clone(&processors), tick) {
                    Ok(worker) => Box::new(worker),
                    Err(e) => {
                        stop_workers(&event_workers);
                        return Err(e);
                    }
                }
            }
        };

        let mut timer_workers: Vec<Box<dyn Worker>> = Vec::new();
        for index in 0..config.timer_workers.max(1) {
            match TimerWorker::start(
                &format!("h2sched-timer-{}", index),
                Arc::clone(&processors),
                tick,
            ) {
                Ok(worker) => timer_workers.push(Box::new(worker)),
                Err(e) => {
                    stop_workers(&event_workers);
                    stop_workers(&timer_workers);
                    blocking_worker.stop();
                    blocking_worker.join();
                    return Err(e);
                }
            }
        }

        Ok(SchedulerInner {
            processors,
            event_workers,
            blocking_worker,
            timer_workers,
            worker_balancer: AtomicUsize::new(0),
            registry: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            failed: AtomicU64::new(0),
            continue_budget: config.continue_budget,
        })
    }

    pub(crate) fn processors(&self) -> &Arc<ProcessorSet> {
        &self.processors
    }

    pub(crate) fn continue_budget(&self) -> u32 {
        self.continue_budget
    }

    pub(crate) fn submit(&self, coroutine: Box<dyn Coroutine>) -> Result<TaskId> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(TaskShared::new(id));
        self.registry.lock().insert(id, Arc::clone(&shared));

        debug!(task_id = id, task = coroutine.name(), "Task submitted");
        self.processors.push_balanced(Task { shared, coroutine });
        Ok(id)
    }

    pub(crate) fn abort(&self, id: TaskId) -> bool {
        let shared = match self.registry.lock().get(&id) {
            Some(shared) => Arc::clone(shared),
            None => return false,
        };
        shared.mark_aborted();
        if let Some(task) = shared.unpark() {
            self.processors.push_balanced(task);
        }
        true
    }

    fn abort_all(&self) -> usize {
        let tasks: Vec<_> = self.registry.lock().values().cloned().collect();
        for shared in &tasks {
            self.abort(shared.id());
        }
        tasks.len()
    }

    /// Hand a suspended task to the worker serving `wait`
    pub(crate) fn dispatch(&self, task: Task, wait: Wait) {
        let turn = self.worker_balancer.fetch_add(1, Ordering::Relaxed);
        let evented = !self.event_workers.is_empty()
            && matches!(&wait, Wait::Io { source, .. } if source.raw_fd().is_some());
        match wait {
            Wait::Io { .. } if evented => {
                self.event_workers[turn % self.event_workers.len()].push_task(task, wait)
            }
            Wait::Io { .. } => self.blocking_worker.push_task(task, wait),
            Wait::Timer(_) => {
                self.timer_workers[turn % self.timer_workers.len()].push_task(task, wait)
            }
        }
    }

    /// Release a task that will not run again
    pub(crate) fn complete(&self, task: Task, outcome: Outcome) {
        let id = task.id();
        if outcome == Outcome::Failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(task_id = id, task = task.name(), ?outcome, "Task released");
        drop(task);

        let mut registry = self.registry.lock();
        registry.remove(&id);
        if registry.is_empty() {
            self.idle.notify_all();
        }
    }

    pub(crate) fn tasks_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn wait_all_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock();
        while !registry.is_empty() {
            if self.idle.wait_until(&mut registry, deadline).timed_out() {
                return registry.is_empty();
            }
        }
        true
    }

    fn stop_workers(&self) {
        stop_workers(&self.event_workers);
        stop_workers(&self.timer_workers);
        self.blocking_worker.stop();
        self.blocking_worker.join();
    }
}

fn stop_workers(workers: &[Box<dyn Worker>]) {
    for worker in workers {
        debug!(worker = worker.name(), "Stopping worker");
        worker.stop();
    }
    for worker in workers {
        worker.join();
    }
}

/// Cooperative coroutine scheduler
///
/// Owns a fixed pool of processor threads plus the I/O and timer workers.
/// New tasks and tasks returning from a worker are assigned to processors
/// round robin.
///
/// ```no_run
/// use h2sched::config::SchedulerConfig;
/// use h2sched::runtime::{Action, Context, Coroutine, Scheduler};
/// use std::time::Duration;
///
/// struct Countdown(u32);
///
/// impl Coroutine for Countdown {
///     fn act(&mut self, _cx: &mut Context<'_>) -> Action {
///         if self.0 == 0 {
///             return Action::Finish;
///         }
///         self.0 -= 1;
///         Action::Yield
///     }
/// }
///
/// let scheduler = Scheduler::new(&SchedulerConfig::default())?;
/// scheduler.submit(Countdown(10))?;
/// assert!(scheduler.wait_all_finished(Duration::from_secs(1)));
/// scheduler.shutdown();
/// # Ok::<(), h2sched::runtime::Error>(())
/// ```
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
    stopped: AtomicBool,
}

impl Scheduler {
    /// Start processor and worker threads
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        let inner = Arc::new(SchedulerInner::start(config)?);
        let scheduler = Scheduler {
            inner: Arc::clone(&inner),
            threads: Mutex::new(Vec::new()),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            stopped: AtomicBool::new(false),
        };

        for index in 0..inner.processors.len() {
            let processor = Processor::new(index, Arc::clone(&inner));
            match spawn_thread(format!("h2sched-proc-{}", index), move || processor.run()) {
                Ok(handle) => scheduler.threads.lock().push(handle),
                Err(e) => {
                    scheduler.stop_threads();
                    return Err(e);
                }
            }
        }

        info!(
            processors = inner.processors.len(),
            event_workers = inner.event_workers.len(),
            timer_workers = inner.timer_workers.len(),
            io_worker = ?config.io_worker,
            "Scheduler started"
        );
        Ok(scheduler)
    }

    /// Submit a task, returning its id
    pub fn submit<C: Coroutine>(&self, coroutine: C) -> Result<TaskId> {
        self.inner.submit(Box::new(coroutine))
    }

    /// Submit an already boxed task
    pub fn submit_boxed(&self, coroutine: Box<dyn Coroutine>) -> Result<TaskId> {
        self.inner.submit(coroutine)
    }

    /// Request early termination of a task
    ///
    /// Returns true if the task was live. The task observes the abort at its
    /// next suspension point.
    pub fn abort(&self, id: TaskId) -> bool {
        self.inner.abort(id)
    }

    /// Number of live tasks
    pub fn tasks_count(&self) -> usize {
        self.inner.tasks_count()
    }

    /// Number of tasks force-finished after an unrecovered error
    pub fn failed_count(&self) -> u64 {
        self.inner.failed_count()
    }

    /// Number of processors
    pub fn processors_count(&self) -> usize {
        self.inner.processors.len()
    }

    /// Block until no task is live or `timeout` expires. Returns true if idle.
    pub fn wait_all_finished(&self, timeout: Duration) -> bool {
        self.inner.wait_all_finished(timeout)
    }

    /// Cloneable handle for submitting from other threads or tasks
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::from_inner(Arc::clone(&self.inner))
    }

    /// Stop accepting tasks, drain, abort the rest and join every thread
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.accepting.store(false, Ordering::Release);

        if !self.inner.wait_all_finished(self.drain_timeout) {
            let aborted = self.inner.abort_all();
            warn!(tasks = aborted, "Drain timeout expired, aborting tasks");
            if !self.inner.wait_all_finished(self.drain_timeout) {
                warn!(
                    tasks = self.inner.tasks_count(),
                    "Tasks still live after abort"
                );
            }
        }

        self.stop_threads();
        info!(failed = self.inner.failed_count(), "Scheduler stopped");
    }

    fn stop_threads(&self) {
        self.inner.stop_workers();
        let dropped = self.inner.processors.stop();
        if !dropped.is_empty() {
            debug!(tasks = dropped.len(), "Dropping queued tasks");
        }
        drop(dropped);
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        join_threads(handles);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shared handle to a running [`Scheduler`]
///
/// Handles can submit and abort tasks but cannot shut the scheduler down.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<SchedulerInner>,
}

impl SchedulerHandle {
    pub(crate) fn from_inner(inner: Arc<SchedulerInner>) -> Self {
        SchedulerHandle { inner }
    }

    /// Submit a task, returning its id
    pub fn submit<C: Coroutine>(&self, coroutine: C) -> Result<TaskId> {
        self.inner.submit(Box::new(coroutine))
    }

    /// Submit an already boxed task
    pub fn submit_boxed(&self, coroutine: Box<dyn Coroutine>) -> Result<TaskId> {
        self.inner.submit(coroutine)
    }

    /// Request early termination of a task
    pub fn abort(&self, id: TaskId) -> bool {
        self.inner.abort(id)
    }

    /// Number of live tasks
    pub fn tasks_count(&self) -> usize {
        self.inner.tasks_count()
    }

    /// Number of failed tasks
    pub fn failed_count(&self) -> u64 {
        self.inner.failed_count()
    }

    /// Whether new tasks are still accepted
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Block until no task is live or `timeout` expires
    pub fn wait_all_finished(&self, timeout: Duration) -> bool {
        self.inner.wait_all_finished(timeout)
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("tasks", &self.inner.tasks_count())
            .field("queued", &self.inner.processors.queued())
            .finish()
    }
}
