//! Naive blocking I/O worker

use super::{join_threads, spawn_thread, Wait, Worker};
use crate::runtime::action::{IoSource, PollEvents};
use crate::runtime::error::Result;
use crate::runtime::processor::ProcessorSet;
use crate::runtime::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

struct Pending {
    task: Task,
    source: Arc<dyn IoSource>,
    events: PollEvents,
}

struct Shared {
    queue: Mutex<VecDeque<Pending>>,
    available: Condvar,
    stopped: AtomicBool,
    processors: Arc<ProcessorSet>,
    tick: Duration,
}

/// Pool of threads, each polling one waiting source for at most one tick
///
/// A source that is not ready goes back to the end of the queue so every
/// waiting task gets its turn.
pub(crate) struct BlockingIoWorker {
    name: String,
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockingIoWorker {
    pub(crate) fn start(
        name: &str,
        threads: usize,
        processors: Arc<ProcessorSet>,
        tick: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
            processors,
            tick,
        });

        let worker = BlockingIoWorker {
            name: name.to_string(),
            shared,
            threads: Mutex::new(Vec::new()),
        };

        for index in 0..threads.max(1) {
            let shared = Arc::clone(&worker.shared);
            match spawn_thread(format!("{}-{}", name, index), move || run(shared)) {
                Ok(handle) => worker.threads.lock().push(handle),
                Err(e) => {
                    worker.stop();
                    worker.join();
                    return Err(e);
                }
            }
        }

        Ok(worker)
    }
}

impl Worker for BlockingIoWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn push_task(&self, task: Task, wait: Wait) {
        match wait {
            Wait::Io { source, events } => {
                let mut queue = self.shared.queue.lock();
                queue.push_back(Pending {
                    task,
                    source,
                    events,
                });
                self.shared.available.notify_one();
            }
            Wait::Timer(_) => {
                warn!(worker = %self.name, task_id = task.id(), "Timer wait sent to I/O worker");
                self.shared.processors.push_balanced(task);
            }
        }
    }

    fn stop(&self) {
        let mut queue = self.shared.queue.lock();
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.available.notify_all();
        if !queue.is_empty() {
            debug!(worker = %self.name, pending = queue.len(), "Dropping waiting tasks");
        }
        queue.clear();
    }

    fn join(&self) {
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        join_threads(handles);
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let pending = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.stopped.load(Ordering::Acquire) {
                    return;
                }
                if let Some(pending) = queue.pop_front() {
                    break pending;
                }
                shared.available.wait(&mut queue);
            }
        };

        if pending.task.shared.is_aborted() {
            shared.processors.push_balanced(pending.task);
            continue;
        }

        match pending.source.poll(pending.events, Some(shared.tick)) {
            Ok(false) => {
                let mut queue = shared.queue.lock();
                if shared.stopped.load(Ordering::Acquire) {
                    return;
                }
                queue.push_back(pending);
            }
            Ok(true) => shared.processors.push_balanced(pending.task),
            Err(e) => {
                // The task's next read or write reports the failure
                debug!(task_id = pending.task.id(), error = %e, "Poll failed");
                shared.processors.push_balanced(pending.task);
            }
        }
    }
}
