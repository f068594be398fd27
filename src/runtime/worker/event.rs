//! Event-driven I/O worker
//!
//! One thread multiplexes every registered descriptor through a
//! [`polling::Poller`]. Registrations arrive through a lock-free queue and
//! the poller is notified so the thread picks them up without waiting for
//! the tick to expire.
//!
//! `polling` delivers events in oneshot mode, so after every event the
//! descriptor is re-armed with the interest of the tasks still waiting on it,
//! or removed from the poller once nobody waits.

use super::{join_threads, spawn_thread, Wait, Worker};
use crate::runtime::action::{IoSource, PollEvents};
use crate::runtime::error::Result;
use crate::runtime::processor::ProcessorSet;
use crate::runtime::task::Task;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use polling::{Event, Poller};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

struct Registration {
    task: Task,
    fd: RawFd,
    source: Arc<dyn IoSource>,
    events: PollEvents,
}

struct Shared {
    poller: Poller,
    incoming: SegQueue<Registration>,
    stopped: AtomicBool,
    processors: Arc<ProcessorSet>,
    tick: Duration,
}

/// Waiters on one descriptor
struct FdEntry {
    // Keeps the descriptor open while it is registered
    _source: Arc<dyn IoSource>,
    waiters: Vec<(Task, PollEvents)>,
}

impl FdEntry {
    fn interest(&self, fd: RawFd) -> Event {
        Event {
            key: fd as usize,
            readable: self.waiters.iter().any(|(_, events)| events.is_read()),
            writable: self.waiters.iter().any(|(_, events)| events.is_write()),
        }
    }

    /// Remove the waiters satisfied by `event`
    fn take_ready(&mut self, event: &Event) -> Vec<Task> {
        let (ready, waiting): (Vec<_>, Vec<_>) = self.waiters.drain(..).partition(|(_, events)| {
            (event.readable && events.is_read()) || (event.writable && events.is_write())
        });
        self.waiters = waiting;
        ready.into_iter().map(|(task, _)| task).collect()
    }
}

/// Single-thread readiness multiplexer
pub(crate) struct EventIoWorker {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventIoWorker {
    pub(crate) fn start(name: &str, processors: Arc<ProcessorSet>, tick: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            poller: Poller::new()?,
            incoming: SegQueue::new(),
            stopped: AtomicBool::new(false),
            processors,
            tick,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = spawn_thread(name.to_string(), move || EventLoop::new(thread_shared).run())?;

        Ok(EventIoWorker {
            name: name.to_string(),
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }
}

impl Worker for EventIoWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn push_task(&self, task: Task, wait: Wait) {
        let (source, events) = match wait {
            Wait::Io { source, events } => (source, events),
            Wait::Timer(_) => {
                warn!(worker = %self.name, task_id = task.id(), "Timer wait sent to I/O worker");
                self.shared.processors.push_balanced(task);
                return;
            }
        };

        let Some(fd) = source.raw_fd() else {
            warn!(worker = %self.name, task_id = task.id(), "Source without descriptor");
            self.shared.processors.push_balanced(task);
            return;
        };

        self.shared.incoming.push(Registration {
            task,
            fd,
            source,
            events,
        });
        if let Err(e) = self.shared.poller.notify() {
            error!(worker = %self.name, error = %e, "Failed to notify poller");
        }
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Err(e) = self.shared.poller.notify() {
            error!(worker = %self.name, error = %e, "Failed to notify poller");
        }
    }

    fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            join_threads(vec![handle]);
        }
    }
}

struct EventLoop {
    shared: Arc<Shared>,
    entries: HashMap<RawFd, FdEntry>,
    events: Vec<Event>,
}

impl EventLoop {
    fn new(shared: Arc<Shared>) -> Self {
        EventLoop {
            shared,
            entries: HashMap::new(),
            events: Vec::new(),
        }
    }

    fn run(mut self) {
        while !self.shared.stopped.load(Ordering::Acquire) {
            while let Some(registration) = self.shared.incoming.pop() {
                self.register(registration);
            }
            self.sweep_aborted();

            self.events.clear();
            match self.shared.poller.wait(&mut self.events, Some(self.shared.tick)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poller wait failed");
                    continue;
                }
            }

            let events = std::mem::take(&mut self.events);
            for event in &events {
                self.dispatch(event);
            }
            self.events = events;
        }

        let waiting: usize = self.entries.values().map(|entry| entry.waiters.len()).sum();
        for fd in self.entries.keys() {
            if let Err(e) = self.shared.poller.delete(*fd) {
                debug!(fd, error = %e, "Failed to unregister descriptor on shutdown");
            }
        }
        while self.shared.incoming.pop().is_some() {}
        if waiting > 0 {
            debug!(waiting, "Dropping waiting tasks");
        }
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            task,
            fd,
            source,
            events,
        } = registration;

        trace!(task_id = task.id(), fd, ?events, "Register wait");

        let existed = self.entries.contains_key(&fd);
        let entry = self.entries.entry(fd).or_insert_with(|| FdEntry {
            _source: source,
            waiters: Vec::new(),
        });
        entry.waiters.push((task, events));

        let interest = entry.interest(fd);
        let armed = if existed {
            self.shared.poller.modify(fd, interest)
        } else {
            self.shared.poller.add(fd, interest)
        };
        if let Err(e) = armed {
            // The task's next read or write reports the failure
            debug!(fd, error = %e, "Failed to register descriptor");
            self.release(fd);
        }
    }

    fn dispatch(&mut self, event: &Event) {
        let fd = event.key as RawFd;
        let Some(entry) = self.entries.get_mut(&fd) else {
            return;
        };

        for task in entry.take_ready(event) {
            self.shared.processors.push_balanced(task);
        }
        self.rearm(fd);
    }

    fn sweep_aborted(&mut self) {
        let mut touched = Vec::new();
        for (fd, entry) in self.entries.iter_mut() {
            if !entry.waiters.iter().any(|(task, _)| task.shared.is_aborted()) {
                continue;
            }
            let (aborted, waiting): (Vec<_>, Vec<_>) = entry
                .waiters
                .drain(..)
                .partition(|(task, _)| task.shared.is_aborted());
            entry.waiters = waiting;
            for (task, _) in aborted {
                self.shared.processors.push_balanced(task);
            }
            touched.push(*fd);
        }
        for fd in touched {
            self.rearm(fd);
        }
    }

    /// Re-arm `fd` for its remaining waiters, or forget it
    fn rearm(&mut self, fd: RawFd) {
        let Some(entry) = self.entries.get(&fd) else {
            return;
        };
        if entry.waiters.is_empty() {
            if let Err(e) = self.shared.poller.delete(fd) {
                debug!(fd, error = %e, "Failed to unregister idle descriptor");
            }
            self.entries.remove(&fd);
            return;
        }
        if let Err(e) = self.shared.poller.modify(fd, entry.interest(fd)) {
            debug!(fd, error = %e, "Failed to re-arm descriptor");
            self.release(fd);
        }
    }

    /// Hand every waiter on `fd` back to the processors
    fn release(&mut self, fd: RawFd) {
        if let Some(entry) = self.entries.remove(&fd) {
            if let Err(e) = self.shared.poller.delete(fd) {
                debug!(fd, error = %e, "Failed to unregister released descriptor");
            }
            for (task, _) in entry.waiters {
                self.shared.processors.push_balanced(task);
            }
        }
    }
}
