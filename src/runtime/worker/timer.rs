//! Timer worker

use super::{join_threads, spawn_thread, Wait, Worker};
use crate::runtime::error::Result;
use crate::runtime::processor::ProcessorSet;
use crate::runtime::task::Task;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A sleeping task in the heap
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap: earliest deadline, then earliest insertion
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    stopped: bool,
}

impl TimerState {
    fn insert(&mut self, task: Task, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            task,
        });
    }

    /// Pop every entry due at `now`
    fn pop_expired(&mut self, now: Instant) -> Vec<Task> {
        let mut expired = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                expired.push(entry.task);
            }
        }
        expired
    }

    /// Remove every aborted entry
    fn take_aborted(&mut self) -> Vec<Task> {
        if !self.heap.iter().any(|entry| entry.task.shared.is_aborted()) {
            return Vec::new();
        }
        let (aborted, sleeping): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|entry| entry.task.shared.is_aborted());
        self.heap = sleeping.into();
        aborted.into_iter().map(|entry| entry.task).collect()
    }
}

struct Shared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    processors: Arc<ProcessorSet>,
    tick: Duration,
}

/// Min-heap of deadlines served by one thread
pub(crate) struct TimerWorker {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWorker {
    pub(crate) fn start(name: &str, processors: Arc<ProcessorSet>, tick: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
            processors,
            tick,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = spawn_thread(name.to_string(), move || run(thread_shared))?;

        Ok(TimerWorker {
            name: name.to_string(),
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }
}

impl Worker for TimerWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn push_task(&self, task: Task, wait: Wait) {
        match wait {
            Wait::Timer(deadline) => {
                let mut state = self.shared.state.lock();
                let earliest = state.heap.peek().map(|entry| entry.deadline);
                state.insert(task, deadline);
                if earliest.map_or(true, |earliest| deadline < earliest) {
                    self.shared.wakeup.notify_one();
                }
            }
            Wait::Io { .. } => {
                warn!(worker = %self.name, task_id = task.id(), "I/O wait sent to timer worker");
                self.shared.processors.push_balanced(task);
            }
        }
    }

    fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        if !state.heap.is_empty() {
            debug!(worker = %self.name, pending = state.heap.len(), "Dropping sleeping tasks");
        }
        state.heap.clear();
        self.shared.wakeup.notify_all();
    }

    fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            join_threads(vec![handle]);
        }
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    while !state.stopped {
        for task in state.take_aborted() {
            shared.processors.push_balanced(task);
        }

        let now = Instant::now();
        for task in state.pop_expired(now) {
            shared.processors.push_balanced(task);
        }

        let next_tick = now + shared.tick;
        let until = state
            .heap
            .peek()
            .map_or(next_tick, |entry| entry.deadline.min(next_tick));
        shared.wakeup.wait_until(&mut state, until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::{Coroutine, Context, TaskShared};
    use crate::runtime::Action;

    struct Idle;

    impl Coroutine for Idle {
        fn act(&mut self, _cx: &mut Context<'_>) -> Action {
            Action::Finish
        }
    }

    fn task(id: u64) -> Task {
        Task {
            shared: Arc::new(TaskShared::new(id)),
            coroutine: Box::new(Idle),
        }
    }

    #[test]
    fn test_earliest_first() {
        let base = Instant::now();
        let mut state = TimerState::default();
        state.insert(task(1), base + Duration::from_millis(100));
        state.insert(task(2), base + Duration::from_millis(50));
        state.insert(task(3), base + Duration::from_millis(150));

        let expired = state.pop_expired(base + Duration::from_millis(100));
        let ids: Vec<_> = expired.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(state.heap.len(), 1);
    }

    #[test]
    fn test_equal_deadlines_fifo() {
        let deadline = Instant::now();
        let mut state = TimerState::default();
        for id in 1..=3 {
            state.insert(task(id), deadline);
        }
        let ids: Vec<_> = state.pop_expired(deadline).iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_take_aborted() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let mut state = TimerState::default();
        let victim = task(7);
        victim.shared.mark_aborted();
        state.insert(task(1), deadline);
        state.insert(victim, deadline);

        let aborted = state.take_aborted();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].id(), 7);
        assert_eq!(state.heap.len(), 1);
        assert!(state.take_aborted().is_empty());
    }
}
