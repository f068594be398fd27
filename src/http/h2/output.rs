//! Priority-ordered output multiplexing
//!
//! Every frame leaving a connection goes through one
//! [`PriorityOutputScheduler`]. A writer locks the output, writes one or
//! more complete frames and unlocks it, so frames of concurrent streams never
//! interleave on the wire. Waiting writers are served highest priority
//! first, first come first served among equals. [`PRIORITY_MAX`] is
//! reserved for connection control frames.
//!
//! Locking is cooperative: a writer that cannot get the lock receives a
//! ticket and parks with [`Action::WaitRepeat`]; the lock is handed to it
//! directly on unlock and its waker is fired.

use super::error::{Error, Result};
use crate::http::transport::{io_source, Transport};
use crate::runtime::{Action, Context, IoSource, PollEvents, Waker};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::Arc;

/// Output priority; larger values are written first
pub type Priority = u32;

/// Reserved for SETTINGS, acks, GOAWAY and RST_STREAM
pub const PRIORITY_MAX: Priority = u32::MAX;

/// Priority of a stream that never sent a PRIORITY block (weight 16)
pub const PRIORITY_DEFAULT: Priority = 16;

/// Priority for a stream with the given wire weight (weight minus one)
pub fn stream_priority(wire_weight: u8) -> Priority {
    wire_weight as Priority + 1
}

/// Proof of a place in the output queue
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket(u64);

/// Result of [`PriorityOutputScheduler::lock`]
#[derive(Debug, PartialEq, Eq)]
pub enum LockState {
    /// The lock is held by this ticket
    Acquired(Ticket),
    /// Queued; the waker fires once the lock is handed over
    Queued(Ticket),
}

struct Waiter {
    priority: Priority,
    ticket: u64,
    waker: Waker,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.ticket == other.ticket
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}

#[derive(Default)]
struct OutputState {
    owner: Option<u64>,
    next_ticket: u64,
    waiters: BinaryHeap<Waiter>,
    closed: bool,
}

/// Single owner of a connection's outbound byte stream
pub struct PriorityOutputScheduler {
    transport: Arc<dyn Transport>,
    source: Arc<dyn IoSource>,
    state: Mutex<OutputState>,
}

impl PriorityOutputScheduler {
    /// Create a scheduler writing to `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let source = io_source(&transport);
        PriorityOutputScheduler {
            transport,
            source,
            state: Mutex::new(OutputState::default()),
        }
    }

    /// Ask for the lock at `priority`
    pub fn lock(&self, priority: Priority, waker: Waker) -> Result<LockState> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        if state.owner.is_none() {
            state.owner = Some(ticket);
            return Ok(LockState::Acquired(Ticket(ticket)));
        }
        state.waiters.push(Waiter {
            priority,
            ticket,
            waker,
        });
        Ok(LockState::Queued(Ticket(ticket)))
    }

    /// Whether the lock was handed to `ticket`
    pub fn poll_lock(&self, ticket: &Ticket) -> Result<bool> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(state.owner == Some(ticket.0))
    }

    /// Write through the lock held by `ticket`
    pub fn write(&self, ticket: &Ticket, buf: &[u8]) -> io::Result<usize> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            if state.owner != Some(ticket.0) {
                return Err(io::Error::new(io::ErrorKind::Other, "output is not locked by this writer"));
            }
        }
        self.transport.write(buf)
    }

    /// Release the lock held by `ticket`, or leave the queue
    ///
    /// The lock passes to the highest priority waiter, whose waker fires.
    pub fn unlock(&self, ticket: Ticket) {
        let next = {
            let mut state = self.state.lock();
            if state.owner != Some(ticket.0) {
                state.waiters.retain(|waiter| waiter.ticket != ticket.0);
                return;
            }
            state.owner = None;
            let next = state.waiters.pop();
            if let Some(waiter) = &next {
                state.owner = Some(waiter.ticket);
            }
            next
        };
        if let Some(waiter) = next {
            waiter.waker.wake();
        }
    }

    /// Refuse further writers and wake everyone waiting
    pub fn close(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.waker.wake();
        }
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued writers
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Readiness source of the underlying transport
    pub fn io_source(&self) -> Arc<dyn IoSource> {
        Arc::clone(&self.source)
    }
}

/// Outcome of a non-blocking sender step
#[derive(Debug)]
pub enum Progress {
    /// Done; carry on
    Ready,
    /// Return this action and call again when resumed
    Pending(Action),
}

/// Queue of complete frames written under one output lock
///
/// Owned by a coroutine. Frames are queued, then [`poll_flush`] locks the
/// output, writes everything and unlocks it. Dropping the sender releases the
/// lock or its place in the queue.
///
/// [`poll_flush`]: FrameSender::poll_flush
pub struct FrameSender {
    output: Arc<PriorityOutputScheduler>,
    priority: Priority,
    ticket: Option<Ticket>,
    held: bool,
    pending: VecDeque<Bytes>,
}

impl FrameSender {
    /// Create a sender writing at `priority`
    pub fn new(output: Arc<PriorityOutputScheduler>, priority: Priority) -> Self {
        FrameSender {
            output,
            priority,
            ticket: None,
            held: false,
            pending: VecDeque::new(),
        }
    }

    /// Queue a complete frame
    pub fn queue(&mut self, frame: Bytes) {
        self.pending.push_back(frame);
    }

    /// Whether frames are waiting to be written
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether this sender holds the output lock
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// The output this sender writes to
    pub fn output(&self) -> &Arc<PriorityOutputScheduler> {
        &self.output
    }

    /// Acquire the output lock
    pub fn poll_acquire(&mut self, cx: &Context<'_>) -> Result<Progress> {
        if self.held {
            return Ok(Progress::Ready);
        }
        let acquired = match &self.ticket {
            Some(ticket) => self.output.poll_lock(ticket)?,
            None => match self.output.lock(self.priority, cx.waker())? {
                LockState::Acquired(ticket) => {
                    self.ticket = Some(ticket);
                    true
                }
                LockState::Queued(ticket) => {
                    self.ticket = Some(ticket);
                    false
                }
            },
        };
        if acquired {
            self.held = true;
            Ok(Progress::Ready)
        } else {
            Ok(Progress::Pending(Action::WaitRepeat))
        }
    }

    /// Write every queued frame, then release the lock
    pub fn poll_flush(&mut self, cx: &Context<'_>) -> Result<Progress> {
        if self.pending.is_empty() {
            self.release();
            return Ok(Progress::Ready);
        }
        if let Progress::Pending(action) = self.poll_acquire(cx)? {
            return Ok(Progress::Pending(action));
        }
        let Some(ticket) = &self.ticket else {
            return Err(Error::Internal("output lock held without a ticket".to_string()));
        };

        while let Some(frame) = self.pending.front_mut() {
            match self.output.write(ticket, frame) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    frame.advance(n);
                    if frame.is_empty() {
                        self.pending.pop_front();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Pending(Action::WaitIo {
                        source: self.output.io_source(),
                        events: PollEvents::Write,
                    }));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        self.release();
        Ok(Progress::Ready)
    }

    /// Give up the lock or the place in the queue
    pub fn release(&mut self) {
        self.held = false;
        if let Some(ticket) = self.ticket.take() {
            self.output.unlock(ticket);
        }
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::MemoryTransport;

    fn scheduler() -> (Arc<MemoryTransport>, PriorityOutputScheduler) {
        let transport = Arc::new(MemoryTransport::new());
        let output = PriorityOutputScheduler::new(transport.clone());
        (transport, output)
    }

    struct LockOrder {
        output: Arc<PriorityOutputScheduler>,
        seen: Arc<parking_lot::Mutex<Vec<bool>>>,
    }

    impl crate::runtime::Coroutine for LockOrder {
        fn act(&mut self, cx: &mut Context<'_>) -> Action {
            let lock = |priority| self.output.lock(priority, cx.waker()).unwrap();
            let LockState::Acquired(first) = lock(1) else {
                return Action::error("first lock must be acquired");
            };
            let LockState::Queued(low) = lock(1) else {
                return Action::error("second lock must queue");
            };
            let LockState::Queued(high) = lock(5) else {
                return Action::error("third lock must queue");
            };
            let LockState::Queued(control) = lock(PRIORITY_MAX) else {
                return Action::error("fourth lock must queue");
            };

            let mut seen = self.seen.lock();
            self.output.unlock(first);
            seen.push(self.output.poll_lock(&control).unwrap());
            self.output.unlock(control);
            seen.push(self.output.poll_lock(&high).unwrap());
            seen.push(self.output.poll_lock(&low).unwrap());
            self.output.unlock(high);
            seen.push(self.output.poll_lock(&low).unwrap());
            self.output.unlock(low);
            Action::Finish
        }
    }

    #[test]
    fn test_lock_handoff_order() {
        let (_transport, output) = scheduler();
        let output = Arc::new(output);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let scheduler = crate::runtime::Scheduler::new(&crate::config::SchedulerConfig::default()).unwrap();
        scheduler
            .submit(LockOrder {
                output: output.clone(),
                seen: seen.clone(),
            })
            .unwrap();
        assert!(scheduler.wait_all_finished(std::time::Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![true, true, false, true]);
        assert_eq!(output.waiting(), 0);
    }

    #[test]
    fn test_stream_priority() {
        assert_eq!(stream_priority(15), PRIORITY_DEFAULT);
        assert_eq!(stream_priority(255), 256);
        assert!(stream_priority(255) < PRIORITY_MAX);
    }

    #[test]
    fn test_write_requires_lock() {
        let (transport, output) = scheduler();
        assert!(output.write(&Ticket(7), b"x").is_err());
        assert!(transport.output().is_empty());
        assert!(!output.is_closed());
        assert_eq!(output.waiting(), 0);
    }

    #[test]
    fn test_close_rejects_writers() {
        let (_transport, output) = scheduler();
        output.close();
        assert!(output.is_closed());
        assert!(matches!(output.poll_lock(&Ticket(0)), Err(Error::ConnectionClosed)));
    }
}
