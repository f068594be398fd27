//! Byte-stream transports
//!
//! This module provides the transport abstraction that lets the HTTP/2
//! session run over plain TCP, an in-memory pipe, or any other duplex byte
//! stream (a TLS connection wrapper, for instance) with the same code.
//!
//! Transports are non-blocking: `read` and `write` return
//! [`io::ErrorKind::WouldBlock`] instead of blocking, and the caller suspends
//! on the transport's readiness through [`io_source`].

use crate::runtime::{IoSource, PollEvents};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transport operations trait
///
/// This trait defines the operations that can be performed on a connection,
/// abstracting over the underlying byte stream. All methods take `&self` so
/// the reading session and the writing stream tasks can share one transport.
pub trait Transport: Send + Sync {
    /// Poll the transport for events
    ///
    /// Returns true if the transport is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool>;

    /// Descriptor for readiness multiplexing, if any
    fn raw_fd(&self) -> Option<RawFd>;

    /// Read data without blocking
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data without blocking
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the transport
    fn close(&self) -> io::Result<()>;

    /// Prepare the transport for non-blocking use by a session
    fn init_contexts(&self) -> io::Result<()> {
        Ok(())
    }

    /// Remote address, for logging
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Adapts a transport to the scheduler's I/O wait contract
struct TransportSource(Arc<dyn Transport>);

impl IoSource for TransportSource {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        self.0.poll(events, timeout)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.0.raw_fd()
    }
}

/// Wrap a transport so tasks can wait on its readiness
pub fn io_source(transport: &Arc<dyn Transport>) -> Arc<dyn IoSource> {
    Arc::new(TransportSource(Arc::clone(transport)))
}

/// Plain TCP transport
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Create a new transport from a connected TCP stream
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(TcpTransport { stream, peer })
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        use libc::{poll, pollfd, POLLIN, POLLOUT};

        let mut pfd = pollfd {
            fd: self.stream.as_raw_fd(),
            events: match events {
                PollEvents::Read => POLLIN,
                PollEvents::Write => POLLOUT,
                PollEvents::Both => POLLIN | POLLOUT,
            },
            revents: 0,
        };

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1); // -1 = infinite

        // SAFETY: `pfd` is a valid, exclusively borrowed pollfd for the call.
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        Ok(result > 0)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn init_contexts(&self) -> io::Result<()> {
        self.stream.set_nonblocking(true)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    input: VecDeque<u8>,
    eof: bool,
    output: Vec<u8>,
    closed: bool,
}

/// In-memory transport
///
/// Input is fed with [`push_input`](MemoryTransport::push_input) and ended
/// with [`finish_input`](MemoryTransport::finish_input); everything written
/// is captured and can be inspected with
/// [`output`](MemoryTransport::output). It has no descriptor, so the
/// scheduler serves it from the blocking I/O worker.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    changed: Condvar,
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with preloaded input
    pub fn with_input(input: &[u8]) -> Self {
        let transport = Self::new();
        transport.push_input(input);
        transport
    }

    /// Append bytes for the reader
    pub fn push_input(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.input.extend(bytes);
        self.changed.notify_all();
    }

    /// Signal end of input; reads return 0 once the buffer drains
    pub fn finish_input(&self) {
        let mut state = self.state.lock();
        state.eof = true;
        self.changed.notify_all();
    }

    /// Copy of everything written so far
    pub fn output(&self) -> Vec<u8> {
        self.state.lock().output.clone()
    }

    /// Take everything written so far
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().output)
    }

    /// Whether [`Transport::close`] was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until the transport is closed. Returns false on timeout.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.closed {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.closed;
            }
        }
        true
    }

    /// Wait until at least `len` bytes were written. Returns false on timeout.
    pub fn wait_output(&self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.output.len() < len {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.output.len() >= len;
            }
        }
        true
    }
}

impl Transport for MemoryTransport {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        if !events.is_read() {
            return Ok(true);
        }
        let ready = |state: &MemoryState| !state.input.is_empty() || state.eof || state.closed;

        let mut state = self.state.lock();
        if ready(&state) {
            return Ok(true);
        }
        match timeout {
            Some(timeout) => {
                self.changed.wait_for(&mut state, timeout);
            }
            None => {
                while !ready(&state) {
                    self.changed.wait(&mut state);
                }
            }
        }
        Ok(ready(&state))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(0);
        }
        if state.input.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.output.extend_from_slice(buf);
        self.changed.notify_all();
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
        Ok(())
    }
}
