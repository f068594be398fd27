//! HTTP/2 server
//!
//! [`ConnectionHandler`] turns connections into scheduled [`Session`]s and
//! counts the live ones. [`H2Server`] owns a listening socket and runs an
//! accept coroutine feeding the handler.

use super::error::Result;
use super::processing::RequestHandler;
use super::session::{Session, SessionConfig, SessionCounter};
use crate::config::ServerConfig;
use crate::http::transport::{TcpTransport, Transport};
use crate::runtime::{Action, Context, Coroutine, IoSource, PollEvents, SchedulerHandle, TaskId};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Delegation parameter carrying bytes already read from the connection
pub const H2FRAME_PARAM: &str = "h2frame";

/// Parameters passed along with a delegated connection
pub type ConnectionParams = HashMap<String, Bytes>;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Starts one session per connection
pub struct ConnectionHandler {
    scheduler: SchedulerHandle,
    config: SessionConfig,
    handler: Arc<dyn RequestHandler>,
    sessions: SessionCounter,
}

impl ConnectionHandler {
    /// Create a handler running sessions on `scheduler`
    pub fn new(scheduler: SchedulerHandle, config: SessionConfig, handler: Arc<dyn RequestHandler>) -> Self {
        ConnectionHandler {
            scheduler,
            config,
            handler,
            sessions: SessionCounter::new(),
        }
    }

    /// Take over a connection
    ///
    /// A protocol upgrade that already consumed part of the HTTP/2 input
    /// passes it as [`H2FRAME_PARAM`].
    pub fn handle_connection(&self, transport: Arc<dyn Transport>, params: &ConnectionParams) -> Result<TaskId> {
        let peer = transport.peer_addr();
        let mut session = Session::new(transport, &self.config, Arc::clone(&self.handler))?
            .with_counter(&self.sessions);
        if let Some(prefetched) = params.get(H2FRAME_PARAM) {
            session = session.with_prefetched(prefetched);
        }
        let id = self.scheduler.submit(session)?;
        debug!(task_id = %id, peer = ?peer, "session started");
        Ok(id)
    }

    /// Sessions currently alive
    pub fn sessions_count(&self) -> usize {
        self.sessions.count()
    }

    /// Counter of live sessions
    pub fn sessions(&self) -> &SessionCounter {
        &self.sessions
    }
}

struct Listener(TcpListener);

impl IoSource for Listener {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.0.as_raw_fd(),
            events: if events.is_read() { libc::POLLIN } else { libc::POLLOUT },
            revents: 0,
        };
        let timeout_ms = timeout.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as i32);
        // SAFETY: `pfd` is a valid, exclusively borrowed pollfd for the call.
        let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
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
        Some(self.0.as_raw_fd())
    }
}

fn bind(config: &ServerConfig) -> io::Result<TcpListener> {
    let addr = config.listen;
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(config.backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

struct Acceptor {
    listener: Arc<Listener>,
    connections: Arc<ConnectionHandler>,
    stopped: Arc<AtomicBool>,
    backoff: Duration,
}

impl Coroutine for Acceptor {
    fn act(&mut self, _cx: &mut Context<'_>) -> Action {
        if self.stopped.load(Ordering::Acquire) {
            return Action::Finish;
        }
        match self.listener.0.accept() {
            Ok((stream, addr)) => {
                self.backoff = ACCEPT_BACKOFF_MIN;
                let transport = match TcpTransport::new(stream) {
                    Ok(transport) => Arc::new(transport),
                    Err(err) => {
                        warn!(peer = %addr, error = %err, "dropping connection");
                        return Action::Continue;
                    }
                };
                if let Err(err) = self.connections.handle_connection(transport, &ConnectionParams::new()) {
                    error!(peer = %addr, error = %err, "failed to start session");
                }
                Action::Continue
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Action::wait_read(Arc::clone(&self.listener) as Arc<dyn IoSource>)
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Action::Continue,
            Err(err) => {
                warn!(error = %err, backoff_ms = self.backoff.as_millis() as u64, "accept failed");
                let deadline = Instant::now() + self.backoff;
                self.backoff = (self.backoff * 2).min(ACCEPT_BACKOFF_MAX);
                Action::WaitTimer(deadline)
            }
        }
    }

    fn name(&self) -> &'static str {
        "h2-acceptor"
    }
}

/// Listening HTTP/2 server
pub struct H2Server {
    listener: Arc<Listener>,
    local_addr: SocketAddr,
    connections: Arc<ConnectionHandler>,
    scheduler: SchedulerHandle,
    stopped: Arc<AtomicBool>,
    acceptor: Option<TaskId>,
}

impl H2Server {
    /// Bind the listening socket
    pub fn bind(config: &ServerConfig, connections: ConnectionHandler) -> Result<Self> {
        let listener = bind(config)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");
        let scheduler = connections.scheduler.clone();
        Ok(H2Server {
            listener: Arc::new(Listener(listener)),
            local_addr,
            connections: Arc::new(connections),
            scheduler,
            stopped: Arc::new(AtomicBool::new(false)),
            acceptor: None,
        })
    }

    /// Address the server listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The handler sessions are started by
    pub fn connections(&self) -> &Arc<ConnectionHandler> {
        &self.connections
    }

    /// Start accepting connections
    pub fn start(&mut self) -> Result<TaskId> {
        if let Some(id) = self.acceptor {
            return Ok(id);
        }
        self.stopped.store(false, Ordering::Release);
        let id = self.scheduler.submit(Acceptor {
            listener: Arc::clone(&self.listener),
            connections: Arc::clone(&self.connections),
            stopped: Arc::clone(&self.stopped),
            backoff: ACCEPT_BACKOFF_MIN,
        })?;
        self.acceptor = Some(id);
        Ok(id)
    }

    /// Stop accepting; running sessions are left alone
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(id) = self.acceptor.take() {
            self.scheduler.abort(id);
        }
    }
}

impl Drop for H2Server {
    fn drop(&mut self) {
        self.stop();
    }
}
