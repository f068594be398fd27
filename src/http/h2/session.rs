//! HTTP/2 server session
//!
//! One [`Session`] per connection. It is a long-running coroutine that owns
//! all connection-wide protocol state: both settings sets, the header codec
//! context, the stream map and the connection receive window. Frames are
//! read and dispatched strictly one at a time; complete requests are handed
//! to independent [`StreamTask`]s.
//!
//! Every protocol violation is classified (see [`H2Error`]). Connection
//! errors end the session with GOAWAY, stream errors reset only the stream
//! with RST_STREAM.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, ErrorScope, H2Error, H2Result, Result};
use super::flow_control::FlowControlWindow;
use super::frames::{
    FrameHeader, FrameType, GoawayFrame, PingFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame,
    FRAME_HEADER_SIZE,
};
use super::header_codec::HpackCodec;
use super::output::{FrameSender, PriorityOutputScheduler, Progress, PRIORITY_MAX};
use super::processing::{ConnectionShared, H2Request, RequestHandler, StreamTask};
use super::settings::Http2Settings;
use super::stream::{StreamHandler, StreamState};
use super::{StreamId, CONNECTION_PREFACE, CONNECTION_STREAM_ID};
use crate::http::transport::{io_source, Transport};
use crate::runtime::{self, Action, Context, Coroutine, IoSource};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Forgotten stream ids remembered for late HEADERS
const CLOSED_HISTORY: usize = 256;

/// Per-connection protocol configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Settings this endpoint advertises
    pub local_settings: Http2Settings,
    /// Expect the client connection preface before the first frame
    pub require_preface: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_settings: Http2Settings::DEFAULT,
            require_preface: true,
        }
    }
}

/// Number of live sessions
#[derive(Debug, Clone, Default)]
pub struct SessionCounter(Arc<AtomicUsize>);

impl SessionCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions currently alive
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> SessionGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        SessionGuard(Arc::clone(&self.0))
    }
}

#[derive(Debug)]
struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Start,
    Preface,
    Header,
    Payload(FrameHeader),
    Teardown,
}

/// Connection frame dispatcher
pub struct Session {
    transport: Arc<dyn Transport>,
    source: Arc<dyn IoSource>,
    connection: Arc<ConnectionShared>,
    handler: Arc<dyn RequestHandler>,
    local: Http2Settings,
    peer: Http2Settings,
    require_preface: bool,
    streams: HashMap<StreamId, StreamHandler>,
    last_stream: Option<StreamId>,
    highest_stream_id: StreamId,
    forgotten: VecDeque<StreamId>,
    recv_window: FlowControlWindow,
    sender: FrameSender,
    read_buf: BytesMut,
    phase: Phase,
    closed: bool,
    _guard: Option<SessionGuard>,
}

impl Session {
    /// Create a session over `transport`
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &SessionConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        config.local_settings.validate()?;
        transport.init_contexts()?;

        let local = config.local_settings;
        let output = Arc::new(PriorityOutputScheduler::new(Arc::clone(&transport)));
        let codec = HpackCodec::new(local.header_table_size() as usize);
        let connection = Arc::new(ConnectionShared::new(Arc::clone(&output), Box::new(codec)));

        Ok(Session {
            source: io_source(&transport),
            transport,
            connection,
            handler,
            local,
            peer: Http2Settings::DEFAULT,
            require_preface: config.require_preface,
            streams: HashMap::new(),
            last_stream: None,
            highest_stream_id: 0,
            forgotten: VecDeque::new(),
            recv_window: FlowControlWindow::new(),
            sender: FrameSender::new(output, PRIORITY_MAX),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            phase: Phase::Start,
            closed: false,
            _guard: None,
        })
    }

    /// Treat `bytes` as input already read from the transport
    pub fn with_prefetched(mut self, bytes: &[u8]) -> Self {
        self.read_buf.extend_from_slice(bytes);
        self
    }

    /// Count this session in `counter` until it is dropped
    pub fn with_counter(mut self, counter: &SessionCounter) -> Self {
        self._guard = Some(counter.enter());
        self
    }

    /// Settings advertised by the peer so far
    pub fn peer_settings(&self) -> &Http2Settings {
        &self.peer
    }

    /// Highest stream id opened by the peer
    pub fn highest_stream_id(&self) -> StreamId {
        self.highest_stream_id
    }

    /// Fill the read buffer to at least `len` bytes
    fn fill(&mut self, len: usize) -> Result<Option<Action>> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.read_buf.len() < len {
            match self.transport.read(&mut chunk) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Some(Action::wait_read(Arc::clone(&self.source))));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    fn queue(&mut self, frame: Bytes) {
        self.sender.queue(frame);
    }

    fn step(&mut self, cx: &mut Context<'_>) -> Result<Action> {
        loop {
            if self.sender.has_pending() {
                if let Progress::Pending(action) = self.sender.poll_flush(cx)? {
                    return Ok(action);
                }
            }

            match self.phase {
                Phase::Start => {
                    let settings = SettingsFrame::new(self.local.diff(&Http2Settings::DEFAULT));
                    debug!(params = settings.params.len(), "sending local settings");
                    self.queue(FrameCodec::encode_settings_frame(&settings));
                    self.phase = if self.require_preface {
                        Phase::Preface
                    } else {
                        Phase::Header
                    };
                }
                Phase::Preface => {
                    if let Some(action) = self.fill(CONNECTION_PREFACE.len())? {
                        return Ok(action);
                    }
                    let preface = self.read_buf.split_to(CONNECTION_PREFACE.len());
                    if &preface[..] != CONNECTION_PREFACE {
                        self.connection_error(H2Error::from(Error::MissingPreface));
                        continue;
                    }
                    trace!("connection preface received");
                    self.phase = Phase::Header;
                }
                Phase::Header => {
                    if let Some(action) = self.fill(FRAME_HEADER_SIZE)? {
                        return Ok(action);
                    }
                    let mut raw = [0u8; FRAME_HEADER_SIZE];
                    raw.copy_from_slice(&self.read_buf.split_to(FRAME_HEADER_SIZE));
                    let header = FrameCodec::decode_header(&raw);
                    if header.length > self.local.max_frame_size() {
                        self.connection_error(H2Error::connection(
                            ErrorCode::FrameSizeError,
                            format!(
                                "Frame length {} exceeds max frame size {}",
                                header.length,
                                self.local.max_frame_size()
                            ),
                        ));
                        continue;
                    }
                    self.phase = Phase::Payload(header);
                }
                Phase::Payload(header) => {
                    if let Some(action) = self.fill(header.length as usize)? {
                        return Ok(action);
                    }
                    let payload = self.read_buf.split_to(header.length as usize).freeze();
                    debug!(
                        frame_type = header.type_name(),
                        stream_id = header.stream_id,
                        length = header.length,
                        flags = header.flags.as_u8(),
                        "frame received"
                    );
                    self.phase = Phase::Header;
                    if let Err(err) = self.dispatch(cx, header, payload) {
                        self.protocol_error(err);
                    }
                    return Ok(Action::Continue);
                }
                Phase::Teardown => {
                    self.teardown();
                    return Ok(Action::Finish);
                }
            }
        }
    }

    fn protocol_error(&mut self, err: H2Error) {
        match err.scope {
            ErrorScope::Connection => self.connection_error(err),
            ErrorScope::Stream(id) => self.stream_error(id, err),
        }
    }

    fn connection_error(&mut self, err: H2Error) {
        error!(code = err.code.name(), message = %err.message, "connection error");
        let frame = GoawayFrame::new(self.highest_stream_id, err.code, Bytes::from(err.message));
        self.queue(FrameCodec::encode_goaway_frame(&frame));
        self.phase = Phase::Teardown;
    }

    fn stream_error(&mut self, stream_id: StreamId, err: H2Error) {
        warn!(stream_id, code = err.code.name(), message = %err.message, "stream error");
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.reset();
        }
        let frame = RstStreamFrame::new(stream_id, err.code);
        self.queue(FrameCodec::encode_rst_stream_frame(&frame));
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, header: FrameHeader, payload: Bytes) -> H2Result<()> {
        let id = header.stream_id;
        if id != CONNECTION_STREAM_ID && id % 2 == 0 {
            return Err(H2Error::connection(
                ErrorCode::ProtocolError,
                format!("Received even stream id {} from client", id),
            ));
        }

        if let Some(last) = self.last_stream {
            let open_block = self.streams.get(&last).is_some_and(|s| s.in_header_block());
            if open_block && (last != id || header.frame_type() != Some(FrameType::Continuation)) {
                return Err(H2Error::connection(
                    ErrorCode::ProtocolError,
                    format!("Expected CONTINUATION on stream {}, got {}", last, header),
                ));
            }
        }

        match header.frame_type() {
            None => {
                trace!(kind = header.kind, "ignoring unknown frame type");
                Ok(())
            }
            Some(FrameType::Ping) => self.handle_ping(header, &payload),
            Some(FrameType::Settings) => self.handle_settings(header, &payload),
            Some(FrameType::Goaway) => self.handle_goaway(header, &payload),
            Some(FrameType::WindowUpdate) if id == CONNECTION_STREAM_ID => {
                let increment = WindowUpdateFrame::parse_increment(&payload)?;
                if increment == 0 {
                    return Err(H2Error::connection(
                        ErrorCode::ProtocolError,
                        "Connection WINDOW_UPDATE increment of 0",
                    ));
                }
                let size = self.connection.increase_send_window(increment)?;
                trace!(increment, size, "connection send window updated");
                Ok(())
            }
            Some(FrameType::PushPromise) => Err(H2Error::connection(
                ErrorCode::ProtocolError,
                "Clients cannot push streams",
            )),
            Some(kind) => {
                if id == CONNECTION_STREAM_ID {
                    return Err(H2Error::connection(
                        ErrorCode::ProtocolError,
                        format!("{} frame on stream 0", kind.name()),
                    ));
                }
                self.handle_stream_frame(cx, kind, header, &payload)
            }
        }
    }

    fn handle_ping(&mut self, header: FrameHeader, payload: &[u8]) -> H2Result<()> {
        if header.stream_id != CONNECTION_STREAM_ID {
            return Err(H2Error::connection(ErrorCode::ProtocolError, "PING on a stream"));
        }
        let data: [u8; 8] = payload.try_into().map_err(|_| {
            H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("PING payload must be 8 bytes, got {}", payload.len()),
            )
        })?;
        if !header.flags.is_ack() {
            self.queue(FrameCodec::encode_ping_frame(&PingFrame::ack(data)));
        }
        Ok(())
    }

    fn handle_settings(&mut self, header: FrameHeader, payload: &[u8]) -> H2Result<()> {
        if header.stream_id != CONNECTION_STREAM_ID {
            return Err(H2Error::connection(ErrorCode::ProtocolError, "SETTINGS on a stream"));
        }
        if header.flags.is_ack() {
            if !payload.is_empty() {
                return Err(H2Error::connection(
                    ErrorCode::FrameSizeError,
                    "SETTINGS ack with a payload",
                ));
            }
            trace!("settings acknowledged");
            return Ok(());
        }

        let pairs = FrameCodec::decode_settings_payload(payload)?;
        let old = self.peer;
        for (identifier, value) in pairs {
            match self.peer.apply(identifier, value)? {
                Some(parameter) => debug!(setting = parameter.name(), value, "peer setting"),
                None => warn!(identifier, value, "ignoring unknown setting"),
            }
        }

        let delta = self.peer.initial_window_size() as i64 - old.initial_window_size() as i64;
        if delta != 0 {
            for stream in self.streams.values() {
                stream.resize_window(delta)?;
            }
            self.connection.wake_writers();
        }
        if self.peer.header_table_size() != old.header_table_size() {
            self.connection
                .codec()
                .lock()
                .set_max_table_size(self.peer.header_table_size() as usize);
        }
        self.connection.set_max_frame_size(self.peer.max_frame_size());

        self.queue(FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
        Ok(())
    }

    fn handle_goaway(&mut self, header: FrameHeader, payload: &[u8]) -> H2Result<()> {
        if header.stream_id != CONNECTION_STREAM_ID {
            return Err(H2Error::connection(ErrorCode::ProtocolError, "GOAWAY on a stream"));
        }
        let frame = GoawayFrame::parse(payload)?;
        debug!(
            last_stream_id = frame.last_stream_id,
            code = frame.code().map_or("UNKNOWN", |c| c.name()),
            debug_len = frame.debug_data.len(),
            "peer is going away"
        );
        self.phase = Phase::Teardown;
        Ok(())
    }

    fn handle_stream_frame(
        &mut self,
        cx: &mut Context<'_>,
        kind: FrameType,
        header: FrameHeader,
        payload: &[u8],
    ) -> H2Result<()> {
        let id = header.stream_id;

        if !self.lookup(id) {
            if id > self.highest_stream_id {
                if kind != FrameType::Headers {
                    return self.handle_idle_frame(kind, header, payload);
                }
                self.open_stream(id);
            } else if kind == FrameType::Headers && self.was_opened(id) {
                self.streams.insert(id, StreamHandler::closed(id));
            } else {
                return self.handle_closed_frame(kind, header, payload);
            }
        }

        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(H2Error::connection(ErrorCode::InternalError, "stream vanished"));
        };
        self.last_stream = Some(id);

        let state = match kind {
            FrameType::Headers => {
                let mut codec = self.connection.codec().lock();
                stream.handle_headers(header.flags, payload, &mut **codec)?
            }
            FrameType::Continuation => {
                let mut codec = self.connection.codec().lock();
                stream.handle_continuation(header.flags, payload, &mut **codec)?
            }
            FrameType::Data => {
                self.recv_window
                    .receive(payload.len())
                    .map_err(|e| H2Error::connection(ErrorCode::FlowControlError, e.to_string()))?;
                let state = stream.handle_data(header.flags, payload);
                if state.is_ok() {
                    if let Some(increment) = stream.pending_window_update() {
                        let frame = WindowUpdateFrame::new(id, increment);
                        self.sender.queue(FrameCodec::encode_window_update_frame(&frame));
                    }
                }
                self.replenish_recv_window()?;
                state?
            }
            FrameType::Priority => stream.handle_priority(payload)?,
            FrameType::RstStream => {
                let state = stream.handle_reset_stream(payload)?;
                let frame = RstStreamFrame::new(id, ErrorCode::Cancel);
                self.sender.queue(FrameCodec::encode_rst_stream_frame(&frame));
                state
            }
            FrameType::WindowUpdate => {
                let state = stream.handle_window_update(payload)?;
                self.connection.wake_writers();
                state
            }
            other => {
                return Err(H2Error::connection(
                    ErrorCode::ProtocolError,
                    format!("Unexpected {} frame", other.name()),
                ));
            }
        };

        if state == StreamState::Processing {
            self.schedule(cx, id)?;
        }
        Ok(())
    }

    /// Send a connection WINDOW_UPDATE once the receive window runs low
    ///
    /// Called after every DATA frame charged to the connection, including
    /// frames that end in a stream error.
    fn replenish_recv_window(&mut self) -> H2Result<()> {
        if let Some(increment) = self.recv_window.should_send_window_update() {
            self.recv_window.increase(increment)?;
            let frame = WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment);
            self.sender.queue(FrameCodec::encode_window_update_frame(&frame));
        }
        Ok(())
    }

    /// Find a live stream, forgetting it if its output is drained
    fn lookup(&mut self, id: StreamId) -> bool {
        match self.streams.get(&id) {
            Some(stream) if stream.is_drained() => {
                self.forget(id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn forget(&mut self, id: StreamId) {
        trace!(stream_id = id, "forgetting drained stream");
        self.streams.remove(&id);
        if self.last_stream == Some(id) {
            self.last_stream = None;
        }
        if !self.forgotten.contains(&id) {
            if self.forgotten.len() == CLOSED_HISTORY {
                self.forgotten.pop_front();
            }
            self.forgotten.push_back(id);
        }
    }

    /// Whether the peer opened `id` at some point
    fn was_opened(&self, id: StreamId) -> bool {
        id == self.highest_stream_id || self.forgotten.contains(&id)
    }

    fn open_stream(&mut self, id: StreamId) {
        let drained: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.is_drained())
            .map(|(id, _)| *id)
            .collect();
        for drained in drained {
            self.forget(drained);
        }
        let active = self.streams.values().filter(|s| s.is_active()).count();

        let mut stream = StreamHandler::new(
            id,
            self.peer.initial_window_size(),
            self.local.initial_window_size(),
        );
        if active >= self.local.max_concurrent_streams() as usize {
            debug!(stream_id = id, active, "refusing stream");
            stream.refuse();
        }
        self.highest_stream_id = id;
        self.streams.insert(id, stream);
    }

    /// Frames other than HEADERS on a stream the peer never opened
    fn handle_idle_frame(&mut self, kind: FrameType, header: FrameHeader, payload: &[u8]) -> H2Result<()> {
        let mut idle = StreamHandler::new(header.stream_id, 0, 0);
        match kind {
            FrameType::Priority => idle.handle_priority(payload).map(|_| ()),
            FrameType::Data => idle.handle_data(header.flags, payload).map(|_| ()),
            FrameType::RstStream => idle.handle_reset_stream(payload).map(|_| ()),
            FrameType::WindowUpdate => idle.handle_window_update(payload).map(|_| ()),
            _ => Err(H2Error::connection(
                ErrorCode::ProtocolError,
                format!("{} on idle stream {}", kind.name(), header.stream_id),
            )),
        }
    }

    /// Frames on a stream below the highest opened one that is no longer
    /// tracked, either closed or skipped by the peer
    fn handle_closed_frame(&mut self, kind: FrameType, header: FrameHeader, payload: &[u8]) -> H2Result<()> {
        let id = header.stream_id;
        match kind {
            FrameType::Headers => Err(H2Error::connection(
                ErrorCode::ProtocolError,
                format!(
                    "Stream {} is lower than the highest opened stream {}",
                    id, self.highest_stream_id
                ),
            )),
            FrameType::Data => {
                self.recv_window
                    .receive(payload.len())
                    .map_err(|e| H2Error::connection(ErrorCode::FlowControlError, e.to_string()))?;
                self.replenish_recv_window()?;
                Err(H2Error::stream(id, ErrorCode::StreamClosed, "DATA on a closed stream"))
            }
            FrameType::WindowUpdate => {
                WindowUpdateFrame::parse_increment(payload)?;
                Ok(())
            }
            FrameType::RstStream if payload.len() != 4 => Err(H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("RST_STREAM payload must be 4 bytes, got {}", payload.len()),
            )),
            FrameType::Priority if payload.len() != 5 => Err(H2Error::connection(
                ErrorCode::FrameSizeError,
                format!("PRIORITY payload must be 5 bytes, got {}", payload.len()),
            )),
            FrameType::RstStream | FrameType::Priority => Ok(()),
            _ => Err(H2Error::connection(
                ErrorCode::ProtocolError,
                format!("{} on closed stream {}", kind.name(), id),
            )),
        }
    }

    /// Hand a complete request to its own task
    fn schedule(&mut self, cx: &mut Context<'_>, id: StreamId) -> H2Result<()> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        let (fields, body) = stream.take_request();
        let shared = Arc::clone(stream.shared());
        let priority = stream.output_priority();

        let request = match H2Request::from_parts(id, fields, body) {
            Ok(request) => request,
            Err(err) => {
                shared.mark_drained();
                return Err(err);
            }
        };
        debug!(stream_id = id, method = request.method(), path = request.path(), "request complete");

        let task = StreamTask::new(
            Arc::clone(&shared),
            Arc::clone(&self.connection),
            Arc::clone(&self.handler),
            request,
            priority,
        );
        if let Err(err) = cx.spawn(task) {
            shared.mark_drained();
            return Err(H2Error::connection(ErrorCode::InternalError, err.to_string()));
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(streams = self.streams.len(), "session teardown");
        for stream in self.streams.values_mut() {
            stream.go_away();
        }
        self.sender.release();
        self.connection.close();
        if let Err(err) = self.transport.close() {
            debug!(error = %err, "closing transport failed");
        }
    }
}

impl Coroutine for Session {
    fn act(&mut self, cx: &mut Context<'_>) -> Action {
        match self.step(cx) {
            Ok(action) => action,
            Err(Error::ConnectionClosed) => {
                debug!("connection closed by peer");
                self.teardown();
                Action::Finish
            }
            Err(err) => {
                warn!(error = %err, "session failed");
                self.teardown();
                Action::Finish
            }
        }
    }

    fn handle_error(&mut self, error: runtime::Error) -> Action {
        error!(error = %error, "session task error");
        self.teardown();
        Action::Finish
    }

    fn on_abort(&mut self) {
        self.teardown();
    }

    fn name(&self) -> &'static str {
        "h2-session"
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
