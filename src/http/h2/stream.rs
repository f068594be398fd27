//! HTTP/2 stream state machine
//!
//! One [`StreamHandler`] per logical stream, owned by the session. It
//! assembles the request (header block fragments, then body) and checks
//! every frame against the stream state, classifying violations as stream
//! or connection errors. The part of a stream that its response task also
//! needs lives in [`StreamShared`].

use super::codec::FrameCodec;
use super::error::{ErrorCode, H2Error, H2Result};
use super::flow_control::FlowControlWindow;
use super::frames::{FrameFlags, PrioritySpec, WindowUpdateFrame};
use super::header_codec::{HeaderCodec, HeaderList};
use super::output::{stream_priority, Priority, PRIORITY_DEFAULT};
use super::StreamId;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Stream state
///
/// States only ever advance. `Processing` means the request is complete;
/// `Ready` means it was handed to its response task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    /// Created, nothing received yet
    Init,
    /// HEADERS received, header block open
    Headers,
    /// CONTINUATION received, header block open
    Continuation,
    /// Header block complete, receiving DATA
    Payload,
    /// END_STREAM received
    Processing,
    /// Response task scheduled
    Ready,
    /// Reset by either side
    Reset,
    /// Connection going away
    Goaway,
    /// Done
    Closed,
}

impl StreamState {
    /// Get state name
    pub fn name(&self) -> &'static str {
        match self {
            StreamState::Init => "INIT",
            StreamState::Headers => "HEADERS",
            StreamState::Continuation => "CONTINUATION",
            StreamState::Payload => "PAYLOAD",
            StreamState::Processing => "PROCESSING",
            StreamState::Ready => "READY",
            StreamState::Reset => "RESET",
            StreamState::Goaway => "GOAWAY",
            StreamState::Closed => "CLOSED",
        }
    }
}

/// Stream state shared with the response task
#[derive(Debug)]
pub struct StreamShared {
    id: StreamId,
    send_window: Mutex<FlowControlWindow>,
    reset: AtomicBool,
    drained: AtomicBool,
}

impl StreamShared {
    /// Create shared state with the peer's initial window size
    pub fn new(id: StreamId, initial_send_window: u32) -> Self {
        StreamShared {
            id,
            send_window: Mutex::new(FlowControlWindow::with_initial_size(initial_send_window)),
            reset: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Outbound window
    pub fn send_window(&self) -> &Mutex<FlowControlWindow> {
        &self.send_window
    }

    /// Current outbound window size
    pub fn window_size(&self) -> i64 {
        self.send_window.lock().size()
    }

    /// Whether the stream was reset
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// Mark the stream reset; its task stops writing
    pub fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// Whether all output of the stream is written
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Mark all output written; the session may forget the stream
    pub fn mark_drained(&self) {
        self.drained.store(true, Ordering::Release);
    }
}

/// Per-stream frame handler
#[derive(Debug)]
pub struct StreamHandler {
    id: StreamId,
    state: StreamState,
    shared: Arc<StreamShared>,
    recv_window: FlowControlWindow,
    header_block: BytesMut,
    end_stream: bool,
    trailers: bool,
    refused: bool,
    /// Stream error to report once the open header block is decoded
    discarding: Option<H2Error>,
    headers: HeaderList,
    body: BytesMut,
    priority: Option<PrioritySpec>,
}

impl StreamHandler {
    /// Create a handler with the peer's and our initial window sizes
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        StreamHandler {
            id,
            state: StreamState::Init,
            shared: Arc::new(StreamShared::new(id, send_window)),
            recv_window: FlowControlWindow::with_initial_size(recv_window),
            header_block: BytesMut::new(),
            end_stream: false,
            trailers: false,
            refused: false,
            discarding: None,
            headers: Vec::new(),
            body: BytesMut::new(),
            priority: None,
        }
    }

    /// Handler for a stream that was opened and forgotten since
    pub fn closed(id: StreamId) -> Self {
        let mut stream = StreamHandler::new(id, 0, 0);
        stream.state = StreamState::Closed;
        stream.shared.mark_reset();
        stream.shared.mark_drained();
        stream
    }

    /// Refuse the stream once its header block is complete
    ///
    /// The block must still be decoded to keep the header codec in sync.
    pub fn refuse(&mut self) {
        self.refused = true;
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get stream state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// State shared with the response task
    pub fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    /// Inbound window
    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    /// Decoded request headers (and trailers)
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Received body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Priority block, if the peer sent one
    pub fn priority(&self) -> Option<&PrioritySpec> {
        self.priority.as_ref()
    }

    /// Output priority for the response
    pub fn output_priority(&self) -> Priority {
        self.priority
            .map_or(PRIORITY_DEFAULT, |spec| stream_priority(spec.weight))
    }

    /// Whether a header block is open on this stream
    pub fn in_header_block(&self) -> bool {
        matches!(self.state, StreamState::Headers | StreamState::Continuation)
            || self.trailers
            || self.discarding.is_some()
    }

    /// Whether the session can forget this stream
    pub fn is_drained(&self) -> bool {
        self.shared.is_drained() && !self.in_header_block()
    }

    /// Whether the stream counts against max-concurrent-streams
    pub fn is_active(&self) -> bool {
        self.state < StreamState::Reset && !self.is_drained()
    }

    /// Move forward to `next`; earlier states are ignored
    fn advance(&mut self, next: StreamState) {
        if next > self.state {
            trace!(stream_id = self.id, from = self.state.name(), to = next.name(), "stream state");
            self.state = next;
        }
    }

    fn connection_error(code: ErrorCode, message: impl Into<String>) -> H2Error {
        H2Error::connection(code, message)
    }

    fn stream_error(&self, code: ErrorCode, message: impl Into<String>) -> H2Error {
        H2Error::stream(self.id, code, message)
    }

    /// Process a HEADERS frame payload
    ///
    /// A block on a closed stream is still decoded to keep the header codec
    /// in sync; the stream error follows once the block is complete.
    pub fn handle_headers(
        &mut self,
        flags: FrameFlags,
        payload: &[u8],
        codec: &mut dyn HeaderCodec,
    ) -> H2Result<StreamState> {
        if self.in_header_block() {
            return Err(Self::connection_error(
                ErrorCode::ProtocolError,
                "HEADERS while a header block is open",
            ));
        }
        match self.state {
            StreamState::Init => {}
            StreamState::Payload if !flags.is_end_stream() => {
                self.discarding =
                    Some(self.stream_error(ErrorCode::ProtocolError, "Trailers without END_STREAM"));
            }
            StreamState::Payload => self.trailers = true,
            _ => {
                self.discarding = Some(self.stream_error(
                    ErrorCode::StreamClosed,
                    "Received headers for stream that is already (half-)closed",
                ));
            }
        }

        let mut fragment = FrameCodec::strip_padding(flags, payload).map_err(H2Error::from)?;
        if flags.is_priority() {
            let spec = PrioritySpec::parse(fragment).map_err(H2Error::from)?;
            fragment = &fragment[PrioritySpec::SIZE..];
            if spec.stream_dependency == self.id {
                if self.discarding.is_none() {
                    self.discarding =
                        Some(self.stream_error(ErrorCode::ProtocolError, "Stream depends on itself"));
                }
            } else {
                self.priority = Some(spec);
            }
        }

        if self.discarding.is_none() {
            if !self.trailers {
                self.advance(StreamState::Headers);
            }
            self.end_stream = flags.is_end_stream();
        }
        self.header_block.extend_from_slice(fragment);

        if flags.is_end_headers() {
            self.finish_header_block(codec)?;
        }
        Ok(self.state)
    }

    /// Process a CONTINUATION frame payload
    pub fn handle_continuation(
        &mut self,
        flags: FrameFlags,
        payload: &[u8],
        codec: &mut dyn HeaderCodec,
    ) -> H2Result<StreamState> {
        if !self.in_header_block() {
            return Err(Self::connection_error(
                ErrorCode::ProtocolError,
                "Received continued headers for stream that is not in its header state",
            ));
        }
        if !self.trailers && self.discarding.is_none() {
            self.advance(StreamState::Continuation);
        }
        self.header_block.extend_from_slice(payload);

        if flags.is_end_headers() {
            self.finish_header_block(codec)?;
        }
        Ok(self.state)
    }

    fn finish_header_block(&mut self, codec: &mut dyn HeaderCodec) -> H2Result<()> {
        let block = self.header_block.split().freeze();
        let decoded = codec
            .decode(&block)
            .map_err(|e| Self::connection_error(ErrorCode::CompressionError, e.to_string()))?;
        debug!(stream_id = self.id, headers = decoded.len(), "header block complete");

        if let Some(err) = self.discarding.take() {
            return Err(err);
        }

        if self.trailers {
            self.trailers = false;
            self.headers.extend(decoded);
            self.advance(StreamState::Processing);
            return Ok(());
        }

        self.headers = decoded;
        if self.refused {
            return Err(self.stream_error(ErrorCode::RefusedStream, "Too many concurrent streams"));
        }
        self.advance(StreamState::Payload);
        if self.end_stream {
            self.advance(StreamState::Processing);
        }
        Ok(())
    }

    /// Process a DATA frame payload
    ///
    /// The whole payload, padding included, counts against the window.
    pub fn handle_data(&mut self, flags: FrameFlags, payload: &[u8]) -> H2Result<StreamState> {
        match self.state {
            StreamState::Payload if !self.trailers => {}
            StreamState::Init | StreamState::Headers | StreamState::Continuation | StreamState::Payload => {
                return Err(Self::connection_error(
                    ErrorCode::ProtocolError,
                    "Received data for stream that is not in payload state",
                ));
            }
            _ => {
                return Err(self.stream_error(
                    ErrorCode::StreamClosed,
                    "Received data for stream that is already (half-)closed",
                ));
            }
        }

        self.recv_window
            .receive(payload.len())
            .map_err(|e| self.stream_error(ErrorCode::FlowControlError, e.to_string()))?;
        let data = FrameCodec::strip_padding(flags, payload).map_err(H2Error::from)?;
        self.body.extend_from_slice(data);

        if flags.is_end_stream() {
            self.advance(StreamState::Processing);
        }
        Ok(self.state)
    }

    /// Process a PRIORITY frame payload
    pub fn handle_priority(&mut self, payload: &[u8]) -> H2Result<StreamState> {
        if payload.len() != PrioritySpec::SIZE {
            return Err(Self::connection_error(
                ErrorCode::FrameSizeError,
                format!("PRIORITY payload must be 5 bytes, got {}", payload.len()),
            ));
        }
        if self.in_header_block() {
            return Err(Self::connection_error(
                ErrorCode::ProtocolError,
                "Received PRIORITY frame while still in header state",
            ));
        }
        let spec = PrioritySpec::parse(payload).map_err(H2Error::from)?;
        if spec.stream_dependency == self.id {
            return Err(self.stream_error(ErrorCode::ProtocolError, "Stream depends on itself"));
        }
        self.priority = Some(spec);
        Ok(self.state)
    }

    /// Process a RST_STREAM frame payload
    pub fn handle_reset_stream(&mut self, payload: &[u8]) -> H2Result<StreamState> {
        if self.state == StreamState::Init {
            return Err(Self::connection_error(
                ErrorCode::ProtocolError,
                "Received RST_STREAM on an idle stream",
            ));
        }
        if payload.len() != 4 {
            return Err(Self::connection_error(
                ErrorCode::FrameSizeError,
                format!("RST_STREAM payload must be 4 bytes, got {}", payload.len()),
            ));
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        debug!(
            stream_id = self.id,
            code = ErrorCode::from_u32(code).map_or("UNKNOWN", |c| c.name()),
            "stream reset by peer"
        );
        self.reset();
        Ok(self.state)
    }

    /// Process a WINDOW_UPDATE frame payload
    pub fn handle_window_update(&mut self, payload: &[u8]) -> H2Result<StreamState> {
        if self.state == StreamState::Init {
            return Err(Self::connection_error(
                ErrorCode::ProtocolError,
                "Received WINDOW_UPDATE on an idle stream",
            ));
        }
        let increment = WindowUpdateFrame::parse_increment(payload).map_err(H2Error::from)?;
        if self.state >= StreamState::Reset {
            return Ok(self.state);
        }
        if increment == 0 {
            return Err(self.stream_error(ErrorCode::ProtocolError, "Increment of 0"));
        }
        self.shared
            .send_window
            .lock()
            .increase(increment)
            .map_err(|e| self.stream_error(ErrorCode::FlowControlError, e.to_string()))?;
        Ok(self.state)
    }

    /// Apply a change of the peer's initial window size
    pub fn resize_window(&self, delta: i64) -> H2Result<()> {
        self.shared
            .send_window
            .lock()
            .apply_delta(delta)
            .map_err(|e| Self::connection_error(ErrorCode::FlowControlError, e.to_string()))
    }

    /// WINDOW_UPDATE increment to send for this stream, if one is due
    ///
    /// The receive window is credited with the increment.
    pub fn pending_window_update(&mut self) -> Option<u32> {
        if self.state != StreamState::Payload {
            return None;
        }
        let increment = self.recv_window.should_send_window_update()?;
        self.recv_window.increase(increment).ok()?;
        Some(increment)
    }

    /// Reset the stream
    ///
    /// A stream without a response task is drained right away.
    pub fn reset(&mut self) {
        let had_task = self.state == StreamState::Ready;
        self.trailers = false;
        self.discarding = None;
        self.advance(StreamState::Reset);
        self.shared.mark_reset();
        if !had_task {
            self.shared.mark_drained();
        }
    }

    /// The connection is going away
    pub fn go_away(&mut self) {
        self.advance(StreamState::Goaway);
        self.shared.mark_reset();
    }

    /// Hand the assembled request to a response task
    pub fn take_request(&mut self) -> (HeaderList, Bytes) {
        self.advance(StreamState::Ready);
        (std::mem::take(&mut self.headers), self.body.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::header_codec::HpackCodec;

    fn block(codec: &mut HpackCodec) -> Vec<u8> {
        codec
            .encode(&[(b":method".as_slice(), b"POST".as_slice()), (b":path", b"/")])
            .unwrap()
    }

    fn flags(bits: u8) -> FrameFlags {
        FrameFlags::from_u8(bits)
    }

    #[test]
    fn test_headers_end_stream() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(1, 65535, 65535);

        let state = stream
            .handle_headers(
                flags(FrameFlags::END_HEADERS | FrameFlags::END_STREAM),
                &block(&mut encoder),
                &mut decoder,
            )
            .unwrap();
        assert_eq!(state, StreamState::Processing);
        assert_eq!(stream.headers().len(), 2);

        let (headers, body) = stream.take_request();
        assert_eq!(headers[0].1, b"POST");
        assert!(body.is_empty());
        assert_eq!(stream.state(), StreamState::Ready);
    }

    #[test]
    fn test_headers_continuation_data() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(3, 65535, 100);
        let encoded = block(&mut encoder);
        let (first, rest) = encoded.split_at(1);

        let state = stream.handle_headers(flags(0), first, &mut decoder).unwrap();
        assert_eq!(state, StreamState::Headers);
        assert!(stream.in_header_block());

        let state = stream
            .handle_continuation(flags(FrameFlags::END_HEADERS), rest, &mut decoder)
            .unwrap();
        assert_eq!(state, StreamState::Payload);
        assert!(!stream.in_header_block());

        let state = stream.handle_data(flags(0), &[1u8; 60]).unwrap();
        assert_eq!(state, StreamState::Payload);
        assert_eq!(stream.pending_window_update(), Some(60));

        let state = stream.handle_data(flags(FrameFlags::END_STREAM), b"end").unwrap();
        assert_eq!(state, StreamState::Processing);
        assert_eq!(stream.body().len(), 63);
        assert_eq!(stream.pending_window_update(), None);
    }

    #[test]
    fn test_data_before_headers_is_connection_error() {
        let mut stream = StreamHandler::new(1, 65535, 65535);
        let err = stream.handle_data(flags(0), b"x").unwrap_err();
        assert!(err.is_connection());
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_data_after_reset_is_stream_error() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(1, 65535, 65535);
        stream
            .handle_headers(flags(FrameFlags::END_HEADERS), &block(&mut encoder), &mut decoder)
            .unwrap();
        stream.handle_reset_stream(&[0, 0, 0, 8]).unwrap();
        assert_eq!(stream.state(), StreamState::Reset);
        assert!(stream.is_drained());

        let err = stream.handle_data(flags(0), b"x").unwrap_err();
        assert_eq!(err.scope, crate::http::h2::error::ErrorScope::Stream(1));
        assert_eq!(err.code, ErrorCode::StreamClosed);
    }

    #[test]
    fn test_idle_stream_frames() {
        let mut stream = StreamHandler::new(5, 65535, 65535);
        assert!(stream.handle_reset_stream(&[0, 0, 0, 8]).unwrap_err().is_connection());
        assert!(stream.handle_window_update(&[0, 0, 0, 1]).unwrap_err().is_connection());
        // PRIORITY is fine on an idle stream
        assert_eq!(stream.handle_priority(&[0, 0, 0, 1, 200]).unwrap(), StreamState::Init);
        assert_eq!(stream.output_priority(), 201);
    }

    #[test]
    fn test_priority_during_header_block() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(1, 65535, 65535);
        stream.handle_headers(flags(0), &block(&mut encoder), &mut decoder).unwrap();
        let err = stream.handle_priority(&[0, 0, 0, 0, 15]).unwrap_err();
        assert!(err.is_connection());
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_headers_after_processing() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(1, 65535, 65535);
        let all = FrameFlags::END_HEADERS | FrameFlags::END_STREAM;
        stream.handle_headers(flags(all), &block(&mut encoder), &mut decoder).unwrap();
        let err = stream
            .handle_headers(flags(all), &block(&mut encoder), &mut decoder)
            .unwrap_err();
        assert_eq!(err.scope, crate::http::h2::error::ErrorScope::Stream(1));
        assert_eq!(err.code, ErrorCode::StreamClosed);
    }

    #[test]
    fn test_headers_on_closed_stream_are_decoded() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::closed(1);
        assert!(stream.is_drained());

        // A custom field enters the dynamic table
        let fields = [(b":path".as_slice(), b"/".as_slice()), (b"x-trace", b"abc123")];
        let first = encoder.encode(&fields).unwrap();
        let (head, tail) = first.split_at(2);
        let state = stream.handle_headers(flags(0), head, &mut decoder).unwrap();
        assert_eq!(state, StreamState::Closed);
        assert!(stream.in_header_block());
        assert!(!stream.is_drained());
        let err = stream
            .handle_continuation(flags(FrameFlags::END_HEADERS), tail, &mut decoder)
            .unwrap_err();
        assert_eq!(err.scope, crate::http::h2::error::ErrorScope::Stream(1));
        assert_eq!(err.code, ErrorCode::StreamClosed);
        assert!(!stream.in_header_block());

        // A repeat of the block refers back to that entry
        let decoded = decoder.decode(&encoder.encode(&fields).unwrap()).unwrap();
        assert_eq!(decoded[1], (b"x-trace".to_vec(), b"abc123".to_vec()));
    }

    #[test]
    fn test_window_update() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(1, 100, 65535);
        stream
            .handle_headers(flags(FrameFlags::END_HEADERS), &block(&mut encoder), &mut decoder)
            .unwrap();

        stream.handle_window_update(&[0, 0, 0, 50]).unwrap();
        assert_eq!(stream.shared().window_size(), 150);

        let err = stream.handle_window_update(&[0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        assert!(!err.is_connection());

        let err = stream.handle_window_update(&[0x7F, 0xFF, 0xFF, 0xFF]).unwrap_err();
        assert_eq!(err.code, ErrorCode::FlowControlError);
        assert!(!err.is_connection());

        stream.resize_window(-1000).unwrap();
        assert_eq!(stream.shared().window_size(), -850);
    }

    #[test]
    fn test_refused_stream() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(1, 65535, 65535);
        stream.refuse();
        let err = stream
            .handle_headers(flags(FrameFlags::END_HEADERS), &block(&mut encoder), &mut decoder)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RefusedStream);
        assert!(!err.is_connection());
    }

    #[test]
    fn test_trailers() {
        let mut encoder = HpackCodec::default();
        let mut decoder = HpackCodec::default();
        let mut stream = StreamHandler::new(1, 65535, 65535);
        stream
            .handle_headers(flags(FrameFlags::END_HEADERS), &block(&mut encoder), &mut decoder)
            .unwrap();
        stream.handle_data(flags(0), b"body").unwrap();

        let trailer = encoder.encode(&[(b"x-checksum".as_slice(), b"1".as_slice())]).unwrap();
        let state = stream
            .handle_headers(flags(FrameFlags::END_STREAM), &trailer, &mut decoder)
            .unwrap();
        assert_eq!(state, StreamState::Payload);
        assert!(stream.in_header_block());

        let state = stream
            .handle_continuation(flags(FrameFlags::END_HEADERS), &[], &mut decoder)
            .unwrap();
        assert_eq!(state, StreamState::Processing);
        assert_eq!(stream.headers().len(), 3);
    }
}
