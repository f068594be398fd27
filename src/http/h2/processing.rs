//! Request processing
//!
//! Once a stream has received its whole request, the session hands it to a
//! [`StreamTask`]: an independent coroutine that calls the application's
//! [`RequestHandler`] and writes the response back through the connection's
//! output scheduler, honoring the peer's max frame size and both send
//! windows.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, H2Error, H2Result, Result};
use super::flow_control::FlowControlWindow;
use super::frames::DataFrame;
use super::header_codec::{HeaderCodec, HeaderList};
use super::output::{FrameSender, Priority, PriorityOutputScheduler, Progress};
use super::stream::StreamShared;
use super::{StreamId, DEFAULT_MAX_FRAME_SIZE};
use crate::http::Headers;
use crate::runtime::{self, Action, Context, Coroutine, Waker};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A complete request received on one stream
#[derive(Debug, Clone)]
pub struct H2Request {
    stream_id: StreamId,
    method: String,
    path: String,
    scheme: Option<String>,
    authority: Option<String>,
    headers: Headers,
    body: Bytes,
}

impl H2Request {
    /// Build a request from a decoded header list and body
    ///
    /// Pseudo-header problems are stream errors (RFC 7540 Section 8.1.2).
    pub fn from_parts(stream_id: StreamId, fields: HeaderList, body: Bytes) -> H2Result<Self> {
        let malformed = |message: String| H2Error::stream(stream_id, ErrorCode::ProtocolError, message);

        let mut method = None;
        let mut path = None;
        let mut scheme = None;
        let mut authority = None;
        let mut headers = Headers::new();

        for (name, value) in fields {
            let name = String::from_utf8(name)
                .map_err(|_| malformed("Header name is not valid UTF-8".to_string()))?;
            let value = String::from_utf8(value)
                .map_err(|_| malformed(format!("Value of {} is not valid UTF-8", name)))?;

            if let Some(pseudo) = name.strip_prefix(':') {
                if !headers.is_empty() {
                    return Err(malformed(format!("Pseudo-header {} after regular headers", name)));
                }
                let slot = match pseudo {
                    "method" => &mut method,
                    "path" => &mut path,
                    "scheme" => &mut scheme,
                    "authority" => &mut authority,
                    _ => return Err(malformed(format!("Unknown pseudo-header {}", name))),
                };
                if slot.replace(value).is_some() {
                    return Err(malformed(format!("Duplicate pseudo-header {}", name)));
                }
                continue;
            }

            if name.bytes().any(|b| b.is_ascii_uppercase()) {
                return Err(malformed(format!("Uppercase header name {}", name)));
            }
            headers.insert(name, value);
        }

        let method = method.ok_or_else(|| malformed("Missing :method".to_string()))?;
        let path = match path {
            Some(path) if !path.is_empty() => path,
            _ if method == "CONNECT" => String::new(),
            _ => return Err(malformed("Missing :path".to_string())),
        };

        Ok(H2Request {
            stream_id,
            method,
            path,
            scheme,
            authority,
            headers,
            body,
        })
    }

    /// Stream the request arrived on
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Request method
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `:scheme`, if sent
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// `:authority`, if sent
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// Regular header fields
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get the first value for a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Request body
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Response written back on the request's stream
#[derive(Debug, Clone)]
pub struct H2Response {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl H2Response {
    /// Create an empty response
    pub fn new(status: u16) -> Self {
        H2Response {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// 200 with a body
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200).with_body(body)
    }

    /// Add a header field; names are sent lowercase
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value);
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Header fields
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Body
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Answer of [`RequestHandler::poll_handle`]
#[derive(Debug)]
pub enum Handled {
    Ready(H2Response),
    /// The response is not available yet. The request is handed back and
    /// polled again once the waker passed along has fired.
    Pending(H2Request),
}

/// Application entry point for complete requests
///
/// Runs on a processor thread and must not block. A handler that has to
/// wait for something overrides [`poll_handle`](Self::poll_handle) instead.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response for `request`
    fn handle(&self, request: H2Request) -> H2Response;

    fn poll_handle(&self, request: H2Request, _waker: &Waker) -> Handled {
        Handled::Ready(self.handle(request))
    }
}

impl<F> RequestHandler for F
where
    F: Fn(H2Request) -> H2Response + Send + Sync + 'static,
{
    fn handle(&self, request: H2Request) -> H2Response {
        self(request)
    }
}

struct SendWindow {
    window: FlowControlWindow,
    waiters: Vec<Waker>,
}

/// Connection state shared by the session and its stream tasks
pub struct ConnectionShared {
    output: Arc<PriorityOutputScheduler>,
    codec: Mutex<Box<dyn HeaderCodec>>,
    max_frame_size: AtomicU32,
    send: Mutex<SendWindow>,
    closed: AtomicBool,
}

impl ConnectionShared {
    /// Create connection state around an output scheduler and codec
    pub fn new(output: Arc<PriorityOutputScheduler>, codec: Box<dyn HeaderCodec>) -> Self {
        ConnectionShared {
            output,
            codec: Mutex::new(codec),
            max_frame_size: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
            send: Mutex::new(SendWindow {
                window: FlowControlWindow::new(),
                waiters: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Output scheduler of the connection
    pub fn output(&self) -> &Arc<PriorityOutputScheduler> {
        &self.output
    }

    /// Header codec; encoding must happen under the output lock
    pub fn codec(&self) -> &Mutex<Box<dyn HeaderCodec>> {
        &self.codec
    }

    /// Peer's SETTINGS_MAX_FRAME_SIZE
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.load(Ordering::Acquire) as usize
    }

    /// Record a new peer SETTINGS_MAX_FRAME_SIZE
    pub fn set_max_frame_size(&self, size: u32) {
        self.max_frame_size.store(size, Ordering::Release);
    }

    /// Connection-level send window
    pub fn window_size(&self) -> i64 {
        self.send.lock().window.size()
    }

    /// Apply a connection WINDOW_UPDATE
    pub fn increase_send_window(&self, increment: u32) -> Result<i64> {
        let size = self.send.lock().window.increase(increment)?;
        self.wake_writers();
        Ok(size)
    }

    /// Take up to `wanted` bytes from both the connection and stream windows
    ///
    /// Returns 0 when either window is exhausted; `waker` then fires on the
    /// next window change.
    pub fn reserve(&self, stream: &StreamShared, wanted: usize, waker: &Waker) -> usize {
        let mut send = self.send.lock();
        let mut stream_window = stream.send_window().lock();
        let n = wanted
            .min(send.window.available())
            .min(stream_window.available());
        if n == 0 {
            if !send.waiters.iter().any(|w| w.will_wake(waker)) {
                send.waiters.push(waker.clone());
            }
            return 0;
        }
        send.window.consume(n);
        stream_window.consume(n);
        n
    }

    /// Resume every task waiting for window
    pub fn wake_writers(&self) {
        let waiters = std::mem::take(&mut self.send.lock().waiters);
        for waker in waiters {
            waker.wake();
        }
    }

    /// Tear down: refuse output and release every waiting task
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.output.close();
        self.wake_writers();
    }

    /// Whether the connection was torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

enum Phase {
    Handle,
    Headers,
    Data,
    Flush(Box<Phase>),
    Done,
}

/// Coroutine answering one request
pub struct StreamTask {
    stream: Arc<StreamShared>,
    connection: Arc<ConnectionShared>,
    handler: Arc<dyn RequestHandler>,
    request: Option<H2Request>,
    response: Option<H2Response>,
    body: Bytes,
    sender: FrameSender,
    phase: Phase,
}

impl StreamTask {
    /// Create the task for a complete request
    pub fn new(
        stream: Arc<StreamShared>,
        connection: Arc<ConnectionShared>,
        handler: Arc<dyn RequestHandler>,
        request: H2Request,
        priority: Priority,
    ) -> Self {
        let sender = FrameSender::new(Arc::clone(connection.output()), priority);
        StreamTask {
            stream,
            connection,
            handler,
            request: Some(request),
            response: None,
            body: Bytes::new(),
            sender,
            phase: Phase::Handle,
        }
    }

    fn encode_headers(&mut self) -> Result<()> {
        let response = self
            .response
            .take()
            .ok_or_else(|| Error::Internal("response headers written twice".to_string()))?;
        let status = response.status().to_string();
        let mut fields: Vec<(&[u8], &[u8])> = vec![(b":status".as_slice(), status.as_bytes())];
        fields.extend(response.headers().iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));

        let block = self.connection.codec().lock().encode(&fields)?;
        let frames = FrameCodec::encode_header_block(
            self.stream.id(),
            &block,
            response.body().is_empty(),
            self.connection.max_frame_size(),
        );
        for frame in frames {
            self.sender.queue(frame);
        }
        self.body = response.body().clone();
        Ok(())
    }

    fn step(&mut self, cx: &mut Context<'_>) -> Result<Action> {
        loop {
            if !self.sender.is_held() && (self.stream.is_reset() || self.connection.is_closed()) {
                debug!(stream_id = self.stream.id(), "stream gone, dropping response");
                self.phase = Phase::Done;
            }

            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Handle => {
                    let request = self
                        .request
                        .take()
                        .ok_or_else(|| Error::Internal("request handled twice".to_string()))?;
                    match self.handler.poll_handle(request, &cx.waker()) {
                        Handled::Ready(response) => {
                            self.response = Some(response);
                            self.phase = Phase::Headers;
                        }
                        Handled::Pending(request) => {
                            self.request = Some(request);
                            self.phase = Phase::Handle;
                            return Ok(Action::WaitRepeat);
                        }
                    }
                }
                Phase::Headers => match self.sender.poll_acquire(cx)? {
                    Progress::Pending(action) => {
                        self.phase = Phase::Headers;
                        return Ok(action);
                    }
                    Progress::Ready => {
                        // Encoded under the output lock so codec state follows wire order
                        self.encode_headers()?;
                        let next = if self.body.is_empty() { Phase::Done } else { Phase::Data };
                        self.phase = Phase::Flush(Box::new(next));
                    }
                },
                Phase::Data => {
                    let wanted = self.body.len().min(self.connection.max_frame_size());
                    let n = self.connection.reserve(&self.stream, wanted, &cx.waker());
                    if n == 0 {
                        self.phase = Phase::Data;
                        return Ok(Action::WaitRepeat);
                    }
                    let chunk = self.body.split_to(n);
                    let end_stream = self.body.is_empty();
                    let frame = DataFrame::new(self.stream.id(), chunk, end_stream);
                    self.sender.queue(FrameCodec::encode_data_frame(&frame));
                    let next = if end_stream { Phase::Done } else { Phase::Data };
                    self.phase = Phase::Flush(Box::new(next));
                }
                Phase::Flush(next) => match self.sender.poll_flush(cx)? {
                    Progress::Pending(action) => {
                        self.phase = Phase::Flush(next);
                        return Ok(action);
                    }
                    Progress::Ready => self.phase = *next,
                },
                Phase::Done => {
                    self.sender.release();
                    self.stream.mark_drained();
                    return Ok(Action::Finish);
                }
            }
        }
    }
}

impl Coroutine for StreamTask {
    fn act(&mut self, cx: &mut Context<'_>) -> Action {
        match self.step(cx) {
            Ok(action) => action,
            Err(Error::ConnectionClosed) => {
                debug!(stream_id = self.stream.id(), "connection closed under stream task");
                self.stream.mark_drained();
                Action::Finish
            }
            Err(err) => Action::Error(runtime::Error::task(err)),
        }
    }

    fn handle_error(&mut self, error: runtime::Error) -> Action {
        warn!(stream_id = self.stream.id(), error = %error, "stream task failed");
        self.sender.release();
        self.stream.mark_drained();
        Action::Error(error)
    }

    fn on_abort(&mut self) {
        self.stream.mark_drained();
    }

    fn name(&self) -> &'static str {
        "h2-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(list: &[(&str, &str)]) -> HeaderList {
        list.iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_request_from_parts() {
        let request = H2Request::from_parts(
            1,
            fields(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":authority", "example.com"),
                (":path", "/a"),
                ("accept", "*/*"),
            ]),
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/a");
        assert_eq!(request.scheme(), Some("https"));
        assert_eq!(request.authority(), Some("example.com"));
        assert_eq!(request.header("Accept"), Some("*/*"));
    }

    #[test]
    fn test_malformed_requests() {
        let cases: &[&[(&str, &str)]] = &[
            &[(":path", "/")],
            &[(":method", "GET")],
            &[(":method", "GET"), (":path", "/"), (":method", "PUT")],
            &[(":method", "GET"), (":path", "/"), (":foo", "x")],
            &[(":method", "GET"), ("accept", "x"), (":path", "/")],
            &[(":method", "GET"), (":path", "/"), ("Accept", "x")],
        ];
        for case in cases {
            let err = H2Request::from_parts(7, fields(case), Bytes::new()).unwrap_err();
            assert_eq!(err.scope, super::super::error::ErrorScope::Stream(7));
            assert_eq!(err.code, ErrorCode::ProtocolError);
        }

        let connect = H2Request::from_parts(9, fields(&[(":method", "CONNECT"), (":authority", "a:1")]), Bytes::new());
        assert!(connect.is_ok());
    }

    #[test]
    fn test_response_builder() {
        let response = H2Response::ok("hello").with_header("Content-Type", "text/plain");
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().iter().next(), Some(("content-type", "text/plain")));
        assert_eq!(&response.body()[..], b"hello");
    }

    #[test]
    fn test_closure_handler() {
        let handler = |request: H2Request| H2Response::ok(request.path().to_string());
        let request = H2Request::from_parts(1, fields(&[(":method", "GET"), (":path", "/x")]), Bytes::new()).unwrap();
        assert_eq!(&handler.handle(request).body()[..], b"/x");
    }
}
