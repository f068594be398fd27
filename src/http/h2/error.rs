//! Errors raised while driving an HTTP/2 session
//!
//! [`Error`] is what the codec and the I/O layer return. Once a frame has
//! been attributed to the connection or to a stream, the failure becomes an
//! [`H2Error`], which carries the RFC 7540 code that goes on the wire.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scheduler error: {0}")]
    Runtime(#[from] crate::runtime::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("flow control error: {0}")]
    FlowControl(String),

    #[error("frame size error: {0}")]
    FrameSize(String),

    #[error("compression error: {0}")]
    Compression(String),

    /// The peer went away or the transport was closed locally
    #[error("connection closed")]
    ConnectionClosed,

    #[error("missing connection preface")]
    MissingPreface,

    #[error(transparent)]
    H2(#[from] H2Error),
}

impl Error {
    /// Code reported to the peer when this error ends the connection
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) | Error::MissingPreface => ErrorCode::ProtocolError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::H2(err) => err.code,
            Error::Io(_) | Error::Runtime(_) | Error::Internal(_) | Error::ConnectionClosed => {
                ErrorCode::InternalError
            }
        }
    }
}

/// Whether a violation takes down the connection or a single stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Connection,
    Stream(u32),
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorScope::Connection => f.write_str("connection"),
            ErrorScope::Stream(id) => write!(f, "stream {}", id),
        }
    }
}

/// A protocol violation bound to its scope.
///
/// Connection errors are answered with GOAWAY and a teardown, stream errors
/// with RST_STREAM on the offending stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{scope} error {code}: {message}")]
pub struct H2Error {
    pub scope: ErrorScope,
    pub code: ErrorCode,
    pub message: String,
}

impl H2Error {
    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::scoped(ErrorScope::Connection, code, message)
    }

    pub fn stream(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::scoped(ErrorScope::Stream(stream_id), code, message)
    }

    fn scoped(scope: ErrorScope, code: ErrorCode, message: impl Into<String>) -> Self {
        H2Error {
            scope,
            code,
            message: message.into(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self.scope, ErrorScope::Connection)
    }
}

/// Anything not already scoped is a connection error.
impl From<Error> for H2Error {
    fn from(err: Error) -> Self {
        match err {
            Error::H2(err) => err,
            other => H2Error::connection(other.code(), other.to_string()),
        }
    }
}

/// Error codes of RFC 7540 section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

/// Indexed by code value
const CODES: [(ErrorCode, &str); 14] = [
    (ErrorCode::NoError, "NO_ERROR"),
    (ErrorCode::ProtocolError, "PROTOCOL_ERROR"),
    (ErrorCode::InternalError, "INTERNAL_ERROR"),
    (ErrorCode::FlowControlError, "FLOW_CONTROL_ERROR"),
    (ErrorCode::SettingsTimeout, "SETTINGS_TIMEOUT"),
    (ErrorCode::StreamClosed, "STREAM_CLOSED"),
    (ErrorCode::FrameSizeError, "FRAME_SIZE_ERROR"),
    (ErrorCode::RefusedStream, "REFUSED_STREAM"),
    (ErrorCode::Cancel, "CANCEL"),
    (ErrorCode::CompressionError, "COMPRESSION_ERROR"),
    (ErrorCode::ConnectError, "CONNECT_ERROR"),
    (ErrorCode::EnhanceYourCalm, "ENHANCE_YOUR_CALM"),
    (ErrorCode::InadequateSecurity, "INADEQUATE_SECURITY"),
    (ErrorCode::Http11Required, "HTTP_1_1_REQUIRED"),
];

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// `None` for codes this endpoint does not know. RFC 7540 treats those
    /// as INTERNAL_ERROR, which is left to the caller.
    pub fn from_u32(code: u32) -> Option<Self> {
        CODES.get(code as usize).map(|(code, _)| *code)
    }

    pub fn name(&self) -> &'static str {
        CODES[*self as usize].1
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of handling one frame
pub type H2Result<T> = std::result::Result<T, H2Error>;
