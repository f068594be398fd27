//! HTTP/2 frame model (RFC 7540 Section 4 and 6)
//!
//! Inbound frames stay raw ([`FrameHeader`] plus payload) until the session
//! dispatches them; the typed frames here are what the server writes, plus
//! parsers for the payloads it has to inspect.

use super::error::{Error, ErrorCode, Result};
use super::settings::SettingsParameter;
use super::StreamId;
use bytes::Bytes;
use std::fmt;

/// Known frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    const ALL: [FrameType; 10] = [
        FrameType::Data,
        FrameType::Headers,
        FrameType::Priority,
        FrameType::RstStream,
        FrameType::Settings,
        FrameType::PushPromise,
        FrameType::Ping,
        FrameType::Goaway,
        FrameType::WindowUpdate,
        FrameType::Continuation,
    ];

    /// Wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Type for a wire value; None for extension types
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Name as written in RFC 7540
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame flag byte
///
/// Flag meaning depends on the frame type, so the constants overlap
/// (`END_STREAM` and `ACK` are both bit 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Turn `flag` on
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Turn `flag` on when `on` holds
    pub fn set_if(&mut self, flag: u8, on: bool) {
        if on {
            self.set(flag);
        }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// Size of the fixed frame header
pub const FRAME_HEADER_SIZE: usize = 9;

/// The 9-byte header in front of every frame
///
/// The type is kept raw so frames of unknown type can be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (24 bits)
    pub length: u32,
    /// Raw frame type
    pub kind: u8,
    pub flags: FrameFlags,
    /// Stream id with the reserved bit cleared
    pub stream_id: StreamId,
}

impl FrameHeader {
    /// Header for a known frame type
    pub fn new(frame_type: FrameType, flags: u8, stream_id: StreamId, length: u32) -> Self {
        FrameHeader {
            length,
            kind: frame_type.as_u8(),
            flags: FrameFlags::from_u8(flags),
            stream_id: stream_id & 0x7FFF_FFFF,
        }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    /// Type name for logging
    pub fn type_name(&self) -> &'static str {
        self.frame_type().map_or("UNKNOWN", |t| t.name())
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} length={} flags=0x{:x}",
            self.type_name(),
            self.stream_id,
            self.length,
            self.flags.as_u8()
        )
    }
}

/// A complete raw frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Frame { header, payload }
    }
}

/// DATA frame
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub end_stream: bool,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
        }
    }
}

/// HEADERS frame carrying (the first fragment of) a header block
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
        }
    }
}

/// CONTINUATION frame
#[derive(Debug, Clone)]
pub struct ContinuationFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// Stream dependency block of PRIORITY and prioritized HEADERS frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: StreamId,
    pub exclusive: bool,
    /// Weight as sent on the wire (actual weight minus one)
    pub weight: u8,
}

impl PrioritySpec {
    /// Encoded size
    pub const SIZE: usize = 5;

    pub fn new(stream_dependency: StreamId, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }

    /// Parse the block at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let Some(block) = bytes.get(..Self::SIZE) else {
            return Err(Error::FrameSize(format!(
                "Priority block needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        };
        let dependency = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
        Ok(PrioritySpec {
            stream_dependency: dependency & 0x7FFF_FFFF,
            exclusive: dependency & 0x8000_0000 != 0,
            weight: block[4],
        })
    }
}

/// RST_STREAM frame
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: StreamId, error_code: ErrorCode) -> Self {
        RstStreamFrame {
            stream_id,
            error_code,
        }
    }
}

/// SETTINGS frame; an ack never carries parameters
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub ack: bool,
    pub params: Vec<(SettingsParameter, u32)>,
}

impl SettingsFrame {
    pub fn new(params: Vec<(SettingsParameter, u32)>) -> Self {
        SettingsFrame { ack: false, params }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            params: Vec::new(),
        }
    }
}

/// PING frame
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Answer to a PING carrying `data`
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY frame
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: StreamId,
    /// Raw error code, which may be outside the known set
    pub error_code: u32,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code: error_code.as_u32(),
            debug_data,
        }
    }

    /// Parse a GOAWAY payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::FrameSize(format!(
                "GOAWAY payload needs at least 8 bytes, got {}",
                payload.len()
            )));
        }
        let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(GoawayFrame {
            last_stream_id: last & 0x7FFF_FFFF,
            error_code: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            debug_data: Bytes::copy_from_slice(&payload[8..]),
        })
    }

    /// Known error code, if any
    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.error_code)
    }
}

/// WINDOW_UPDATE frame; stream 0 updates the connection window
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }

    /// Parse the 4-byte increment, ignoring the reserved bit
    ///
    /// A zero increment is returned as is; whether it is a stream or a
    /// connection error depends on the frame's stream.
    pub fn parse_increment(payload: &[u8]) -> Result<u32> {
        let bytes: [u8; 4] = payload.try_into().map_err(|_| {
            Error::FrameSize(format!("WINDOW_UPDATE payload must be 4 bytes, got {}", payload.len()))
        })?;
        Ok(u32::from_be_bytes(bytes) & 0x7FFF_FFFF)
    }
}
