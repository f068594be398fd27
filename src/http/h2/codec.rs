//! Frame wire codec
//!
//! Encoders return complete frames (header and payload) ready to be queued
//! on the output scheduler. Decoders work on payloads the session already
//! split off its read buffer.

use super::error::{Error, Result};
use super::frames::*;
use super::StreamId;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// Size of one SETTINGS (identifier, value) pair
pub const SETTINGS_PAIR_SIZE: usize = 6;

/// Stateless frame encoder and decoder
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(header: &FrameHeader) -> [u8; FRAME_HEADER_SIZE] {
        let mut bytes = [0u8; FRAME_HEADER_SIZE];
        bytes[..3].copy_from_slice(&header.length.to_be_bytes()[1..]);
        bytes[3] = header.kind;
        bytes[4] = header.flags.as_u8();
        bytes[5..].copy_from_slice(&(header.stream_id & 0x7FFF_FFFF).to_be_bytes());
        bytes
    }

    /// Decode a frame header
    ///
    /// Any 9 bytes form a header; the reserved stream bit is dropped and
    /// unknown types are kept raw.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        FrameHeader {
            length: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            kind: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF,
        }
    }

    /// Build one frame, letting `payload` write exactly `length` bytes
    fn build(
        kind: FrameType,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
        payload: impl FnOnce(&mut BytesMut),
    ) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + length);
        let header = FrameHeader::new(kind, flags.as_u8(), stream_id, length as u32);
        buf.put_slice(&Self::encode_header(&header));
        payload(&mut buf);
        debug_assert_eq!(buf.len(), FRAME_HEADER_SIZE + length);
        buf.freeze()
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        Self::build(FrameType::Data, flags, frame.stream_id, frame.data.len(), |buf| {
            buf.put_slice(&frame.data)
        })
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        let block = &frame.header_block;
        Self::build(FrameType::Headers, flags, frame.stream_id, block.len(), |buf| {
            buf.put_slice(block)
        })
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        let block = &frame.header_block;
        Self::build(FrameType::Continuation, flags, frame.stream_id, block.len(), |buf| {
            buf.put_slice(block)
        })
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);
        let params: &[_] = if frame.ack { &[] } else { &frame.params };
        Self::build(FrameType::Settings, flags, 0, params.len() * SETTINGS_PAIR_SIZE, |buf| {
            for (parameter, value) in params {
                buf.put_u16(parameter.as_u16());
                buf.put_u32(*value);
            }
        })
    }

    /// Decode a SETTINGS payload into raw (identifier, value) pairs
    pub fn decode_settings_payload(payload: &[u8]) -> Result<Vec<(u16, u32)>> {
        if payload.len() % SETTINGS_PAIR_SIZE != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(SETTINGS_PAIR_SIZE)
            .map(|pair| {
                let id = u16::from_be_bytes([pair[0], pair[1]]);
                let value = u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]);
                (id, value)
            })
            .collect())
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);
        Self::build(FrameType::Ping, flags, 0, frame.data.len(), |buf| buf.put_slice(&frame.data))
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let length = 8 + frame.debug_data.len();
        Self::build(FrameType::Goaway, FrameFlags::empty(), 0, length, |buf| {
            buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
            buf.put_u32(frame.error_code);
            buf.put_slice(&frame.debug_data);
        })
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        Self::build(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4, |buf| {
            buf.put_u32(frame.size_increment & 0x7FFF_FFFF)
        })
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        Self::build(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4, |buf| {
            buf.put_u32(frame.error_code.as_u32())
        })
    }

    /// Encode a raw frame, including types this codec does not know
    pub fn encode_raw(header: &FrameHeader, payload: &[u8]) -> Bytes {
        let header = FrameHeader {
            length: payload.len() as u32,
            ..*header
        };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(&header));
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Split a header block into HEADERS and CONTINUATION frames
    ///
    /// Every fragment is at most `max_frame_size` bytes; END_HEADERS is set
    /// on the last frame only.
    pub fn encode_header_block(
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        max_frame_size: usize,
    ) -> Vec<Bytes> {
        let max = max_frame_size.max(1);
        let mut chunks = block.chunks(max).peekable();
        let mut frames = Vec::new();

        let first = chunks.next().unwrap_or(&[]);
        frames.push(Self::encode_headers_frame(&HeadersFrame::new(
            stream_id,
            Bytes::copy_from_slice(first),
            end_stream,
            chunks.peek().is_none(),
        )));
        while let Some(chunk) = chunks.next() {
            frames.push(Self::encode_continuation_frame(&ContinuationFrame {
                stream_id,
                header_block: Bytes::copy_from_slice(chunk),
                end_headers: chunks.peek().is_none(),
            }));
        }
        frames
    }

    /// Remove padding from a PADDED payload
    ///
    /// A pad length that does not fit in the payload is a protocol error.
    pub fn strip_padding(flags: FrameFlags, payload: &[u8]) -> Result<&[u8]> {
        if !flags.is_padded() {
            return Ok(payload);
        }
        let Some((&pad_len, rest)) = payload.split_first() else {
            return Err(Error::Protocol("PADDED frame without pad length".to_string()));
        };
        let pad_len = pad_len as usize;
        if pad_len >= payload.len() {
            return Err(Error::Protocol(format!(
                "Pad length {} exceeds payload length {}",
                pad_len,
                payload.len()
            )));
        }
        Ok(&rest[..rest.len() - pad_len])
    }

    /// Read one frame from a blocking reader
    pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut raw)?;
        let header = Self::decode_header(&raw);

        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload)?;
        Ok(Frame::new(header, Bytes::from(payload)))
    }
}
