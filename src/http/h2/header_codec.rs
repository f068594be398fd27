//! Header block compression
//!
//! The session treats header compression as an opaque, stateful component
//! behind [`HeaderCodec`]. [`HpackCodec`] is the default implementation on
//! top of the `hpack` crate.

use super::error::{Error, Result};
use super::DEFAULT_HEADER_TABLE_SIZE;
use ::hpack::{Decoder, Encoder};

/// Decoded header list, in wire order
pub type HeaderList = Vec<(Vec<u8>, Vec<u8>)>;

/// Stateful header block codec, one per connection
///
/// Both directions keep compression state, so blocks must be decoded in the
/// order they were received and encoded in the order they are written.
pub trait HeaderCodec: Send {
    /// Encode a header list into a header block
    fn encode(&mut self, headers: &[(&[u8], &[u8])]) -> Result<Vec<u8>>;

    /// Decode a complete header block
    fn decode(&mut self, block: &[u8]) -> Result<HeaderList>;

    /// The peer changed SETTINGS_HEADER_TABLE_SIZE
    fn set_max_table_size(&mut self, size: usize);
}

/// HPACK codec backed by the `hpack` crate
///
/// The crate's encoder always assumes the default 4096 byte dynamic table.
/// When the peer advertises a smaller table, blocks are encoded as literals
/// without indexing instead, which never touch the peer's table.
///
/// Every change of the table size in use is announced with a dynamic table
/// size update at the start of the next block (RFC 7541 section 6.3).
pub struct HpackCodec {
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,
    /// Dynamic table size the peer's decoder is told about
    table_size: usize,
    /// Smallest size in use since the last block, if it changed
    pending_update: Option<usize>,
}

impl HpackCodec {
    /// Create a codec whose decoder accepts tables up to `local_table_size`
    pub fn new(local_table_size: usize) -> Self {
        let mut decoder = Decoder::new();
        decoder.set_max_table_size(local_table_size);
        HpackCodec {
            encoder: Encoder::new(),
            decoder,
            table_size: DEFAULT_HEADER_TABLE_SIZE as usize,
            pending_update: None,
        }
    }

    fn is_indexing(&self) -> bool {
        self.table_size == DEFAULT_HEADER_TABLE_SIZE as usize
    }

    /// Size updates owed to the peer, smallest first
    fn encode_size_update(&mut self, block: &mut Vec<u8>) {
        let Some(smallest) = self.pending_update.take() else {
            return;
        };
        if smallest < self.table_size {
            encode_integer(smallest, 5, 0x20, block);
        }
        encode_integer(self.table_size, 5, 0x20, block);
    }

    fn encode_literal(headers: &[(&[u8], &[u8])], block: &mut Vec<u8>) {
        for (name, value) in headers {
            // Literal header field without indexing, new name (RFC 7541 6.2.2)
            block.push(0x00);
            encode_string(name, block);
            encode_string(value, block);
        }
    }
}

impl Default for HpackCodec {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

impl HeaderCodec for HpackCodec {
    fn encode(&mut self, headers: &[(&[u8], &[u8])]) -> Result<Vec<u8>> {
        let mut block = Vec::new();
        self.encode_size_update(&mut block);
        if !self.is_indexing() {
            Self::encode_literal(headers, &mut block);
            return Ok(block);
        }
        self.encoder
            .encode_into(headers.iter().copied(), &mut block)
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;
        Ok(block)
    }

    fn decode(&mut self, block: &[u8]) -> Result<HeaderList> {
        self.decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))
    }

    fn set_max_table_size(&mut self, size: usize) {
        tracing::debug!(size, "peer header table size changed");
        let target = size.min(DEFAULT_HEADER_TABLE_SIZE as usize);
        if target == self.table_size {
            return;
        }
        let smallest = if target == DEFAULT_HEADER_TABLE_SIZE as usize {
            // Back to indexing. The old encoder still holds entries the peer
            // has evicted, so both sides start over from an empty table.
            self.encoder = Encoder::new();
            0
        } else {
            target
        };
        self.pending_update = Some(self.pending_update.map_or(smallest, |s| s.min(smallest)));
        self.table_size = target;
    }
}

/// Integer with an N-bit prefix (RFC 7541 5.1)
fn encode_integer(mut value: usize, prefix_bits: u8, flags: u8, out: &mut Vec<u8>) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.push(flags | value as u8);
        return;
    }
    out.push(flags | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.push((value % 128) as u8 | 0x80);
        value /= 128;
    }
    out.push(value as u8);
}

/// Raw (non-Huffman) string literal
fn encode_string(bytes: &[u8], out: &mut Vec<u8>) {
    encode_integer(bytes.len(), 7, 0x00, out);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_headers() -> Vec<(&'static [u8], &'static [u8])> {
        vec![
            (b":method".as_slice(), b"GET".as_slice()),
            (b":path", b"/index.html"),
            (b"x-custom", b"value"),
        ]
    }

    #[test]
    fn test_encode_decode() {
        let mut codec = HpackCodec::default();
        let headers = request_headers();
        let block = codec.encode(&headers).unwrap();

        let mut peer = HpackCodec::default();
        let decoded = peer.decode(&block).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], (b":method".to_vec(), b"GET".to_vec()));
        assert_eq!(decoded[2], (b"x-custom".to_vec(), b"value".to_vec()));
    }

    #[test]
    fn test_literal_encoding_for_small_table() {
        let mut codec = HpackCodec::default();
        codec.set_max_table_size(0);
        let headers = request_headers();
        let block = codec.encode(&headers).unwrap();
        // Size update to 0, then the first literal
        assert_eq!(block[0], 0x20);
        assert_eq!(block[1], 0x00);
        assert_eq!(block[2], 7);
        assert_eq!(&block[3..10], b":method");

        let mut peer = HpackCodec::default();
        let decoded = peer.decode(&block).unwrap();
        assert_eq!(decoded[1], (b":path".to_vec(), b"/index.html".to_vec()));
    }

    #[test]
    fn test_table_size_update_sent_once() {
        let mut codec = HpackCodec::default();
        codec.set_max_table_size(0);
        let block = codec.encode(&[(b":status".as_slice(), b"200".as_slice())]).unwrap();
        assert_eq!(block[0], 0x20);

        let block = codec.encode(&[(b":status".as_slice(), b"200".as_slice())]).unwrap();
        assert_eq!(block[0], 0x00);

        // Same size again announces nothing
        codec.set_max_table_size(0);
        let block = codec.encode(&[(b":status".as_slice(), b"200".as_slice())]).unwrap();
        assert_eq!(block[0], 0x00);
    }

    #[test]
    fn test_table_size_update_keeps_peer_in_sync() {
        let mut codec = HpackCodec::default();
        let mut peer = HpackCodec::default();
        let headers = request_headers();
        peer.decode(&codec.encode(&headers).unwrap()).unwrap();

        // Shrinking twice before a block announces the smaller size first
        codec.set_max_table_size(1024);
        codec.set_max_table_size(2048);
        let block = codec.encode(&headers).unwrap();
        let mut expected = Vec::new();
        encode_integer(1024, 5, 0x20, &mut expected);
        encode_integer(2048, 5, 0x20, &mut expected);
        assert_eq!(&block[..expected.len()], &expected[..]);
        assert_eq!(peer.decode(&block).unwrap().len(), 3);

        // Growing back flushes the table, then indexing resumes
        codec.set_max_table_size(8192);
        let block = codec.encode(&headers).unwrap();
        assert_eq!(&block[..4], &[0x20, 0x3F, 0xE1, 0x1F]);
        assert_eq!(peer.decode(&block).unwrap(), peer_headers(&headers));
        let block = codec.encode(&headers).unwrap();
        assert_eq!(peer.decode(&block).unwrap(), peer_headers(&headers));
    }

    fn peer_headers(headers: &[(&[u8], &[u8])]) -> HeaderList {
        headers.iter().map(|(n, v)| (n.to_vec(), v.to_vec())).collect()
    }

    #[test]
    fn test_decode_garbage() {
        let mut codec = HpackCodec::default();
        // Index 254 is past both tables
        let err = codec.decode(&[0xFF, 0x7F]).unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
    }

    #[test]
    fn test_encode_integer() {
        let mut out = Vec::new();
        encode_integer(10, 5, 0, &mut out);
        assert_eq!(out, vec![10]);

        // RFC 7541 C.1.2
        out.clear();
        encode_integer(1337, 5, 0, &mut out);
        assert_eq!(out, vec![31, 154, 10]);
    }
}
