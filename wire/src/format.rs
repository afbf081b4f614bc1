//! Header layout: marker bytes plus a 4-byte length prefix.

use bytes::{BufMut, Bytes, BytesMut};

use crate::WireError;

/// Size of the length field in bytes.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Largest representable body length. The high bit of the length field is
/// reserved; a decoded length with that bit set is rejected.
pub const MAX_BODY_LEN: usize = (1 << 31) - 1;

/// Byte order of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// Least significant byte first (default)
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

/// Result of extracting a length field from buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Not enough bytes buffered for a complete header
    NeedMore,
    /// Complete header; the body is this many bytes
    Length(usize),
}

/// Session-level framing configuration: `marker || length_u32 || body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFormat {
    marker: Bytes,
    endian: Endian,
}

impl FrameFormat {
    /// Create a format with the given marker and length-field byte order.
    /// An empty marker yields a pure length prefix.
    pub fn new(marker: impl Into<Bytes>, endian: Endian) -> Self {
        Self {
            marker: marker.into(),
            endian,
        }
    }

    /// The configured marker bytes.
    pub fn marker(&self) -> &[u8] {
        &self.marker
    }

    /// The configured length-field byte order.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Total header size: marker plus the length field.
    pub fn header_len(&self) -> usize {
        self.marker.len() + LENGTH_FIELD_SIZE
    }

    /// Encode a header announcing a body of `len` bytes.
    pub fn encode_header(&self, len: usize) -> Result<Bytes, WireError> {
        if len > MAX_BODY_LEN {
            return Err(WireError::Size(len as u64));
        }

        let mut buf = BytesMut::with_capacity(self.header_len());
        buf.put_slice(&self.marker);
        match self.endian {
            Endian::Little => buf.put_u32_le(len as u32),
            Endian::Big => buf.put_u32(len as u32),
        }
        Ok(buf.freeze())
    }

    /// Encode a complete frame: header plus body in one contiguous buffer.
    pub fn encode(&self, body: &[u8]) -> Result<Bytes, WireError> {
        if body.len() > MAX_BODY_LEN {
            return Err(WireError::Size(body.len() as u64));
        }

        let mut buf = BytesMut::with_capacity(self.header_len() + body.len());
        buf.put_slice(&self.marker);
        match self.endian {
            Endian::Little => buf.put_u32_le(body.len() as u32),
            Endian::Big => buf.put_u32(body.len() as u32),
        }
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    /// Extract the body length from buffered bytes.
    ///
    /// Returns [`Decoded::NeedMore`] while fewer than `header_len` bytes are
    /// available. A marker mismatch or a length with the reserved high bit
    /// set is an error; the caller must terminate the receive side.
    pub fn decode_header(&self, buf: &[u8]) -> Result<Decoded, WireError> {
        if buf.len() < self.header_len() {
            return Ok(Decoded::NeedMore);
        }

        if !buf.starts_with(&self.marker) {
            return Err(WireError::Marker);
        }

        let raw = &buf[self.marker.len()..self.marker.len() + LENGTH_FIELD_SIZE];
        let raw: [u8; LENGTH_FIELD_SIZE] = raw.try_into().expect("slice length checked");
        let len = match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        };

        if len as usize > MAX_BODY_LEN {
            return Err(WireError::Size(len as u64));
        }

        Ok(Decoded::Length(len as usize))
    }
}
