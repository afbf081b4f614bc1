//! Incremental frame decoder for the receive loop.

use bytes::{Buf, Bytes, BytesMut};

use crate::format::{Decoded, FrameFormat};
use crate::WireError;

/// Default bound on a single payload body (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Stateful decoder that pulls complete payload bodies out of a read buffer.
///
/// The decoder alternates between the header sub-state and the body
/// sub-state. Callers append raw stream bytes to a [`BytesMut`] and call
/// [`decode`](FrameDecoder::decode) until it returns `None`, then read more.
#[derive(Debug)]
pub struct FrameDecoder {
    format: FrameFormat,
    max_payload: usize,
    /// Body length once the header has been consumed; `None` in header state.
    pending: Option<usize>,
}

impl FrameDecoder {
    /// Create a decoder with the default payload bound.
    pub fn new(format: FrameFormat) -> Self {
        Self::with_max_payload(format, DEFAULT_MAX_PAYLOAD)
    }

    /// Create a decoder with an explicit payload bound.
    pub fn with_max_payload(format: FrameFormat, max_payload: usize) -> Self {
        Self {
            format,
            max_payload,
            pending: None,
        }
    }

    /// The framing configuration this decoder was built with.
    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Decode one payload body from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A zero-length frame
    /// yields an empty [`Bytes`] and the decoder returns to header state.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        loop {
            match self.pending {
                None => match self.format.decode_header(buf)? {
                    Decoded::NeedMore => return Ok(None),
                    Decoded::Length(len) => {
                        if len > self.max_payload {
                            return Err(WireError::Size(len as u64));
                        }
                        buf.advance(self.format.header_len());
                        self.pending = Some(len);
                    }
                },
                Some(len) => {
                    if buf.len() < len {
                        return Ok(None);
                    }
                    self.pending = None;
                    return Ok(Some(buf.split_to(len).freeze()));
                }
            }
        }
    }
}
