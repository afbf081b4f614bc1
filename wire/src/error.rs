//! Framing error types.

use thiserror::Error;

/// Framing errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Marker bytes at the head of a frame did not match the configured marker
    #[error("frame marker mismatch")]
    Marker,

    /// Decoded length is impossible or exceeds the configured bound
    #[error("frame length {0} out of bounds")]
    Size(u64),

    /// Not enough bytes for a complete header
    #[error("incomplete frame header")]
    Incomplete,
}
