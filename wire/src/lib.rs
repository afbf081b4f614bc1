//! Payload framing for the tether transport library.
//!
//! This crate implements the payload-aware wire format used by tether
//! sessions: a configurable marker followed by a 4-byte length prefix and
//! the payload body. Both the marker bytes and the byte order of the
//! length field are session-level configuration; an empty marker is legal
//! and degenerates to a pure length prefix.
//!
//! ## Wire format
//!
//! ```text
//! +----------------------+----------------------------+
//! | marker               | 0..M bytes, configurable   |
//! +----------------------+----------------------------+
//! | length u32           | configured endianness      |
//! +----------------------+----------------------------+
//! | body                 | length bytes (0..N)        |
//! +----------------------+----------------------------+
//! ```
//!
//! `length == 0` is a legal empty frame. Both endpoints must agree on the
//! marker and the endianness.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format;
pub mod frame;

pub use error::WireError;
pub use format::{Decoded, Endian, FrameFormat, LENGTH_FIELD_SIZE, MAX_BODY_LEN};
pub use frame::{FrameDecoder, DEFAULT_MAX_PAYLOAD};
