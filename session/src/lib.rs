//! TLS/TCP client-server sessions with framed payloads.
//!
//! This crate provides the connection core of the tether transport
//! library: the client connector and server acceptor, per-session send and
//! receive loops, payload-aware framing, the optional credential
//! sub-handshake after TLS, and the cancellation discipline that keeps the
//! loops safe under concurrent disconnect.
//!
//! ## Features
//!
//! - **TCP and TLS transport**: plain TCP or rustls-backed TLS on both
//!   sides, with a trust-directory default validator and caller-supplied
//!   verifier hooks
//! - **Payload framing**: configurable marker and endianness, or an
//!   unframed raw-byte mode
//! - **Bounded sending**: lock-free send queue with an in-flight gate and
//!   a payload-dropping overflow policy that never blocks producers
//! - **Events**: connection, send, and receive transitions delivered over
//!   a channel
//! - **One-shot teardown**: a session-wide cancellation token; exactly one
//!   `ConnectionTerminated` per session
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_session::{event_channel, Connector, SessionEvent, SessionOptions};
//!
//! # async fn example() -> Result<(), tether_session::SessionError> {
//! let (events, mut rx) = event_channel();
//! let mut connector = Connector::new(
//!     vec!["127.0.0.1:9000".parse().unwrap()],
//!     SessionOptions::default(),
//!     events,
//! )?;
//!
//! let session = connector.connect().await?;
//! session.send(&b"hello"[..]).wait().await.ok();
//!
//! while let Some(event) = rx.recv().await {
//!     match event {
//!         SessionEvent::ReceiveComplete { payload, .. } => {
//!             println!("received {} bytes", payload.len());
//!         }
//!         SessionEvent::ConnectionTerminated { session } => {
//!             println!("session {} closed", session);
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod cancel;
pub mod connector;
pub mod credential;
pub mod error;
pub mod event;
pub mod options;
mod queue;
pub mod session;
pub mod transport;

pub use acceptor::Server;
pub use cancel::CancelToken;
pub use connector::Connector;
pub use credential::{CredentialValidator, Principal};
pub use error::SessionError;
pub use event::{event_channel, EventReceiver, EventSender, SessionEvent};
pub use options::{
    CertificateProvider, CertificateSource, Credentials, SessionOptions, TlsOptions, TlsProtocols,
    DEFAULT_PAYLOAD_MARKER, HANDSHAKE_TIMEOUT,
};
pub use queue::{SendOutcome, SendTicket};
pub use session::{Session, SessionId, SessionStats};
pub use transport::IoStream;

// Re-export the framing types callers configure sessions with.
pub use tether_wire::{Endian, FrameFormat};
