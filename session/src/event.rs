//! Observable session events.
//!
//! Events are raised on connection state transitions and per-payload
//! outcomes, and delivered over an unbounded channel so the emitting task
//! never blocks on a slow observer.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::session::SessionId;

/// Events emitted by sessions, the connector, and the acceptor.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection attempt is starting
    ConnectionAttempt {
        /// Target address of the attempt
        peer: SocketAddr,
    },
    /// Handshake succeeded and the session entered steady state
    ConnectionEstablished {
        /// Session identifier
        session: SessionId,
        /// Remote socket address
        peer: SocketAddr,
        /// Authenticated principal, when one was captured
        principal: Option<String>,
    },
    /// The session was torn down; emitted exactly once per session
    ConnectionTerminated {
        /// Session identifier
        session: SessionId,
    },
    /// A connection-level failure
    ConnectionException {
        /// Session identifier, when one was already allocated
        session: Option<SessionId>,
        /// The failure
        error: Arc<SessionError>,
    },
    /// A payload was dequeued and its write is starting
    SendStart {
        /// Session identifier
        session: SessionId,
    },
    /// A payload write completed
    SendComplete {
        /// Session identifier
        session: SessionId,
        /// User bytes written, excluding framing
        bytes: usize,
    },
    /// A payload write failed or queued payloads were dropped
    SendException {
        /// Session identifier
        session: SessionId,
        /// The failure
        error: Arc<SessionError>,
    },
    /// A complete payload is buffered; pull reads are valid until the next payload
    ReceiveReady {
        /// Session identifier
        session: SessionId,
        /// Payload size in bytes
        size: usize,
    },
    /// A complete payload, copied so the observer may retain it
    ReceiveComplete {
        /// Session identifier
        session: SessionId,
        /// The payload body
        payload: Bytes,
        /// Payload size in bytes
        size: usize,
    },
    /// A recoverable receive-side failure
    ReceiveException {
        /// Session identifier
        session: SessionId,
        /// The failure
        error: Arc<SessionError>,
    },
}

/// Sending half of the event channel.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
/// Receiving half of the event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the event channel a connector or server publishes into.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
