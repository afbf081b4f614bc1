//! Session error taxonomy.

use thiserror::Error;

use crate::session::SessionId;
use tether_wire::WireError;

/// Errors raised by sessions, the connector, and the acceptor.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer is not listening; retried under the connector's rules
    #[error("connection refused by peer")]
    Refused,

    /// Any other socket-layer failure; terminates the session
    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),

    /// An authentication phase did not complete within its timeout
    #[error("authentication timed out")]
    AuthTimeout,

    /// TLS handshake failed or a required property was absent
    #[error("tls handshake failed: {0}")]
    Tls(#[from] rustls::Error),

    /// Credential sub-handshake rejected
    #[error("credentials rejected by peer")]
    BadCredentials,

    /// Invalid marker or impossible decoded length; terminates the receive side
    #[error("framing error: {0}")]
    Framing(#[from] WireError),

    /// Bounded send queue dumped pending payloads; the session continues
    #[error("send queue dumped")]
    QueueOverflow,

    /// Zero-byte read or closed socket during I/O
    #[error("peer closed the connection")]
    PeerGone,

    /// Accepted peer rejected because the server is at its connection limit
    #[error("client connection limit reached")]
    ClientLimit,

    /// The session was torn down while the operation was pending
    #[error("session terminated")]
    Terminated,

    /// Operation attempted on a destroyed session; suppressed by callers
    #[error("session already disposed")]
    Disposed,

    /// No session with this id is live on the server
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// Pull-read attempted before any payload was received
    #[error("no receive buffer available")]
    NoReceiveBuffer,

    /// Options are inconsistent or incomplete
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    /// Map an I/O error to the taxonomy, folding connection-refused into
    /// its retryable kind.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => SessionError::Refused,
            _ => SessionError::Socket(err),
        }
    }

    /// Clone the error preserving its kind. Used where the same failure is
    /// both raised as an event (behind an `Arc`) and returned by value.
    pub(crate) fn kind_clone(&self) -> Self {
        match self {
            SessionError::Refused => SessionError::Refused,
            SessionError::Socket(e) => {
                SessionError::Socket(std::io::Error::new(e.kind(), e.to_string()))
            }
            SessionError::AuthTimeout => SessionError::AuthTimeout,
            SessionError::Tls(e) => SessionError::Tls(e.clone()),
            SessionError::BadCredentials => SessionError::BadCredentials,
            SessionError::Framing(e) => SessionError::Framing(*e),
            SessionError::QueueOverflow => SessionError::QueueOverflow,
            SessionError::PeerGone => SessionError::PeerGone,
            SessionError::ClientLimit => SessionError::ClientLimit,
            SessionError::Terminated => SessionError::Terminated,
            SessionError::Disposed => SessionError::Disposed,
            SessionError::UnknownSession(id) => SessionError::UnknownSession(*id),
            SessionError::NoReceiveBuffer => SessionError::NoReceiveBuffer,
            SessionError::InvalidConfig(msg) => SessionError::InvalidConfig(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_is_folded_from_io() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(SessionError::from_io(io), SessionError::Refused));

        let io = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(matches!(SessionError::from_io(io), SessionError::Socket(_)));
    }
}
