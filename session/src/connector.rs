//! Client-side connection establishment.
//!
//! Drives the handshake state machine: TCP connect with refusal retry
//! across the server list, TLS authentication, the optional credential
//! sub-handshake, then steady state. Each stage owns the socket and
//! disposes it on failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::credential;
use crate::error::SessionError;
use crate::event::{EventSender, SessionEvent};
use crate::options::SessionOptions;
use crate::session::{next_session_id, Session, SessionId};
use crate::transport::{self, tls, IoStream};

/// Pause between refused attempts so an unbounded retry loop does not spin.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Client connector over one or more `host:port` targets.
///
/// On a refused connection the connector advances to the next server in
/// the list (modulo its length); the index survives across `connect`
/// calls so reconnects resume where the last attempt left off.
pub struct Connector {
    servers: Vec<SocketAddr>,
    options: SessionOptions,
    events: EventSender,
    index: usize,
}

impl Connector {
    /// Create a connector. The server list must not be empty, and
    /// integrated security requires configured credentials.
    pub fn new(
        servers: Vec<SocketAddr>,
        options: SessionOptions,
        events: EventSender,
    ) -> Result<Self, SessionError> {
        if servers.is_empty() {
            return Err(SessionError::InvalidConfig("empty server list".into()));
        }
        if options.integrated_security && options.credentials.is_none() {
            return Err(SessionError::InvalidConfig(
                "integrated security requires credentials".into(),
            ));
        }
        Ok(Self {
            servers,
            options,
            events,
            index: 0,
        })
    }

    /// The server the next attempt will target.
    pub fn current_server(&self) -> SocketAddr {
        self.servers[self.index % self.servers.len()]
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Run the handshake state machine until a session is established or
    /// the attempt terminates.
    pub async fn connect(&mut self) -> Result<Session, SessionError> {
        let tls_config = match &self.options.tls {
            Some(_) => Some(Arc::new(tls::make_client_config(&self.options)?)),
            None => None,
        };

        // TCP phase: retry only on refusal, advancing the server index.
        let mut retries_left = self.options.max_connection_attempts;
        let (peer, tcp) = loop {
            let peer = self.current_server();
            self.emit(SessionEvent::ConnectionAttempt { peer });

            match transport::connect(peer, &self.options).await {
                Ok(stream) => break (peer, stream),
                Err(io_error) => {
                    let error = SessionError::from_io(io_error);
                    let refused = matches!(error, SessionError::Refused);
                    if refused {
                        self.index = (self.index + 1) % self.servers.len();
                    }

                    let retry = refused
                        && match retries_left {
                            -1 => true,
                            0 => false,
                            _ => {
                                retries_left -= 1;
                                true
                            }
                        };
                    if retry {
                        warn!(
                            "Connection to {} refused; retrying against {}",
                            peer,
                            self.current_server()
                        );
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }

                    warn!("Connection to {} failed: {}", peer, error);
                    let shared = Arc::new(error);
                    self.emit(SessionEvent::ConnectionException {
                        session: None,
                        error: shared.clone(),
                    });
                    return Err(shared.kind_clone());
                }
            }
        };

        debug!("TCP connection established to {}", peer);
        let id = next_session_id();

        // TLS phase, under its own timeout.
        let io = match &tls_config {
            Some(config) => {
                let sni = self
                    .options
                    .tls
                    .as_ref()
                    .and_then(|tls| tls.server_name.clone())
                    .unwrap_or_else(|| peer.ip().to_string());

                match timeout(
                    self.options.handshake_timeout,
                    tls::connect(config.clone(), tcp, &sni),
                )
                .await
                {
                    Ok(Ok((stream, _peer_cert))) => stream,
                    Ok(Err(error)) => return Err(self.fail_handshake(id, error)),
                    Err(_elapsed) => {
                        return Err(self.fail_handshake(id, SessionError::AuthTimeout))
                    }
                }
            }
            None => IoStream::Plain(tcp),
        };

        // Credential phase, under a fresh timeout.
        let mut io = io;
        if self.options.integrated_security {
            let credentials = self
                .options
                .credentials
                .as_ref()
                .expect("checked at construction");

            match timeout(
                self.options.handshake_timeout,
                credential::client_handshake(
                    &mut io,
                    credentials,
                    self.options.ignore_invalid_credentials,
                ),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(self.fail_handshake(id, error)),
                Err(_elapsed) => return Err(self.fail_handshake(id, SessionError::AuthTimeout)),
            }
        }

        let session = Session::establish(id, peer, io, None, &self.options, self.events.clone());
        session.spawn_receive();
        self.emit(SessionEvent::ConnectionEstablished {
            session: id,
            peer,
            principal: None,
        });
        info!("Session {} established with {}", id, peer);
        Ok(session)
    }

    /// Dispose a failed handshake: the socket was consumed by the failing
    /// stage, so emitting the terminal events is all that remains.
    fn fail_handshake(&self, id: SessionId, error: SessionError) -> SessionError {
        warn!("Handshake with {} failed: {}", self.current_server(), error);
        let shared = Arc::new(error);
        self.emit(SessionEvent::ConnectionException {
            session: Some(id),
            error: shared.clone(),
        });
        self.emit(SessionEvent::ConnectionTerminated { session: id });
        shared.kind_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn unused_addr() -> SocketAddr {
        // Bind and immediately drop so the port is very likely refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let (events, _rx) = event_channel();
        assert!(matches!(
            Connector::new(Vec::new(), SessionOptions::default(), events),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_integrated_security_requires_credentials() {
        let (events, _rx) = event_channel();
        let options = SessionOptions {
            integrated_security: true,
            ..Default::default()
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        assert!(matches!(
            Connector::new(vec![addr], options, events),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_attempts_terminates_on_first_refusal() {
        let (events, mut rx) = event_channel();
        let options = SessionOptions {
            max_connection_attempts: 0,
            ..Default::default()
        };
        let mut connector = Connector::new(vec![unused_addr().await], options, events).unwrap();

        let result = connector.connect().await;
        assert!(matches!(result, Err(SessionError::Refused)));

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ConnectionAttempt { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ConnectionException { session: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_refused_failover_advances_to_next_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let dead = unused_addr().await;

        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the socket open long enough for the test to finish.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let (events, mut rx) = event_channel();
        let options = SessionOptions {
            max_connection_attempts: 3,
            ..Default::default()
        };
        let mut connector = Connector::new(vec![dead, live], options, events).unwrap();

        let session = connector.connect().await.unwrap();
        assert_eq!(session.peer_addr(), live);

        // Attempt on the dead server, then the live one, then established.
        let mut attempts = Vec::new();
        let mut established = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::ConnectionAttempt { peer } => attempts.push(peer),
                SessionEvent::ConnectionEstablished { peer, .. } => {
                    established += 1;
                    assert_eq!(peer, live);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(attempts, vec![dead, live]);
        assert_eq!(established, 1);

        session.disconnect().await;
        accept_task.abort();
    }

    #[tokio::test]
    async fn test_tls_handshake_timeout_fires() {
        // A listener that accepts and never speaks TLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let trust_dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = event_channel();
        let options = SessionOptions {
            handshake_timeout: Duration::from_millis(200),
            tls: Some(crate::options::TlsOptions {
                trusted_cert_dir: Some(trust_dir.path().to_path_buf()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut connector = Connector::new(vec![addr], options, events).unwrap();

        let result = connector.connect().await;
        assert!(matches!(result, Err(SessionError::AuthTimeout)));

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ConnectionAttempt { .. }
        ));
        match rx.recv().await.unwrap() {
            SessionEvent::ConnectionException { error, .. } => {
                assert!(matches!(*error, SessionError::AuthTimeout));
            }
            other => panic!("expected ConnectionException, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ConnectionTerminated { .. }
        ));
        // No ConnectionEstablished was emitted.
        assert!(rx.try_recv().is_err());

        silent.abort();
    }
}
