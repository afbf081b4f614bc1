//! Server side: listener lifecycle, accept loop, and per-client sessions.
//!
//! One accept loop serves a single listener socket. Every accepted peer
//! gets its own handshake task and, on success, a session in the live map;
//! a handshake failure terminates that session only and never stops
//! acceptance. Fatal listener errors surface as events and schedule a
//! stop-and-rebind restart.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::credential::{self, CredentialValidator, Principal};
use crate::error::SessionError;
use crate::event::{EventSender, SessionEvent};
use crate::options::SessionOptions;
use crate::queue::{SendOutcome, SendTicket};
use crate::session::{next_session_id, Session, SessionId};
use crate::transport::{self, tls, IoStream};

/// Consecutive accept failures treated as an unrecoverable listener error.
const MAX_ACCEPT_ERRORS: u32 = 5;
/// Pause between accept retries after a transient failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listening endpoint that owns the accept loop and the live-session map.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    local_addr: SocketAddr,
    options: SessionOptions,
    validator: Option<Arc<dyn CredentialValidator>>,
    tls: Option<TlsAcceptor>,
    sessions: parking_lot::RwLock<HashMap<SessionId, Session>>,
    events: EventSender,
    token: CancelToken,
    listener: parking_lot::Mutex<Option<TcpListener>>,
}

impl Server {
    /// Bind the listener and build the TLS acceptor. The accept loop does
    /// not start until [`run`](Server::run) or [`spawn`](Server::spawn).
    pub async fn bind(
        addr: SocketAddr,
        options: SessionOptions,
        validator: Option<Arc<dyn CredentialValidator>>,
        events: EventSender,
    ) -> Result<Server, SessionError> {
        if options.integrated_security && validator.is_none() {
            return Err(SessionError::InvalidConfig(
                "integrated security requires a credential validator".into(),
            ));
        }

        let tls = match &options.tls {
            Some(_) => Some(TlsAcceptor::from(Arc::new(tls::make_server_config(
                &options,
            )?))),
            None => None,
        };

        let listener = transport::listen(addr, &options)
            .await
            .map_err(SessionError::Socket)?;
        let local_addr = listener.local_addr().map_err(SessionError::Socket)?;
        info!("Listening on {}", local_addr);

        Ok(Server {
            inner: Arc::new(ServerInner {
                local_addr,
                options,
                validator,
                tls,
                sessions: parking_lot::RwLock::new(HashMap::new()),
                events,
                token: CancelToken::new(),
                listener: parking_lot::Mutex::new(Some(listener)),
            }),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Drive the accept loop on the current task until the server stops.
    pub async fn run(&self) {
        self.inner.clone().accept_loop().await;
    }

    /// Drive the accept loop on a background task.
    pub fn spawn(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.accept_loop().await })
    }

    /// Look up a live session by id.
    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner.sessions.read().get(&id).cloned()
    }

    /// Ids of every live session.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.inner.sessions.read().keys().copied().collect()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Queue a payload to one peer.
    pub fn send_to(&self, id: SessionId, payload: Bytes) -> Result<SendTicket, SessionError> {
        let session = self
            .inner
            .sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(SessionError::UnknownSession(id))?;
        Ok(session.send(payload))
    }

    /// Send to each live session independently and wait for all outcomes.
    pub async fn broadcast(&self, payload: Bytes) -> Vec<(SessionId, SendOutcome)> {
        let snapshot: Vec<(SessionId, Session)> = self
            .inner
            .sessions
            .read()
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect();

        let tickets: Vec<_> = snapshot
            .into_iter()
            .map(|(id, session)| (id, session.send(payload.clone())))
            .collect();

        let mut outcomes = Vec::with_capacity(tickets.len());
        for (id, ticket) in tickets {
            outcomes.push((id, ticket.wait().await));
        }
        outcomes
    }

    /// Pull-read from one peer's current receive buffer.
    pub fn read(&self, id: SessionId, buf: &mut [u8]) -> Result<usize, SessionError> {
        let session = self
            .inner
            .sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(SessionError::UnknownSession(id))?;
        session.read(buf)
    }

    /// Stop accepting, close the listener, and terminate every live
    /// session. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.token.cancel() {
            return;
        }
        info!("Stopping listener on {}", self.inner.local_addr);

        let sessions: Vec<Session> = {
            let mut map = self.inner.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.disconnect().await;
        }
    }
}

impl ServerInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn accept_loop(self: Arc<Self>) {
        let Some(mut listener) = self.listener.lock().take() else {
            return;
        };
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        consecutive_errors = 0;
                        self.clone().handle_accept(stream, peer);
                    }
                    Err(accept_error) => {
                        consecutive_errors += 1;
                        warn!(
                            "Accept on {} failed ({} consecutive): {}",
                            self.local_addr, consecutive_errors, accept_error
                        );
                        self.emit(SessionEvent::ConnectionException {
                            session: None,
                            error: Arc::new(SessionError::Socket(accept_error)),
                        });

                        if consecutive_errors >= MAX_ACCEPT_ERRORS {
                            error!("Listener on {} is unrecoverable; restarting", self.local_addr);
                            drop(listener);
                            match self.rebind().await {
                                Some(fresh) => {
                                    listener = fresh;
                                    consecutive_errors = 0;
                                }
                                None => break,
                            }
                        } else {
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        }
                    }
                },
            }
        }

        debug!("Accept loop on {} stopped", self.local_addr);
    }

    /// Stop-and-start restart of the listener socket after an
    /// unrecoverable error. Gives up only when the server is stopping.
    async fn rebind(&self) -> Option<TcpListener> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            match transport::listen(self.local_addr, &self.options).await {
                Ok(listener) => {
                    info!("Listener restarted on {}", self.local_addr);
                    return Some(listener);
                }
                Err(bind_error) => {
                    warn!(
                        "Restart bind on {} failed: {}; retrying",
                        self.local_addr, bind_error
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => return None,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    fn handle_accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let limit = self.options.max_client_connections;
        if limit >= 0 && self.sessions.read().len() >= limit as usize {
            warn!(
                "Rejecting {}: client connection limit {} reached",
                peer, limit
            );
            self.emit(SessionEvent::ConnectionException {
                session: None,
                error: Arc::new(SessionError::ClientLimit),
            });
            return;
        }

        // Handshakes run on their own task so a slow peer never stalls
        // the accept loop.
        tokio::spawn(async move { self.handshake(stream, peer).await });
    }

    async fn handshake(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = next_session_id();
        if self.options.no_delay {
            let _ = stream.set_nodelay(true);
        }

        match self.authenticate(stream).await {
            Ok((io, principal)) => {
                let session = Session::establish(
                    id,
                    peer,
                    io,
                    principal.clone(),
                    &self.options,
                    self.events.clone(),
                );

                let registry: Weak<ServerInner> = Arc::downgrade(&self);
                session.set_on_terminate(move |sid| {
                    if let Some(inner) = registry.upgrade() {
                        inner.sessions.write().remove(&sid);
                    }
                });

                self.sessions.write().insert(id, session.clone());
                session.spawn_receive();
                self.emit(SessionEvent::ConnectionEstablished {
                    session: id,
                    peer,
                    principal,
                });
                info!("Client {} connected as session {}", peer, id);
            }
            Err(handshake_error) => {
                warn!("Handshake with {} failed: {}", peer, handshake_error);
                self.emit(SessionEvent::ConnectionException {
                    session: Some(id),
                    error: Arc::new(handshake_error),
                });
                self.emit(SessionEvent::ConnectionTerminated { session: id });
            }
        }
    }

    /// TLS accept, then the credential sub-handshake, each under its own
    /// timeout. Without integrated security the principal falls back to
    /// the client certificate's subject common name, when one was
    /// presented.
    async fn authenticate(
        &self,
        stream: TcpStream,
    ) -> Result<(IoStream, Option<Principal>), SessionError> {
        let (mut io, peer_cert) = match &self.tls {
            Some(acceptor) => {
                match timeout(self.options.handshake_timeout, tls::accept(acceptor, stream)).await
                {
                    Ok(result) => result?,
                    Err(_elapsed) => return Err(SessionError::AuthTimeout),
                }
            }
            None => (IoStream::Plain(stream), None),
        };

        let principal = if self.options.integrated_security {
            let validator = self.validator.as_ref().expect("checked at bind");
            match timeout(
                self.options.handshake_timeout,
                credential::server_handshake(
                    &mut io,
                    validator.as_ref(),
                    self.options.ignore_invalid_credentials,
                ),
            )
            .await
            {
                Ok(result) => result?,
                Err(_elapsed) => return Err(SessionError::AuthTimeout),
            }
        } else {
            peer_cert.as_deref().and_then(tls::principal_from_cert)
        };

        Ok((io, principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use crate::event::{event_channel, EventReceiver};
    use crate::options::Credentials;
    use tokio::time::{sleep, timeout as tokio_timeout};

    struct FixedValidator;

    impl CredentialValidator for FixedValidator {
        fn validate(&self, user: &str, secret: &[u8]) -> Option<Principal> {
            (user == "svc" && secret == b"s3cret").then(|| user.to_owned())
        }
    }

    async fn bind_server(
        options: SessionOptions,
        validator: Option<Arc<dyn CredentialValidator>>,
    ) -> (Server, EventReceiver) {
        let (events, rx) = event_channel();
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), options, validator, events)
            .await
            .unwrap();
        server.spawn();
        (server, rx)
    }

    async fn connect_client(
        addr: SocketAddr,
        options: SessionOptions,
    ) -> (Session, EventReceiver) {
        let (events, rx) = event_channel();
        let mut connector = Connector::new(vec![addr], options, events).unwrap();
        let session = connector.connect().await.unwrap();
        (session, rx)
    }

    async fn next_event(rx: &mut EventReceiver) -> SessionEvent {
        tokio_timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event should arrive")
            .expect("event channel open")
    }

    /// Echo scenario: marker 0xAA 0x55, little-endian, three-byte body.
    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (server, mut server_rx) = bind_server(SessionOptions::default(), None).await;
        let addr = server.local_addr();

        // Server observer: echo every received payload back to its peer.
        let echo = server.clone();
        tokio::spawn(async move {
            while let Some(event) = server_rx.recv().await {
                if let SessionEvent::ReceiveComplete { session, payload, .. } = event {
                    let _ = echo.send_to(session, payload);
                }
            }
        });

        let (client, mut client_rx) = connect_client(addr, SessionOptions::default()).await;
        skip_established(&mut client_rx).await;

        let ticket = client.send(Bytes::from_static(&[0x01, 0x02, 0x03]));
        assert!(ticket.wait().await.is_ok());

        loop {
            match next_event(&mut client_rx).await {
                SessionEvent::ReceiveComplete { payload, size, .. } => {
                    assert_eq!(&payload[..], &[0x01, 0x02, 0x03]);
                    assert_eq!(size, 3);
                    break;
                }
                SessionEvent::SendStart { .. }
                | SessionEvent::SendComplete { .. }
                | SessionEvent::ReceiveReady { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }

        client.disconnect().await;
        server.stop().await;
    }

    async fn skip_established(rx: &mut EventReceiver) {
        loop {
            match next_event(rx).await {
                SessionEvent::ConnectionEstablished { .. } => return,
                SessionEvent::ConnectionAttempt { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_frame_observed_by_server() {
        let (server, mut server_rx) = bind_server(SessionOptions::default(), None).await;
        let (client, mut client_rx) = connect_client(server.local_addr(), SessionOptions::default()).await;
        skip_established(&mut client_rx).await;

        let ticket = client.send(Bytes::new());
        assert!(ticket.wait().await.is_ok());

        loop {
            match next_event(&mut server_rx).await {
                SessionEvent::ReceiveComplete { payload, size, .. } => {
                    assert!(payload.is_empty());
                    assert_eq!(size, 0);
                    break;
                }
                SessionEvent::ConnectionEstablished { .. }
                | SessionEvent::ReceiveReady { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_limit_rejects_excess_peers() {
        let options = SessionOptions {
            max_client_connections: 1,
            ..Default::default()
        };
        let (server, mut server_rx) = bind_server(options, None).await;
        let addr = server.local_addr();

        let (first, mut first_rx) = connect_client(addr, SessionOptions::default()).await;
        skip_established(&mut first_rx).await;
        loop {
            if let SessionEvent::ConnectionEstablished { .. } = next_event(&mut server_rx).await {
                break;
            }
        }
        assert_eq!(server.session_count(), 1);

        // The second peer is rejected at accept time.
        let tcp = transport::connect(addr, &SessionOptions::default())
            .await
            .unwrap();
        loop {
            match next_event(&mut server_rx).await {
                SessionEvent::ConnectionException { error, .. } => {
                    assert!(matches!(*error, SessionError::ClientLimit));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(server.session_count(), 1);
        drop(tcp);

        first.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let (server, mut server_rx) = bind_server(SessionOptions::default(), None).await;
        let addr = server.local_addr();

        let (one, mut one_rx) = connect_client(addr, SessionOptions::default()).await;
        skip_established(&mut one_rx).await;
        let (two, mut two_rx) = connect_client(addr, SessionOptions::default()).await;
        skip_established(&mut two_rx).await;

        let mut established = 0;
        while established < 2 {
            if let SessionEvent::ConnectionEstablished { .. } = next_event(&mut server_rx).await {
                established += 1;
            }
        }
        assert_eq!(server.session_count(), 2);

        let outcomes = server.broadcast(Bytes::from_static(b"fanout")).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));

        for rx in [&mut one_rx, &mut two_rx] {
            loop {
                if let SessionEvent::ReceiveComplete { payload, .. } = next_event(rx).await {
                    assert_eq!(&payload[..], b"fanout");
                    break;
                }
            }
        }

        one.disconnect().await;
        two.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_graceful_client_close_removes_session() {
        let (server, mut server_rx) = bind_server(SessionOptions::default(), None).await;
        let (client, mut client_rx) = connect_client(server.local_addr(), SessionOptions::default()).await;
        skip_established(&mut client_rx).await;

        let server_session = loop {
            if let SessionEvent::ConnectionEstablished { session, .. } =
                next_event(&mut server_rx).await
            {
                break session;
            }
        };

        // One exchange, then a clean client-side close.
        let ticket = client.send(Bytes::from_static(b"bye"));
        assert!(ticket.wait().await.is_ok());
        loop {
            if let SessionEvent::ReceiveComplete { .. } = next_event(&mut server_rx).await {
                break;
            }
        }

        client.disconnect().await;

        let mut terminations = 0;
        loop {
            match next_event(&mut server_rx).await {
                SessionEvent::ConnectionTerminated { session } => {
                    assert_eq!(session, server_session);
                    terminations += 1;
                    break;
                }
                SessionEvent::ReceiveException { .. } => {
                    panic!("clean close must not raise a receive exception")
                }
                _ => {}
            }
        }
        assert_eq!(terminations, 1);

        // Removal from the live map follows termination.
        for _ in 0..50 {
            if server.session_count() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.session_count(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_integrated_security_binds_principal() {
        let options = SessionOptions {
            integrated_security: true,
            ..Default::default()
        };
        let (server, mut server_rx) = bind_server(options, Some(Arc::new(FixedValidator))).await;

        let client_options = SessionOptions {
            integrated_security: true,
            credentials: Some(Credentials {
                user: "svc".into(),
                secret: Bytes::from_static(b"s3cret"),
            }),
            ..Default::default()
        };
        let (client, mut client_rx) = connect_client(server.local_addr(), client_options).await;
        skip_established(&mut client_rx).await;

        let principal = loop {
            if let SessionEvent::ConnectionEstablished { session, principal, .. } =
                next_event(&mut server_rx).await
            {
                let live = server.session(session).unwrap();
                assert_eq!(live.principal(), principal.as_deref());
                break principal;
            }
        };
        assert_eq!(principal.as_deref(), Some("svc"));

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bad_credentials_terminate_handshake_only() {
        let options = SessionOptions {
            integrated_security: true,
            ..Default::default()
        };
        let (server, mut server_rx) = bind_server(options, Some(Arc::new(FixedValidator))).await;
        let addr = server.local_addr();

        let client_options = SessionOptions {
            integrated_security: true,
            credentials: Some(Credentials {
                user: "svc".into(),
                secret: Bytes::from_static(b"wrong"),
            }),
            ..Default::default()
        };
        let (events, _client_rx) = event_channel();
        let mut connector = Connector::new(vec![addr], client_options, events).unwrap();
        assert!(matches!(
            connector.connect().await,
            Err(SessionError::BadCredentials)
        ));

        loop {
            match next_event(&mut server_rx).await {
                SessionEvent::ConnectionException { error, .. } => {
                    assert!(matches!(*error, SessionError::BadCredentials));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(matches!(
            next_event(&mut server_rx).await,
            SessionEvent::ConnectionTerminated { .. }
        ));

        // The listener survives: a well-credentialed client still connects.
        let good_options = SessionOptions {
            integrated_security: true,
            credentials: Some(Credentials {
                user: "svc".into(),
                secret: Bytes::from_static(b"s3cret"),
            }),
            ..Default::default()
        };
        let (client, mut client_rx) = connect_client(addr, good_options).await;
        skip_established(&mut client_rx).await;

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_read_unknown_session_fails() {
        let (server, _server_rx) = bind_server(SessionOptions::default(), None).await;
        let mut buf = [0u8; 4];
        assert!(matches!(
            server.read(SessionId(u64::MAX), &mut buf),
            Err(SessionError::UnknownSession(_))
        ));
        server.stop().await;
    }
}
