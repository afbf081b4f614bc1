//! Core session type: per-connection state, send and receive loops,
//! pull-style reads, and the teardown discipline.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::credential::Principal;
use crate::error::SessionError;
use crate::event::{EventSender, SessionEvent};
use crate::options::SessionOptions;
use crate::queue::{Payload, SendQueue, SendTicket};
use crate::transport::IoStream;
use tether_wire::{FrameDecoder, FrameFormat};

/// Stable identifier of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(
    /// Raw numeric id, unique within the process
    pub u64,
);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocate the next session identifier.
pub(crate) fn next_session_id() -> SessionId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Point-in-time statistics for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// User bytes written, excluding framing
    pub bytes_sent: u64,
    /// User bytes delivered, excluding framing
    pub bytes_received: u64,
    /// Payloads written
    pub payloads_sent: u64,
    /// Payloads delivered
    pub payloads_received: u64,
}

#[derive(Default)]
struct StatCells {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    payloads_sent: AtomicU64,
    payloads_received: AtomicU64,
}

/// The most recent complete payload, exposed to pull-style reads.
struct ReceiveWindow {
    data: Bytes,
    read_index: usize,
}

type TerminateHook = Box<dyn FnOnce(SessionId) + Send>;

pub(crate) struct SessionShared {
    id: SessionId,
    peer: SocketAddr,
    principal: Option<Principal>,
    format: Option<FrameFormat>,
    max_send_queue: i32,
    receive_buffer_size: usize,
    max_payload: usize,
    queue: SendQueue,
    token: CancelToken,
    writer: tokio::sync::Mutex<Option<WriteHalf<IoStream>>>,
    window: parking_lot::Mutex<Option<ReceiveWindow>>,
    stats: StatCells,
    events: EventSender,
    on_terminate: parking_lot::Mutex<Option<TerminateHook>>,
    pending_reader: parking_lot::Mutex<Option<ReadHalf<IoStream>>>,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    send_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        // Observers that went away must not take the session down with them.
        let _ = self.events.send(event);
    }

    /// Publish one complete payload: update statistics, refresh the pull
    /// window, then raise the receive events.
    fn deliver(&self, body: Bytes) {
        let size = body.len();
        self.stats
            .bytes_received
            .fetch_add(size as u64, Ordering::Relaxed);
        self.stats.payloads_received.fetch_add(1, Ordering::Relaxed);

        *self.window.lock() = Some(ReceiveWindow {
            data: body.clone(),
            read_index: 0,
        });

        self.emit(SessionEvent::ReceiveReady {
            session: self.id,
            size,
        });
        self.emit(SessionEvent::ReceiveComplete {
            session: self.id,
            payload: body,
            size,
        });
    }

    /// Tear the session down. The caller that flips the token first owns
    /// the single `ConnectionTerminated` emission and the disposal of the
    /// write half; every other caller returns immediately.
    pub(crate) async fn terminate(self: &Arc<Self>) {
        if !self.token.cancel() {
            return;
        }

        let drained = self.queue.drain(Arc::new(SessionError::Terminated));
        if drained > 0 {
            debug!("Released {} pending payloads on teardown of {}", drained, self.id);
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(hook) = self.on_terminate.lock().take() {
            hook(self.id);
        }

        self.emit(SessionEvent::ConnectionTerminated { session: self.id });
        info!("Session {} with {} terminated", self.id, self.peer);
    }
}

/// Handle to one established, authenticated connection.
///
/// Clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn establish(
        id: SessionId,
        peer: SocketAddr,
        stream: IoStream,
        principal: Option<Principal>,
        options: &SessionOptions,
        events: EventSender,
    ) -> Session {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(SessionShared {
            id,
            peer,
            principal,
            format: options.frame_format(),
            max_send_queue: options.max_send_queue_size,
            receive_buffer_size: options.receive_buffer_size,
            max_payload: options.max_payload_size,
            queue: SendQueue::new(),
            token: CancelToken::new(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            window: parking_lot::Mutex::new(None),
            stats: StatCells::default(),
            events,
            on_terminate: parking_lot::Mutex::new(None),
            pending_reader: parking_lot::Mutex::new(Some(reader)),
            recv_task: parking_lot::Mutex::new(None),
            send_task: parking_lot::Mutex::new(None),
        });
        Session { shared }
    }

    /// Register the cleanup hook the first terminate-flipper runs (the
    /// acceptor uses this to drop the session from its live map).
    pub(crate) fn set_on_terminate(&self, hook: impl FnOnce(SessionId) + Send + 'static) {
        *self.shared.on_terminate.lock() = Some(Box::new(hook));
    }

    /// Start the receive loop. Called once, after the session is wired
    /// into its owner; a second call is a no-op.
    pub(crate) fn spawn_receive(&self) {
        let Some(reader) = self.shared.pending_reader.lock().take() else {
            return;
        };
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            match shared.format.clone() {
                Some(format) => receive_loop_framed(shared, reader, format).await,
                None => receive_loop_raw(shared, reader).await,
            }
        });
        *self.shared.recv_task.lock() = Some(task);
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Principal bound by the credential sub-handshake, when one was
    /// captured.
    pub fn principal(&self) -> Option<&str> {
        self.shared.principal.as_deref()
    }

    /// Whether the session is still live.
    pub fn is_connected(&self) -> bool {
        !self.shared.token.is_cancelled()
    }

    /// The session's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.token.clone()
    }

    /// Number of payloads waiting in the send queue.
    pub fn pending_sends(&self) -> usize {
        self.shared.queue.len()
    }

    /// Snapshot of the session's statistics counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_sent: self.shared.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.stats.bytes_received.load(Ordering::Relaxed),
            payloads_sent: self.shared.stats.payloads_sent.load(Ordering::Relaxed),
            payloads_received: self.shared.stats.payloads_received.load(Ordering::Relaxed),
        }
    }

    /// Queue a payload for transmission and return its completion handle.
    ///
    /// Never blocks the producer. When the queue has reached its bound the
    /// drop policy dumps pending payloads first; their latches resolve
    /// with [`SessionError::QueueOverflow`]. Sends on a terminated session
    /// are suppressed and resolve with [`SessionError::Disposed`].
    pub fn send(&self, payload: impl Into<Bytes>) -> SendTicket {
        let payload: Bytes = payload.into();
        let shared = &self.shared;

        if shared.token.is_cancelled() {
            let (entry, ticket) = Payload::new(Bytes::new(), 0);
            entry.resolve(Err(Arc::new(SessionError::Disposed)));
            debug!("Send on disposed session {} suppressed", shared.id);
            return ticket;
        }

        let body_len = payload.len();
        let data = match &shared.format {
            Some(format) => match format.encode(&payload) {
                Ok(framed) => framed,
                Err(wire_error) => {
                    let (entry, ticket) = Payload::new(Bytes::new(), 0);
                    let error = Arc::new(SessionError::Framing(wire_error));
                    entry.resolve(Err(error.clone()));
                    shared.emit(SessionEvent::SendException {
                        session: shared.id,
                        error,
                    });
                    return ticket;
                }
            },
            None => payload,
        };

        let dropped = shared.queue.dump_if_full(shared.max_send_queue);
        if dropped > 0 {
            warn!(
                "Send queue for session {} dumped {} pending payloads",
                shared.id, dropped
            );
            shared.emit(SessionEvent::SendException {
                session: shared.id,
                error: Arc::new(SessionError::QueueOverflow),
            });
        }

        let (entry, ticket) = Payload::new(data, body_len);
        if shared.queue.push_and_claim(entry) {
            let task = tokio::spawn(send_loop(shared.clone()));
            *shared.send_task.lock() = Some(task);
        }
        ticket
    }

    /// Copy buffered payload bytes into `buf`, advancing the session's
    /// read index; the index wraps to zero at the payload boundary.
    ///
    /// Defined inside a `ReceiveReady` window; before the first payload it
    /// fails with [`SessionError::NoReceiveBuffer`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let mut window = self.shared.window.lock();
        let window = window.as_mut().ok_or(SessionError::NoReceiveBuffer)?;

        let available = window.data.len() - window.read_index;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&window.data[window.read_index..window.read_index + n]);
        window.read_index += n;
        if window.read_index >= window.data.len() {
            window.read_index = 0;
        }
        Ok(n)
    }

    /// Tear the session down and wait for its loops to stop.
    ///
    /// After this returns no further events fire for the session and the
    /// socket is closed. Pending payloads resolve with
    /// [`SessionError::Terminated`].
    pub async fn disconnect(&self) {
        self.shared.terminate().await;

        let recv = self.shared.recv_task.lock().take();
        if let Some(task) = recv {
            let _ = task.await;
        }
        let send = self.shared.send_task.lock().take();
        if let Some(task) = send {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("connected", &!self.shared.token.is_cancelled())
            .finish()
    }
}

/// One write, raced against the session token so teardown can interrupt
/// a stalled peer.
async fn write_payload(
    token: &CancelToken,
    writer: &mut WriteHalf<IoStream>,
    data: &[u8],
) -> Result<(), SessionError> {
    tokio::select! {
        _ = token.cancelled() => Err(SessionError::Terminated),
        result = async {
            writer.write_all(data).await?;
            writer.flush().await
        } => result.map_err(SessionError::Socket),
    }
}

/// The single logical send loop of a session. Launched by the producer
/// that wins the in-flight gate; exits once the queue is drained or the
/// session goes down.
async fn send_loop(shared: Arc<SessionShared>) {
    loop {
        if shared.token.is_cancelled() {
            shared.queue.release();
            shared.queue.drain(Arc::new(SessionError::Terminated));
            return;
        }

        let Some(payload) = shared.queue.pop() else {
            if shared.queue.release_if_empty() {
                return;
            }
            // A producer slipped in between the pop and the gate check.
            continue;
        };

        shared.emit(SessionEvent::SendStart { session: shared.id });

        let result = {
            let mut writer = shared.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => write_payload(&shared.token, writer, &payload.data).await,
                None => Err(SessionError::Disposed),
            }
        };

        match result {
            Ok(()) => {
                let bytes = payload.body_len;
                shared
                    .stats
                    .bytes_sent
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                shared.stats.payloads_sent.fetch_add(1, Ordering::Relaxed);
                payload.resolve(Ok(()));
                shared.emit(SessionEvent::SendComplete {
                    session: shared.id,
                    bytes,
                });
            }
            Err(send_error) => {
                let teardown = matches!(
                    send_error,
                    SessionError::Terminated | SessionError::Disposed
                );
                let error = Arc::new(send_error);
                payload.resolve(Err(error.clone()));
                shared.queue.release();

                if teardown {
                    shared.queue.drain(Arc::new(SessionError::Terminated));
                } else {
                    warn!("Send to {} failed for session {}: {}", shared.peer, shared.id, error);
                    shared.emit(SessionEvent::SendException {
                        session: shared.id,
                        error,
                    });
                    shared.terminate().await;
                }
                return;
            }
        }
    }
}

/// Framed receive loop: header and body sub-states driven by the decoder.
async fn receive_loop_framed(
    shared: Arc<SessionShared>,
    mut reader: ReadHalf<IoStream>,
    format: FrameFormat,
) {
    let header_len = format.header_len();
    let mut decoder = FrameDecoder::with_max_payload(format, shared.max_payload);
    let mut buf = BytesMut::with_capacity(shared.receive_buffer_size.max(header_len));

    loop {
        // Drain every complete frame already buffered before reading more.
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(body)) => shared.deliver(body),
                Ok(None) => break,
                Err(wire_error) => {
                    error!(
                        "Framing error from {} on session {}: {}",
                        shared.peer, shared.id, wire_error
                    );
                    shared.emit(SessionEvent::ReceiveException {
                        session: shared.id,
                        error: Arc::new(SessionError::Framing(wire_error)),
                    });
                    shared.terminate().await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = shared.token.cancelled() => return,
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    debug!("Peer {} closed session {}", shared.peer, shared.id);
                    shared.terminate().await;
                    return;
                }
                Ok(_) => {}
                Err(io_error) => {
                    error!(
                        "Receive from {} failed for session {}: {}",
                        shared.peer, shared.id, io_error
                    );
                    shared.emit(SessionEvent::ConnectionException {
                        session: Some(shared.id),
                        error: Arc::new(SessionError::Socket(io_error)),
                    });
                    shared.terminate().await;
                    return;
                }
            },
        }
    }
}

/// Unframed receive loop: deliver whatever each read returns.
async fn receive_loop_raw(shared: Arc<SessionShared>, mut reader: ReadHalf<IoStream>) {
    let mut chunk = vec![0u8; shared.receive_buffer_size];

    loop {
        tokio::select! {
            _ = shared.token.cancelled() => return,
            result = reader.read(&mut chunk) => match result {
                Ok(0) => {
                    debug!("Peer {} closed session {}", shared.peer, shared.id);
                    shared.terminate().await;
                    return;
                }
                Ok(n) => shared.deliver(Bytes::copy_from_slice(&chunk[..n])),
                Err(io_error) => {
                    error!(
                        "Receive from {} failed for session {}: {}",
                        shared.peer, shared.id, io_error
                    );
                    shared.emit(SessionEvent::ConnectionException {
                        session: Some(shared.id),
                        error: Arc::new(SessionError::Socket(io_error)),
                    });
                    shared.terminate().await;
                    return;
                }
            },
        }
    }
}
