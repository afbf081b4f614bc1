//! Outbound payload queue, the in-flight gate, and the drop policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::SessionError;

/// Outcome of one queued payload: sent, failed, or dropped.
pub type SendOutcome = Result<(), Arc<SessionError>>;

/// One queued payload and its completion latch.
///
/// `data` already carries the frame header in payload-aware mode;
/// `body_len` is the user-byte count used for statistics and events.
pub(crate) struct Payload {
    pub data: Bytes,
    pub body_len: usize,
    latch: oneshot::Sender<SendOutcome>,
}

impl Payload {
    pub fn new(data: Bytes, body_len: usize) -> (Self, SendTicket) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                data,
                body_len,
                latch: tx,
            },
            SendTicket { rx },
        )
    }

    /// Signal the completion latch. Each payload is resolved exactly once;
    /// the latch consumes itself here.
    pub fn resolve(self, outcome: SendOutcome) {
        let _ = self.latch.send(outcome);
    }
}

/// Awaitable completion handle returned by a send call.
pub struct SendTicket {
    rx: oneshot::Receiver<SendOutcome>,
}

impl SendTicket {
    /// Wait until the payload was written, its write failed, or it was
    /// dropped by the queue bound or teardown.
    pub async fn wait(self) -> SendOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Arc::new(SessionError::Terminated)))
    }
}

/// Lock-free FIFO of pending payloads plus the sending-in-flight gate.
///
/// The gate is `true` iff a send-loop iteration is active for the owning
/// session. The short `recheck` critical section closes the race between
/// a producer that just pushed and a consumer about to release the gate
/// on an empty queue.
pub(crate) struct SendQueue {
    entries: SegQueue<Payload>,
    in_flight: AtomicBool,
    recheck: Mutex<()>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            entries: SegQueue::new(),
            in_flight: AtomicBool::new(false),
            recheck: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Opportunistic drop policy, run before each enqueue: when the queue
    /// has reached `max`, drain up to `max` entries and resolve their
    /// latches with [`SessionError::QueueOverflow`]. Returns how many
    /// payloads were dropped.
    pub fn dump_if_full(&self, max: i32) -> usize {
        if max < 0 {
            return 0;
        }
        let max = max as usize;
        if self.entries.len() < max {
            return 0;
        }

        let mut dropped = 0;
        while dropped < max {
            match self.entries.pop() {
                Some(payload) => {
                    payload.resolve(Err(Arc::new(SessionError::QueueOverflow)));
                    dropped += 1;
                }
                None => break,
            }
        }
        dropped
    }

    /// Enqueue a payload and try to take the gate. Returns `true` when the
    /// caller must launch the send loop; `false` means an iteration is
    /// already running and will observe the new entry.
    pub fn push_and_claim(&self, payload: Payload) -> bool {
        self.entries.push(payload);
        let _guard = self.recheck.lock();
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn pop(&self) -> Option<Payload> {
        self.entries.pop()
    }

    /// Release the gate if the queue is still empty; keep it otherwise.
    /// Returns `true` when the gate was released and the loop must exit.
    pub fn release_if_empty(&self) -> bool {
        let _guard = self.recheck.lock();
        if self.entries.is_empty() {
            self.in_flight.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Unconditionally release the gate (error and teardown paths).
    pub fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Drain every pending payload, resolving each latch with `error`.
    /// Returns how many were released.
    pub fn drain(&self, error: Arc<SessionError>) -> usize {
        let mut drained = 0;
        while let Some(payload) = self.entries.pop() {
            payload.resolve(Err(error.clone()));
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> (Payload, SendTicket) {
        Payload::new(Bytes::copy_from_slice(&[byte]), 1)
    }

    #[test]
    fn test_gate_claimed_once() {
        let queue = SendQueue::new();
        let (p1, _t1) = payload(1);
        let (p2, _t2) = payload(2);

        assert!(queue.push_and_claim(p1), "first producer takes the gate");
        assert!(!queue.push_and_claim(p2), "gate already held");
        assert!(queue.is_in_flight());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_release_if_empty_keeps_gate_when_entries_remain() {
        let queue = SendQueue::new();
        let (p, _t) = payload(1);
        queue.push_and_claim(p);

        assert!(!queue.release_if_empty());
        assert!(queue.is_in_flight());

        queue.pop().unwrap().resolve(Ok(()));
        assert!(queue.release_if_empty());
        assert!(!queue.is_in_flight());
    }

    #[tokio::test]
    async fn test_dump_if_full_drops_oldest_first() {
        let queue = SendQueue::new();
        let (p1, t1) = payload(1);
        let (p2, t2) = payload(2);
        queue.push_and_claim(p1);

        // Bound of 1: enqueueing a second payload dumps the first.
        assert_eq!(queue.dump_if_full(1), 1);
        queue.push_and_claim(p2);
        assert_eq!(queue.len(), 1);

        assert!(matches!(
            t1.wait().await,
            Err(e) if matches!(*e, SessionError::QueueOverflow)
        ));
        assert_eq!(&queue.pop().unwrap().data[..], &[2]);
        drop(t2);
    }

    #[test]
    fn test_dump_disabled_with_negative_bound() {
        let queue = SendQueue::new();
        let mut tickets = Vec::new();
        for i in 0..100 {
            let (p, t) = payload(i);
            queue.push_and_claim(p);
            tickets.push(t);
        }
        assert_eq!(queue.dump_if_full(-1), 0);
        assert_eq!(queue.len(), 100);
    }

    #[tokio::test]
    async fn test_drain_resolves_every_latch() {
        let queue = SendQueue::new();
        let tickets: Vec<_> = (0..5)
            .map(|i| {
                let (p, t) = payload(i);
                queue.push_and_claim(p);
                t
            })
            .collect();

        assert_eq!(queue.drain(Arc::new(SessionError::Terminated)), 5);
        assert_eq!(queue.len(), 0);
        for ticket in tickets {
            assert!(matches!(
                ticket.wait().await,
                Err(e) if matches!(*e, SessionError::Terminated)
            ));
        }
    }

    #[tokio::test]
    async fn test_dropped_latch_reports_terminated() {
        let (payload, ticket) = payload(7);
        drop(payload);
        assert!(matches!(
            ticket.wait().await,
            Err(e) if matches!(*e, SessionError::Terminated)
        ));
    }
}
