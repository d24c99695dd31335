//! Per-client control-channel state
//!
//! One `ControlChannel` exists per authenticated client session. All
//! producers enqueue frames into a bounded queue; exactly one writer task
//! (owned by the session in `ws.rs`) drains it and performs the socket
//! write, which is what gives per-stream frame ordering and backpressure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use tunlify_catalog::TunnelKey;
use tunlify_proto::ControlMessage;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Why a channel was told to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer channel authenticated with the same token (last-writer-wins).
    Displaced,
    /// The janitor saw no activity past the staleness threshold.
    Evicted,
    /// The tunnel row was deleted via the management API.
    Deleted,
    /// The peer closed the socket or the read loop failed.
    PeerGone,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    pub fn close_code(&self) -> u16 {
        match self {
            // Policy violation: the session is no longer allowed to exist.
            CloseReason::Displaced | CloseReason::Deleted => 1008,
            CloseReason::Evicted => 1001,
            CloseReason::PeerGone => 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("control channel closed")]
    Closed,
    #[error("send queue full")]
    QueueFull,
}

/// Events routed to one TCP ingress stream from the control channel.
#[derive(Debug)]
pub enum TcpEvent {
    Ack,
    Data(Vec<u8>),
    Close,
    Error(String),
}

pub struct ControlChannel {
    channel_id: u64,
    pub tunnel_id: String,
    pub key: TunnelKey,
    pub user_id: String,
    tx: mpsc::Sender<ControlMessage>,
    opened_at: Instant,
    last_activity: RwLock<Instant>,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    closed: AtomicBool,
    close_reason: RwLock<Option<CloseReason>>,
    close_signal: Notify,
    /// Live TCP ingress streams, keyed by connection id.
    pub tcp_streams: DashMap<String, mpsc::Sender<TcpEvent>>,
    /// Live UDP sessions, keyed by session id; payloads are return datagrams.
    pub udp_sessions: DashMap<String, mpsc::Sender<Vec<u8>>>,
}

impl ControlChannel {
    /// Create the channel plus the receiving end of its send queue, which
    /// the session's writer task drains.
    pub fn new(
        tunnel_id: String,
        key: TunnelKey,
        user_id: String,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let channel = Arc::new(Self {
            channel_id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            tunnel_id,
            key,
            user_id,
            tx,
            opened_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_reason: RwLock::new(None),
            close_signal: Notify::new(),
            tcp_streams: DashMap::new(),
            udp_sessions: DashMap::new(),
        });
        (channel, rx)
    }

    /// Identity used for compare-and-delete in the registry.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Enqueue a frame, waiting if the queue is full. This is the
    /// backpressure path used by the L4 ingress: a saturated queue pauses
    /// the producer's reads.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.send(msg).await.map_err(|_| SendError::Closed)
    }

    /// Enqueue a frame without waiting. The HTTP ingress uses this to fail
    /// fast with 503 when the queue is saturated.
    pub fn try_send(&self, msg: ControlMessage) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Record inbound activity (any frame counts as liveness).
    pub fn touch(&self) {
        *self.last_activity.write().expect("activity lock") = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().expect("activity lock").elapsed()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    pub fn note_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub fn responses_received(&self) -> u64 {
        self.responses_received.load(Ordering::Relaxed)
    }

    /// Ask the session to shut down. Idempotent; the first reason wins.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.write().expect("close lock") = Some(reason);
        debug!(
            tunnel_id = %self.tunnel_id,
            channel_id = self.channel_id,
            ?reason,
            "control channel close requested"
        );
        self.close_signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.read().expect("close lock")
    }

    /// Resolves once `close` has been called. Safe to race with it.
    pub async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.close_signal.notified();
            tokio::pin!(notified);
            // Register for the wakeup before the final flag check, so a
            // close landing in between cannot be missed.
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Drop all per-stream dispatch state; senders going away terminates
    /// the per-connection and per-session tasks.
    pub fn teardown_streams(&self) {
        self.tcp_streams.clear();
        self.udp_sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(capacity: usize) -> (Arc<ControlChannel>, mpsc::Receiver<ControlMessage>) {
        ControlChannel::new(
            "t-1".to_string(),
            TunnelKey::new("myapp", "id"),
            "user-1".to_string(),
            capacity,
        )
    }

    #[tokio::test]
    async fn test_try_send_fails_fast_when_full() {
        let (channel, _rx) = test_channel(1);

        channel.try_send(ControlMessage::Heartbeat).unwrap();
        let err = channel.try_send(ControlMessage::Heartbeat).unwrap_err();
        assert!(matches!(err, SendError::QueueFull));
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (channel, _rx) = test_channel(4);
        channel.close(CloseReason::Evicted);

        assert!(matches!(
            channel.send(ControlMessage::Heartbeat).await,
            Err(SendError::Closed)
        ));
        assert!(matches!(
            channel.try_send(ControlMessage::Heartbeat),
            Err(SendError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_first_reason_wins() {
        let (channel, _rx) = test_channel(4);
        channel.close(CloseReason::Displaced);
        channel.close(CloseReason::Evicted);

        assert_eq!(channel.close_reason(), Some(CloseReason::Displaced));
    }

    #[tokio::test]
    async fn test_closed_resolves_even_if_close_raced_ahead() {
        let (channel, _rx) = test_channel(4);
        channel.close(CloseReason::PeerGone);

        // Must not hang: close happened before anyone awaited.
        tokio::time::timeout(std::time::Duration::from_secs(1), channel.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_channel_ids_are_unique() {
        let (a, _rx_a) = test_channel(1);
        let (b, _rx_b) = test_channel(1);
        assert_ne!(a.channel_id(), b.channel_id());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::Displaced.close_code(), 1008);
        assert_eq!(CloseReason::Deleted.close_code(), 1008);
        assert_eq!(CloseReason::PeerGone.close_code(), 1000);
    }
}
