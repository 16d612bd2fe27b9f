//! In-process mock implementations
//!
//! A mock relay hub, data channel pair, peer connector pair, and session
//! API, so whole sessions can run deterministically in tests with no
//! network or real WebRTC stack.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::debug;

use crate::api::{CreateSessionRequest, SessionApi};
use crate::error::ShareError;
use crate::transport::{DataChannel, PeerConnector, SignalingTransport};
use crate::types::{CandidateInit, SessionDescriptor, SignalingMessage};

#[derive(Debug, Clone)]
struct Envelope {
    from: u64,
    msg: SignalingMessage,
}

struct HubInner {
    tx: broadcast::Sender<Envelope>,
    participants: std::sync::Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    // Parked subscriber so sends never fail for lack of receivers.
    _keepalive: std::sync::Mutex<broadcast::Receiver<Envelope>>,
}

/// Simulated signaling relay for one session
///
/// Every transport created from the hub talks to every other; a transport
/// never sees its own messages. When a second participant connects, the
/// hub emits `peer_connected` the way the real relay does.
#[derive(Clone)]
pub struct MockSignalingHub {
    inner: Arc<HubInner>,
}

impl MockSignalingHub {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, keepalive) = broadcast::channel(256);
        Self {
            inner: Arc::new(HubInner {
                tx,
                participants: std::sync::Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                _keepalive: std::sync::Mutex::new(keepalive),
            }),
        }
    }

    /// Create a new transport endpoint on this hub.
    pub fn transport(&self) -> MockSignalingTransport {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        MockSignalingTransport {
            id,
            hub: self.inner.clone(),
            connected: Arc::new(AtomicBool::new(false)),
            fail_connects: Arc::new(AtomicU64::new(0)),
            rx: Arc::new(Mutex::new(None)),
            pump: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

/// One participant's endpoint on a [`MockSignalingHub`]
#[derive(Clone)]
pub struct MockSignalingTransport {
    id: u64,
    hub: Arc<HubInner>,
    connected: Arc<AtomicBool>,
    fail_connects: Arc<AtomicU64>,
    rx: Arc<Mutex<Option<mpsc::Receiver<SignalingMessage>>>>,
    pump: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl MockSignalingTransport {
    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u64) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Simulate an unexpected socket close. A later `connect` re-arms the
    /// endpoint.
    pub fn interrupt(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().ok().and_then(|mut g| g.take()) {
            pump.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for MockSignalingTransport {
    async fn connect(&self) -> Result<(), ShareError> {
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(ShareError::SignalingUnreachable(
                "mock connect refused".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(256);
        let mut hub_rx = self.hub.tx.subscribe();
        let my_id = self.id;
        let pump = tokio::spawn(async move {
            loop {
                match hub_rx.recv().await {
                    Ok(env) if env.from != my_id => {
                        if tx.send(env.msg).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(n, "mock transport lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        if let Ok(mut guard) = self.pump.lock() {
            if let Some(old) = guard.replace(pump) {
                old.abort();
            }
        }
        *self.rx.lock().await = Some(rx);
        self.connected.store(true, Ordering::SeqCst);

        // The relay announces peers in both directions: existing parties
        // learn about the new joiner, and the joiner about existing ones.
        let (newly_joined, others) = {
            let mut participants = self
                .hub
                .participants
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let newly_joined = participants.insert(self.id);
            let others: Vec<u64> = participants
                .iter()
                .copied()
                .filter(|id| *id != self.id)
                .collect();
            (newly_joined, others)
        };
        if newly_joined && !others.is_empty() {
            let _ = self.hub.tx.send(Envelope {
                from: self.id,
                msg: SignalingMessage::PeerConnected {
                    client_id: self.id.to_string(),
                },
            });
            for other in others {
                let _ = self.hub.tx.send(Envelope {
                    from: other,
                    msg: SignalingMessage::PeerConnected {
                        client_id: other.to_string(),
                    },
                });
            }
        }
        Ok(())
    }

    async fn send(&self, msg: &SignalingMessage) -> Result<(), ShareError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ShareError::SignalingUnreachable(
                "mock transport not connected".to_string(),
            ));
        }
        let _ = self.hub.tx.send(Envelope {
            from: self.id,
            msg: msg.clone(),
        });
        Ok(())
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut()?;
        rx.recv().await
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.hub.tx.send(Envelope {
                from: self.id,
                msg: SignalingMessage::PeerDisconnected {
                    client_id: self.id.to_string(),
                },
            });
        }
        {
            let mut participants = self
                .hub
                .participants
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            participants.remove(&self.id);
        }
        if let Some(pump) = self.pump.lock().ok().and_then(|mut g| g.take()) {
            pump.abort();
        }
    }
}

/// One end of an in-process data channel pair
pub struct MockDataChannel {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    link_open: Arc<watch::Sender<bool>>,
    peer_inbound: Arc<AtomicU64>,
    inbound: Arc<AtomicU64>,
}

/// Build a connected channel pair. Delivery is instant and ordered; close
/// on either end closes the link for both.
pub fn mock_data_channel_pair() -> (Arc<MockDataChannel>, Arc<MockDataChannel>) {
    let (tx_a, rx_b) = mpsc::channel(1024);
    let (tx_b, rx_a) = mpsc::channel(1024);
    let (link_open, _) = watch::channel(true);
    let link_open = Arc::new(link_open);
    let count_a = Arc::new(AtomicU64::new(0));
    let count_b = Arc::new(AtomicU64::new(0));
    let a = Arc::new(MockDataChannel {
        tx: tx_a,
        rx: Mutex::new(rx_a),
        link_open: link_open.clone(),
        peer_inbound: count_b.clone(),
        inbound: count_a.clone(),
    });
    let b = Arc::new(MockDataChannel {
        tx: tx_b,
        rx: Mutex::new(rx_b),
        link_open,
        peer_inbound: count_a,
        inbound: count_b,
    });
    (a, b)
}

impl MockDataChannel {
    /// Total binary messages delivered toward this end.
    pub fn queued_messages(&self) -> u64 {
        self.inbound.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    async fn send(&self, data: Bytes) -> Result<(), ShareError> {
        if !*self.link_open.borrow() {
            return Err(ShareError::DataChannelError(
                "mock channel closed".to_string(),
            ));
        }
        self.peer_inbound.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(data)
            .await
            .map_err(|_| ShareError::DataChannelError("mock channel closed".to_string()))
    }

    async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        let mut open_rx = self.link_open.subscribe();
        tokio::select! {
            biased;
            data = rx.recv() => data,
            _ = open_rx.wait_for(|open| !*open) => {
                // Closed: drain anything already queued before reporting end.
                rx.try_recv().ok()
            }
        }
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    fn is_open(&self) -> bool {
        *self.link_open.borrow()
    }

    async fn close(&self) {
        self.link_open.send_replace(false);
    }
}

/// Peer connector over a pre-paired mock data channel
pub struct MockConnector {
    channel: Arc<MockDataChannel>,
    opened: watch::Sender<bool>,
}

/// Build the two connectors of a session. Offer/answer exchange is
/// simulated; the channel "opens" once descriptions have been applied.
pub fn mock_connector_pair() -> (Arc<MockConnector>, Arc<MockConnector>) {
    let (chan_a, chan_b) = mock_data_channel_pair();
    let (opened_a, _) = watch::channel(false);
    let (opened_b, _) = watch::channel(false);
    (
        Arc::new(MockConnector {
            channel: chan_a,
            opened: opened_a,
        }),
        Arc::new(MockConnector {
            channel: chan_b,
            opened: opened_b,
        }),
    )
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn create_offer(&self) -> Result<String, ShareError> {
        Ok("mock-offer-sdp".to_string())
    }

    async fn accept_offer(&self, _offer_sdp: &str) -> Result<String, ShareError> {
        self.opened.send_replace(true);
        Ok("mock-answer-sdp".to_string())
    }

    async fn apply_answer(&self, _answer_sdp: &str) -> Result<(), ShareError> {
        self.opened.send_replace(true);
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: CandidateInit) -> Result<(), ShareError> {
        Ok(())
    }

    async fn wait_channel(
        &self,
        timeout: Duration,
    ) -> Result<Arc<dyn DataChannel>, ShareError> {
        let mut opened_rx = self.opened.subscribe();
        tokio::time::timeout(timeout, opened_rx.wait_for(|open| *open))
            .await
            .map_err(|_| {
                ShareError::NegotiationFailed("timed out waiting for data channel".to_string())
            })?
            .map_err(|_| ShareError::NegotiationFailed("connector dropped".to_string()))?;
        Ok(self.channel.clone() as Arc<dyn DataChannel>)
    }

    async fn close(&self) {
        self.channel.close().await;
        self.opened.send_replace(false);
    }
}

/// Canned session API for tests
pub struct MockSessionApi {
    descriptor: SessionDescriptor,
    join_failures: Mutex<HashMap<String, ShareError>>,
    joins: AtomicU64,
}

impl MockSessionApi {
    pub fn with_code(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            descriptor: SessionDescriptor {
                code: code.clone(),
                session_id: format!("mock-session-{code}"),
                signaling_url: "mock://signaling".to_string(),
                auth_token: None,
                ice_servers: Vec::new(),
                created_at: None,
                expires_at: None,
            },
            join_failures: Mutex::new(HashMap::new()),
            joins: AtomicU64::new(0),
        }
    }

    /// Make joining with `code` fail with the given error.
    pub async fn fail_join(&self, code: impl Into<String>, err: ShareError) {
        self.join_failures.lock().await.insert(code.into(), err);
    }

    pub fn join_attempts(&self) -> u64 {
        self.joins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionApi for MockSessionApi {
    async fn create_session(
        &self,
        _req: &CreateSessionRequest,
    ) -> Result<SessionDescriptor, ShareError> {
        Ok(self.descriptor.clone())
    }

    async fn join_session(&self, code: &str) -> Result<SessionDescriptor, ShareError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.join_failures.lock().await.get(code) {
            return Err(err.clone());
        }
        if code == self.descriptor.code {
            Ok(self.descriptor.clone())
        } else {
            Err(ShareError::SessionNotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_routes_between_endpoints_but_not_back() {
        let hub = MockSignalingHub::new();
        let a = hub.transport();
        let b = hub.transport();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.send(&SignalingMessage::TransferCompleted).await.unwrap();
        // b first sees the join announcement about a, then a's message,
        // and never anything b sent itself.
        let first = tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, SignalingMessage::PeerConnected { .. }));
        let second = tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, SignalingMessage::TransferCompleted);
    }

    #[tokio::test]
    async fn second_join_announces_peer() {
        let hub = MockSignalingHub::new();
        let a = hub.transport();
        let b = hub.transport();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), a.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(got, SignalingMessage::PeerConnected { .. }));
    }

    #[tokio::test]
    async fn data_channel_pair_is_ordered_and_closes_together() {
        let (a, b) = mock_data_channel_pair();
        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"two"));

        a.close().await;
        assert!(!b.is_open());
        assert!(b.recv().await.is_none());
        assert!(a.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn connector_pair_opens_after_exchange() {
        let (sender, receiver) = mock_connector_pair();
        let offer = sender.create_offer().await.unwrap();
        let answer = receiver.accept_offer(&offer).await.unwrap();
        sender.apply_answer(&answer).await.unwrap();

        let dc_s = sender.wait_channel(Duration::from_secs(1)).await.unwrap();
        let dc_r = receiver.wait_channel(Duration::from_secs(1)).await.unwrap();
        dc_s.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(dc_r.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }
}
