//! WebRTC peer connector
//!
//! Real [`PeerConnector`] and [`DataChannel`] implementations on top of
//! webrtc-rs. One peer connection, one ordered reliable data channel per
//! session. ICE candidates trickle: locally gathered ones are pushed into
//! the candidate sender, remote ones arriving before the remote description
//! are queued and applied afterwards.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::ShareError;
use crate::transport::{DataChannel, PeerConnector};
use crate::types::{CandidateInit, IceServer, DATA_CHANNEL_LABEL};

enum ChannelEvent {
    Data(Bytes),
    Closed,
}

/// [`DataChannel`] wrapper around an [`RTCDataChannel`]
///
/// Inbound binary messages are pumped from the on_message callback into an
/// internal queue so callers get a plain async `recv`.
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    rx: Mutex<mpsc::Receiver<ChannelEvent>>,
    open: AtomicBool,
}

impl RtcDataChannel {
    /// Attach handlers to an existing channel and wrap it. `ready` flips to
    /// true when the channel opens (or is already open).
    pub async fn attach(dc: Arc<RTCDataChannel>, ready: watch::Sender<bool>) -> Arc<Self> {
        let already_open = dc.ready_state() == RTCDataChannelState::Open;
        let (tx, rx) = mpsc::channel(256);
        let wrapped = Arc::new(Self {
            dc: dc.clone(),
            rx: Mutex::new(rx),
            open: AtomicBool::new(already_open),
        });

        let data_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let data_tx = data_tx.clone();
            Box::pin(async move {
                if msg.is_string {
                    warn!("ignoring string message on binary data channel");
                    return;
                }
                if data_tx.send(ChannelEvent::Data(msg.data)).await.is_err() {
                    debug!("data channel reader gone, dropping message");
                }
            })
        }));

        let open_flag = wrapped.clone();
        let open_ready = ready.clone();
        dc.on_open(Box::new(move || {
            open_flag.open.store(true, Ordering::SeqCst);
            open_ready.send_replace(true);
            Box::pin(async move {})
        }));
        if already_open {
            ready.send_replace(true);
        }

        let close_tx = tx.clone();
        let close_flag = wrapped.clone();
        dc.on_close(Box::new(move || {
            close_flag.open.store(false, Ordering::SeqCst);
            let close_tx = close_tx.clone();
            Box::pin(async move {
                let _ = close_tx.send(ChannelEvent::Closed).await;
            })
        }));

        let error_tx = tx;
        dc.on_error(Box::new(move |err| {
            let error_tx = error_tx.clone();
            Box::pin(async move {
                warn!(error = %err, "data channel error");
                let _ = error_tx.send(ChannelEvent::Closed).await;
            })
        }));

        wrapped
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    async fn send(&self, data: Bytes) -> Result<(), ShareError> {
        if !self.is_open() {
            return Err(ShareError::DataChannelError(
                "channel is not open".to_string(),
            ));
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| ShareError::DataChannelError(format!("send: {e}")))
    }

    async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(ChannelEvent::Data(data)) => Some(data),
            Some(ChannelEvent::Closed) | None => None,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Err(e) = self.dc.close().await {
            debug!(error = %e, "data channel close");
        }
    }
}

/// Real WebRTC [`PeerConnector`]
pub struct RtcPeerConnector {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RtcDataChannel>>>>,
    channel_ready: watch::Sender<bool>,
    // Candidates received before the remote description is set.
    pending_candidates: Mutex<Vec<CandidateInit>>,
    remote_description_set: AtomicBool,
    failure: watch::Sender<Option<String>>,
}

impl RtcPeerConnector {
    /// Build a peer connection against the given ICE servers. Locally
    /// gathered candidates are pushed into `candidate_tx`.
    pub async fn new(
        ice_servers: &[IceServer],
        candidate_tx: mpsc::Sender<CandidateInit>,
    ) -> Result<Arc<Self>, ShareError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| ShareError::NegotiationFailed(format!("media engine: {e}")))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .map_err(|e| ShareError::NegotiationFailed(format!("interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| ShareError::NegotiationFailed(format!("peer connection: {e}")))?,
        );

        let (channel_ready, _) = watch::channel(false);
        let (failure, _) = watch::channel(None);
        let connector = Arc::new(Self {
            pc: pc.clone(),
            channel: Arc::new(Mutex::new(None)),
            channel_ready,
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            failure,
        });

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else { return };
                match c.to_json() {
                    Ok(init) => {
                        let out = CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        if candidate_tx.send(out).await.is_err() {
                            debug!("candidate receiver gone, dropping local candidate");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize local candidate"),
                }
            })
        }));

        let failure_tx = connector.failure.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let failure_tx = failure_tx.clone();
            Box::pin(async move {
                info!(?state, "peer connection state");
                if state == RTCPeerConnectionState::Failed {
                    failure_tx.send_replace(Some("no usable ICE path".to_string()));
                }
            })
        }));

        Ok(connector)
    }

    async fn install_channel(&self, dc: Arc<RTCDataChannel>) {
        let wrapped = RtcDataChannel::attach(dc, self.channel_ready.clone()).await;
        *self.channel.lock().await = Some(wrapped);
    }

    async fn flush_pending_candidates(&self) -> Result<(), ShareError> {
        self.remote_description_set.store(true, Ordering::SeqCst);
        let pending: Vec<CandidateInit> = self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pending {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: CandidateInit) -> Result<(), ShareError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("add candidate: {e}")))
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn create_offer(&self) -> Result<String, ShareError> {
        // Ordered and reliable: arrival order is the only sequencing the
        // transfer protocol has.
        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(dc_init))
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("create channel: {e}")))?;
        self.install_channel(dc).await;

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("create offer: {e}")))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("set local offer: {e}")))?;
        Ok(sdp)
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, ShareError> {
        // Arm the inbound channel listener before applying the remote
        // description, so the channel event cannot be missed.
        let channel_holder = self.channel.clone();
        let ready = self.channel_ready.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel_holder = channel_holder.clone();
                let ready = ready.clone();
                Box::pin(async move {
                    info!(label = dc.label(), "received data channel");
                    let wrapped = RtcDataChannel::attach(dc, ready).await;
                    *channel_holder.lock().await = Some(wrapped);
                })
            }));

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| ShareError::NegotiationFailed(format!("parse offer: {e}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("set remote offer: {e}")))?;
        self.flush_pending_candidates().await?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("create answer: {e}")))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("set local answer: {e}")))?;
        Ok(sdp)
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), ShareError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| ShareError::NegotiationFailed(format!("parse answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| ShareError::NegotiationFailed(format!("set remote answer: {e}")))?;
        self.flush_pending_candidates().await
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), ShareError> {
        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().await.push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await
    }

    async fn wait_channel(&self, timeout: Duration) -> Result<Arc<dyn DataChannel>, ShareError> {
        let mut ready_rx = self.channel_ready.subscribe();
        let mut failure_rx = self.failure.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            if *ready_rx.borrow() {
                let guard = self.channel.lock().await;
                if let Some(channel) = guard.as_ref() {
                    return Ok(channel.clone() as Arc<dyn DataChannel>);
                }
                drop(guard);
                // Ready flipped before the wrapper was stored; re-poll shortly.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(10)) => continue,
                    _ = &mut deadline => {
                        return Err(ShareError::NegotiationFailed(
                            "timed out waiting for data channel".to_string(),
                        ));
                    }
                }
            }
            if let Some(reason) = failure_rx.borrow().clone() {
                return Err(ShareError::NegotiationFailed(reason));
            }
            tokio::select! {
                changed = ready_rx.changed() => {
                    if changed.is_err() {
                        return Err(ShareError::NegotiationFailed(
                            "connection dropped while waiting for channel".to_string(),
                        ));
                    }
                }
                _ = failure_rx.changed() => {}
                _ = &mut deadline => {
                    return Err(ShareError::NegotiationFailed(
                        "timed out waiting for data channel".to_string(),
                    ));
                }
            }
        }
    }

    async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
        }
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}
