//! Peer connection negotiator
//!
//! Drives one WebRTC negotiation over the signaling channel: the sender
//! creates the data channel and the offer, the receiver answers, and ICE
//! candidates trickle both ways interleaved with the description exchange.
//! Negotiation failure is terminal for the session; there is no retry.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::ShareError;
use crate::signaling::{HandlerId, SignalingChannel};
use crate::transport::{DataChannel, PeerConnector, SignalingTransport};
use crate::types::{CandidateInit, MessageKind, NegotiationState, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unset,
    Sender,
    Receiver,
}

/// Negotiates one peer connection and one data channel
pub struct PeerNegotiator<T: SignalingTransport + 'static, C: PeerConnector + 'static> {
    channel: Arc<SignalingChannel<T>>,
    connector: Arc<C>,
    state_tx: watch::Sender<NegotiationState>,
    failure_tx: watch::Sender<Option<String>>,
    handler_ids: Mutex<Vec<HandlerId>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    role_tx: watch::Sender<Role>,
}

impl<T: SignalingTransport + 'static, C: PeerConnector + 'static> PeerNegotiator<T, C> {
    /// Wire the negotiator to the signaling channel. `candidate_rx` carries
    /// locally gathered ICE candidates out of the connector; they are
    /// forwarded to the counterpart as `ice_candidate` messages.
    pub async fn new(
        channel: Arc<SignalingChannel<T>>,
        connector: C,
        mut candidate_rx: mpsc::Receiver<CandidateInit>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(NegotiationState::New);
        let (failure_tx, _) = watch::channel(None);
        let (role_tx, _) = watch::channel(Role::Unset);
        let negotiator = Arc::new(Self {
            channel: channel.clone(),
            connector: Arc::new(connector),
            state_tx,
            failure_tx,
            handler_ids: Mutex::new(Vec::new()),
            driver: Mutex::new(None),
            role_tx,
        });

        // Pump local candidates out. Errors here are non-fatal: candidates
        // generated during teardown have nowhere to go.
        let out_channel = channel.clone();
        tokio::spawn(async move {
            while let Some(candidate) = candidate_rx.recv().await {
                if let Err(e) = out_channel
                    .send(&SignalingMessage::ice_candidate(candidate))
                    .await
                {
                    debug!(error = %e, "could not forward local candidate");
                }
            }
        });

        // Inbound negotiation messages are serialized through one driver
        // task so offer/answer/candidate handling never interleaves.
        let (msg_tx, msg_rx) = mpsc::channel::<SignalingMessage>(64);
        {
            let mut ids = negotiator.handler_ids.lock().await;
            for kind in [
                MessageKind::Offer,
                MessageKind::Answer,
                MessageKind::IceCandidate,
            ] {
                ids.push(channel.forward(kind, msg_tx.clone()).await);
            }
        }
        let driver = tokio::spawn(Self::drive(negotiator.clone(), msg_rx));
        *negotiator.driver.lock().await = Some(driver);

        negotiator
    }

    /// Sender role: create the data channel, produce the offer, send it.
    ///
    /// Call only once the counterpart is known to be present.
    pub async fn initialize_as_sender(&self) -> Result<(), ShareError> {
        self.role_tx.send_replace(Role::Sender);
        let sdp = self.connector.create_offer().await?;
        self.state_tx.send_replace(NegotiationState::HaveLocalOffer);
        self.channel.send(&SignalingMessage::Offer { sdp }).await
    }

    /// Receiver role: wait for the remote offer and inbound data channel.
    pub fn initialize_as_receiver(&self) {
        self.role_tx.send_replace(Role::Receiver);
    }

    pub fn state(&self) -> NegotiationState {
        *self.state_tx.borrow()
    }

    /// Resolve once the data channel is open, or fail terminally.
    pub async fn wait_for_channel(
        &self,
        timeout: Duration,
    ) -> Result<Arc<dyn DataChannel>, ShareError> {
        let mut failure_rx = self.failure_tx.subscribe();
        let result = tokio::select! {
            r = self.connector.wait_channel(timeout) => r,
            reason = async move {
                let _ = failure_rx.wait_for(|f| f.is_some()).await;
                failure_rx.borrow().clone().unwrap_or_default()
            } => Err(ShareError::NegotiationFailed(reason)),
        };
        match &result {
            Ok(_) => {
                self.state_tx.send_replace(NegotiationState::Connected);
            }
            Err(_) => {
                self.state_tx.send_replace(NegotiationState::Failed);
            }
        }
        result
    }

    /// Unsubscribe from signaling and close the peer connection.
    pub async fn close(&self) {
        for id in self.handler_ids.lock().await.drain(..) {
            self.channel.off(id).await;
        }
        if let Some(driver) = self.driver.lock().await.take() {
            driver.abort();
        }
        self.connector.close().await;
        self.state_tx.send_replace(NegotiationState::Closed);
    }

    async fn drive(self: Arc<Self>, mut msg_rx: mpsc::Receiver<SignalingMessage>) {
        while let Some(msg) = msg_rx.recv().await {
            if let Err(e) = self.handle(msg).await {
                warn!(error = %e, "negotiation failed");
                self.failure_tx.send_replace(Some(e.to_string()));
                self.state_tx.send_replace(NegotiationState::Failed);
                return;
            }
        }
    }

    async fn handle(&self, msg: SignalingMessage) -> Result<(), ShareError> {
        match msg {
            SignalingMessage::Offer { sdp } => {
                if *self.role_tx.borrow() == Role::Sender {
                    warn!("ignoring offer received in sender role");
                    return Ok(());
                }
                // A late joiner initializes as receiver on first offer.
                self.role_tx.send_replace(Role::Receiver);
                self.state_tx.send_replace(NegotiationState::HaveRemoteOffer);
                let answer = self.connector.accept_offer(&sdp).await?;
                self.channel
                    .send(&SignalingMessage::Answer { sdp: answer })
                    .await
            }
            SignalingMessage::Answer { sdp } => {
                if *self.role_tx.borrow() != Role::Sender {
                    warn!("ignoring answer received in non-sender role");
                    return Ok(());
                }
                self.connector.apply_answer(&sdp).await
            }
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.connector
                    .add_remote_candidate(CandidateInit {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                    })
                    .await
            }
            other => {
                debug!(kind = ?other.kind(), "negotiator ignoring message");
                Ok(())
            }
        }
    }
}
