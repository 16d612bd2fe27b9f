//! Transport abstractions
//!
//! Traits for the signaling socket, the data channel, and peer connection
//! setup, so the protocol logic runs identically over real WebRTC and over
//! in-process mocks.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ShareError;
use crate::types::{CandidateInit, SignalingMessage};

/// Underlying duplex socket for signaling messages
///
/// `connect` may be called again after the stream ends; the reconnect
/// policy lives above this trait in [`crate::signaling::SignalingChannel`].
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the socket. Resolves only once it is actually open.
    async fn connect(&self) -> Result<(), ShareError>;

    /// Send one message. Fails if the socket is not open.
    async fn send(&self, msg: &SignalingMessage) -> Result<(), ShareError>;

    /// Receive the next message. `None` means the socket closed.
    async fn recv(&self) -> Option<SignalingMessage>;

    /// Close the socket.
    async fn disconnect(&self);
}

/// The ordered, reliable binary channel file bytes travel over
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one binary message (one chunk).
    async fn send(&self, data: Bytes) -> Result<(), ShareError>;

    /// Receive the next binary message. `None` means the channel closed.
    async fn recv(&self) -> Option<Bytes>;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// One WebRTC peer connection's negotiation surface
///
/// Locally gathered ICE candidates are pushed out through the candidate
/// sender given to the concrete implementation at construction time; this
/// trait only covers the inbound direction.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Sender role: create the data channel and produce the local offer SDP.
    async fn create_offer(&self) -> Result<String, ShareError>;

    /// Receiver role: apply the remote offer and produce the local answer SDP.
    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, ShareError>;

    /// Sender role: apply the remote answer.
    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), ShareError>;

    /// Apply a remote ICE candidate. Candidates arriving before the remote
    /// description must be queued, not discarded.
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), ShareError>;

    /// Resolve once the single data channel is open, or fail when the
    /// connection goes terminal or the timeout elapses.
    async fn wait_channel(&self, timeout: Duration) -> Result<Arc<dyn DataChannel>, ShareError>;

    /// Close the data channel, then the peer connection.
    async fn close(&self);
}

// Blanket implementations so Arc-wrapped transports satisfy the traits.

#[async_trait]
impl<T: SignalingTransport + ?Sized> SignalingTransport for Arc<T> {
    async fn connect(&self) -> Result<(), ShareError> {
        (**self).connect().await
    }

    async fn send(&self, msg: &SignalingMessage) -> Result<(), ShareError> {
        (**self).send(msg).await
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        (**self).recv().await
    }

    async fn disconnect(&self) {
        (**self).disconnect().await
    }
}

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    async fn send(&self, data: Bytes) -> Result<(), ShareError> {
        (**self).send(data).await
    }

    async fn recv(&self) -> Option<Bytes> {
        (**self).recv().await
    }

    async fn buffered_amount(&self) -> usize {
        (**self).buffered_amount().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: PeerConnector + ?Sized> PeerConnector for Arc<T> {
    async fn create_offer(&self) -> Result<String, ShareError> {
        (**self).create_offer().await
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, ShareError> {
        (**self).accept_offer(offer_sdp).await
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), ShareError> {
        (**self).apply_answer(answer_sdp).await
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), ShareError> {
        (**self).add_remote_candidate(candidate).await
    }

    async fn wait_channel(&self, timeout: Duration) -> Result<Arc<dyn DataChannel>, ShareError> {
        (**self).wait_channel(timeout).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
