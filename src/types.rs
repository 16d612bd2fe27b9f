//! Shared types and the signaling wire protocol
//!
//! Signaling messages are JSON objects discriminated by a `type` field.
//! File bytes never travel over signaling; they ride the data channel as
//! raw binary chunks with no extra framing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Fixed chunk size for data channel messages (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Label for the single data channel a session uses
pub const DATA_CHANNEL_LABEL: &str = "droplink";

/// How long the sender waits for a receive acknowledgment after drain
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a whole session, start to completion or failure
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Base delay for linear reconnect backoff (delay = base * attempt)
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Reconnection attempt cap before the channel goes terminally closed
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Poll interval while waiting for the outgoing buffer to drain
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tunable timeouts and sizes for a session
#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    pub session_timeout: Duration,
    pub drain_poll_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            ack_timeout: ACK_TIMEOUT,
            session_timeout: SESSION_TIMEOUT,
            drain_poll_interval: DRAIN_POLL_INTERVAL,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// STUN/TURN server entry handed out by the session API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Everything needed to participate in one session
///
/// Issued by the session API, immutable afterwards. The `code` is the one
/// field meant for humans; the rest wires the two parties together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub code: String,
    pub session_id: String,
    pub signaling_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// Per-file metadata, declared via `transfer_started` before any chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
}

/// A file queued for sending, bytes already in memory
#[derive(Debug, Clone)]
pub struct SendFile {
    pub metadata: FileMetadata,
    pub content: Bytes,
}

impl SendFile {
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: Option<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        let content = content.into();
        Self {
            metadata: FileMetadata {
                name: name.into(),
                size: content.len() as u64,
                mime_type,
            },
            content,
        }
    }

    /// Read a file from disk into a send queue entry.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::from_bytes(name, None, content))
    }
}

/// Progress snapshot, recomputed on every chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub percent: f64,
    pub bytes_transferred: u64,
}

impl TransferProgress {
    /// Zero-byte files jump straight to 100 so there is no division by zero.
    pub fn new(bytes_transferred: u64, total: u64) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            bytes_transferred as f64 / total as f64 * 100.0
        };
        Self {
            percent,
            bytes_transferred,
        }
    }
}

/// ICE candidate as carried over signaling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// The closed set of control messages exchanged over signaling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    TransferStarted {
        file_name: String,
        file_size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_type: Option<String>,
    },
    TransferProgress {
        percent: f64,
        bytes_transferred: u64,
    },
    TransferCompleted,
    /// Receiver's per-file acknowledgment: the artifact was reconstructed
    /// in full.
    ReceiveCompleted,
    /// Sender's batch-done signal, distinct from the per-file ack.
    BatchComplete,
    TransferFailed {
        error: String,
    },
    PeerConnected {
        client_id: String,
    },
    PeerDisconnected {
        client_id: String,
    },
    Error {
        message: String,
    },
}

/// Discriminant of [`SignalingMessage`], used as a handler registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    TransferStarted,
    TransferProgress,
    TransferCompleted,
    ReceiveCompleted,
    BatchComplete,
    TransferFailed,
    PeerConnected,
    PeerDisconnected,
    Error,
}

impl SignalingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::Offer { .. } => MessageKind::Offer,
            SignalingMessage::Answer { .. } => MessageKind::Answer,
            SignalingMessage::IceCandidate { .. } => MessageKind::IceCandidate,
            SignalingMessage::TransferStarted { .. } => MessageKind::TransferStarted,
            SignalingMessage::TransferProgress { .. } => MessageKind::TransferProgress,
            SignalingMessage::TransferCompleted => MessageKind::TransferCompleted,
            SignalingMessage::ReceiveCompleted => MessageKind::ReceiveCompleted,
            SignalingMessage::BatchComplete => MessageKind::BatchComplete,
            SignalingMessage::TransferFailed { .. } => MessageKind::TransferFailed,
            SignalingMessage::PeerConnected { .. } => MessageKind::PeerConnected,
            SignalingMessage::PeerDisconnected { .. } => MessageKind::PeerDisconnected,
            SignalingMessage::Error { .. } => MessageKind::Error,
        }
    }

    pub fn ice_candidate(init: CandidateInit) -> Self {
        SignalingMessage::IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

/// Connection state of the signaling channel
///
/// `Closed` goes back to `Connecting` only while reconnection is still
/// permitted; after `disconnect()` or the attempt cap it is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// Negotiation state for one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Closed,
    Failed,
}

/// Session-level state machine, one per sharing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingPeer,
    Negotiating,
    TransferringFile(usize),
    AwaitingAck,
    Complete,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_message_json_roundtrip() {
        let msgs = vec![
            SignalingMessage::Offer {
                sdp: "v=0...".to_string(),
            },
            SignalingMessage::IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
            SignalingMessage::TransferStarted {
                file_name: "photo.png".to_string(),
                file_size: 40960,
                file_type: Some("image/png".to_string()),
            },
            SignalingMessage::ReceiveCompleted,
            SignalingMessage::BatchComplete,
        ];
        for msg in msgs {
            let json = serde_json::to_string(&msg).unwrap();
            let back: SignalingMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn type_tag_is_snake_case() {
        let json = serde_json::to_string(&SignalingMessage::TransferCompleted).unwrap();
        assert_eq!(json, r#"{"type":"transfer_completed"}"#);

        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"peer_connected","client_id":"abc"}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::PeerConnected);
    }

    #[test]
    fn progress_handles_zero_size() {
        let p = TransferProgress::new(0, 0);
        assert_eq!(p.percent, 100.0);
        assert_eq!(p.bytes_transferred, 0);

        let p = TransferProgress::new(20480, 40960);
        assert_eq!(p.percent, 50.0);
    }

    #[test]
    fn send_file_from_bytes_records_size() {
        let f = SendFile::from_bytes("a.txt", Some("text/plain".into()), vec![1u8; 100]);
        assert_eq!(f.metadata.size, 100);
        assert_eq!(f.metadata.name, "a.txt");
    }
}
