//! droplink: peer-to-peer file transfer engine
//!
//! Two parties discover each other through a short numeric code and a
//! signaling relay, negotiate a direct WebRTC connection, and stream files
//! over one ordered reliable data channel. The relay routes control
//! messages only; file bytes never touch it.
//!
//! Layers, leaves first:
//! - [`signaling`]: reconnecting control-message pipe over a relay socket
//! - [`negotiator`]: offer/answer/ICE exchange producing one data channel
//! - [`transfer`]: chunked file streaming with progress and a completion
//!   handshake
//! - [`session`]: orchestrates a whole sharing session for either role
//!
//! The [`mock`] module provides in-process implementations of every
//! transport seam, so complete sessions run in tests without a network.

pub mod api;
pub mod error;
pub mod mock;
pub mod negotiator;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;
pub mod types;
pub mod webrtc;
pub mod ws;

pub use api::{CreateSessionRequest, HttpSessionApi, SessionApi};
pub use error::ShareError;
pub use negotiator::PeerNegotiator;
pub use session::{
    websocket_transport_factory, webrtc_connector_factory, ConnectorFactory, ReceiverSession,
    SenderSession, SessionEvent, TransportFactory,
};
pub use signaling::SignalingChannel;
pub use transfer::{FileReceiver, FileSink, FileTransfer, MemorySink, TransferPhase, TransferSink};
pub use transport::{DataChannel, PeerConnector, SignalingTransport};
pub use types::{
    ChannelState, FileMetadata, IceServer, NegotiationState, SendFile, SessionDescriptor,
    SessionState, ShareConfig, SignalingMessage, TransferProgress, CHUNK_SIZE,
};
