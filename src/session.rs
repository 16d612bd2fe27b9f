//! Session orchestrator
//!
//! Owns the end-to-end lifecycle of one sharing session for either role:
//! session API handshake, signaling channel, negotiation, then the file
//! batch in strict sequence, with a whole-session deadline and idempotent
//! teardown.
//!
//! Sessions are single-use: construct one per share, call `run` once.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::api::{CreateSessionRequest, SessionApi};
use crate::error::ShareError;
use crate::negotiator::PeerNegotiator;
use crate::signaling::SignalingChannel;
use crate::transfer::{FileReceiver, FileTransfer, TransferPhase, TransferSink};
use crate::transport::{DataChannel, PeerConnector, SignalingTransport};
use crate::types::{
    CandidateInit, FileMetadata, MessageKind, SendFile, SessionDescriptor, SessionState,
    ShareConfig, SignalingMessage, TransferProgress,
};

pub type DynTransport = Arc<dyn SignalingTransport>;
pub type DynConnector = Arc<dyn PeerConnector>;

/// Builds the signaling transport for a session descriptor
pub type TransportFactory = Box<dyn Fn(&SessionDescriptor) -> DynTransport + Send + Sync>;

/// Builds the peer connector; locally gathered ICE candidates go into the
/// provided sender
pub type ConnectorFactory = Box<
    dyn Fn(
            &SessionDescriptor,
            mpsc::Sender<CandidateInit>,
        ) -> BoxFuture<'static, Result<DynConnector, ShareError>>
        + Send
        + Sync,
>;

/// Factory for the production WebSocket signaling transport.
pub fn websocket_transport_factory() -> TransportFactory {
    Box::new(|descriptor| {
        Arc::new(crate::ws::WebSocketTransport::new(
            descriptor.signaling_url.clone(),
            descriptor.auth_token.clone(),
        )) as DynTransport
    })
}

/// Factory for the production WebRTC peer connector.
pub fn webrtc_connector_factory() -> ConnectorFactory {
    Box::new(|descriptor, candidate_tx| {
        let ice_servers = descriptor.ice_servers.clone();
        Box::pin(async move {
            crate::webrtc::RtcPeerConnector::new(&ice_servers, candidate_tx)
                .await
                .map(|c| c as DynConnector)
        })
    })
}

/// Milestones surfaced to the caller while a session runs
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The share code is ready for humans. Sender only, always first.
    CodeReady {
        code: String,
        expires_at: Option<String>,
    },
    PeerJoined,
    ChannelOpen,
    FileProgress {
        index: usize,
        file: TransferProgress,
        /// Monotonic across the whole batch, never reset per file.
        batch: TransferProgress,
    },
    FileSent {
        index: usize,
    },
    FileReceived {
        index: usize,
        metadata: FileMetadata,
    },
    Completed {
        files: usize,
    },
    Failed {
        error: ShareError,
    },
}

/// Idempotent teardown of a session's live resources
///
/// Data channel first, then peer connection, then signaling. Safe to call
/// from several places (peer-disconnect handler, deadline, normal exit);
/// only the first call does anything.
pub(crate) struct Teardown {
    done: AtomicBool,
    channel: Mutex<Option<Arc<SignalingChannel<DynTransport>>>>,
    connector: Mutex<Option<DynConnector>>,
    data: Mutex<Option<Arc<dyn DataChannel>>>,
}

impl Teardown {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            channel: Mutex::new(None),
            connector: Mutex::new(None),
            data: Mutex::new(None),
        })
    }

    async fn set_channel(&self, channel: Arc<SignalingChannel<DynTransport>>) {
        *self.channel.lock().await = Some(channel);
    }

    async fn set_connector(&self, connector: DynConnector) {
        *self.connector.lock().await = Some(connector);
    }

    async fn set_data(&self, data: Arc<dyn DataChannel>) {
        *self.data.lock().await = Some(data);
    }

    pub(crate) async fn cleanup(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(data) = self.data.lock().await.take() {
            data.close().await;
        }
        if let Some(connector) = self.connector.lock().await.take() {
            connector.close().await;
        }
        if let Some(channel) = self.channel.lock().await.take() {
            channel.disconnect().await;
        }
        info!("session torn down");
    }
}

fn emit(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if events.try_send(event).is_err() {
        warn!("session event queue full, dropping event");
    }
}

/// Sender side of one sharing session
pub struct SenderSession {
    api: Arc<dyn SessionApi>,
    transports: TransportFactory,
    connectors: ConnectorFactory,
    config: ShareConfig,
    events_tx: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    teardown: Arc<Teardown>,
}

impl SenderSession {
    pub fn new(
        api: Arc<dyn SessionApi>,
        transports: TransportFactory,
        connectors: ConnectorFactory,
        config: ShareConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        (
            Self {
                api,
                transports,
                connectors,
                config,
                events_tx,
                state_tx,
                teardown: Teardown::new(),
            },
            events_rx,
        )
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Drive the whole sender flow: mint a code, wait for the counterpart,
    /// negotiate, then send every file in order and signal batch completion.
    pub async fn run(&self, files: Vec<SendFile>) -> Result<(), ShareError> {
        let result = match tokio::time::timeout(self.config.session_timeout, self.run_inner(&files))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(ShareError::TransferTimeout(
                "session deadline exceeded".to_string(),
            )),
        };
        self.teardown.cleanup().await;
        match &result {
            Ok(()) => {
                self.state_tx.send_replace(SessionState::Complete);
                emit(&self.events_tx, SessionEvent::Completed { files: files.len() });
            }
            Err(error) => {
                self.state_tx.send_replace(SessionState::Failed);
                emit(
                    &self.events_tx,
                    SessionEvent::Failed {
                        error: error.clone(),
                    },
                );
            }
        }
        result
    }

    async fn run_inner(&self, files: &[SendFile]) -> Result<(), ShareError> {
        let descriptor = self
            .api
            .create_session(&CreateSessionRequest::default())
            .await?;
        emit(
            &self.events_tx,
            SessionEvent::CodeReady {
                code: descriptor.code.clone(),
                expires_at: descriptor.expires_at.clone(),
            },
        );

        let transport = (self.transports)(&descriptor);
        let channel = Arc::new(SignalingChannel::new(transport, &self.config));

        // Subscriptions go in before connect so no early message is missed.
        let (peer_tx, mut peer_rx) = mpsc::channel(4);
        channel.forward(MessageKind::PeerConnected, peer_tx).await;
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ShareError>(4);
        {
            let fatal = fatal_tx.clone();
            channel
                .on(
                    MessageKind::PeerDisconnected,
                    Arc::new(move |_| {
                        let _ = fatal.try_send(ShareError::DataChannelError(
                            "peer disconnected".to_string(),
                        ));
                    }),
                )
                .await;
            let fatal = fatal_tx;
            channel
                .on(
                    MessageKind::Error,
                    Arc::new(move |msg| {
                        if let SignalingMessage::Error { message } = msg {
                            let _ =
                                fatal.try_send(ShareError::SignalingUnreachable(message.clone()));
                        }
                    }),
                )
                .await;
        }
        channel.connect().await?;
        self.teardown.set_channel(channel.clone()).await;

        self.state_tx.send_replace(SessionState::AwaitingPeer);
        tokio::select! {
            joined = peer_rx.recv() => {
                if joined.is_none() {
                    return Err(ShareError::SignalingUnreachable(
                        "signaling closed while waiting for peer".to_string(),
                    ));
                }
            }
            Some(error) = fatal_rx.recv() => return Err(error),
        }
        emit(&self.events_tx, SessionEvent::PeerJoined);

        // Negotiation starts only now that the counterpart is present.
        self.state_tx.send_replace(SessionState::Negotiating);
        let (candidate_tx, candidate_rx) = mpsc::channel(64);
        let connector = (self.connectors)(&descriptor, candidate_tx).await?;
        self.teardown.set_connector(connector.clone()).await;
        let negotiator = PeerNegotiator::new(channel.clone(), connector, candidate_rx).await;
        negotiator.initialize_as_sender().await?;
        let data = tokio::select! {
            r = negotiator.wait_for_channel(self.config.session_timeout) => r?,
            Some(error) = fatal_rx.recv() => return Err(error),
        };
        self.teardown.set_data(data.clone()).await;
        emit(&self.events_tx, SessionEvent::ChannelOpen);

        let transfer = FileTransfer::new(channel.clone(), data, self.config.clone()).await;
        let total: u64 = files.iter().map(|f| f.metadata.size).sum();
        let mut completed: u64 = 0;
        for (index, file) in files.iter().enumerate() {
            self.state_tx
                .send_replace(SessionState::TransferringFile(index));
            let events = self.events_tx.clone();
            let state = self.state_tx.clone();
            let send = transfer.send_file(
                file,
                |progress| {
                    let batch =
                        TransferProgress::new(completed + progress.bytes_transferred, total);
                    emit(
                        &events,
                        SessionEvent::FileProgress {
                            index,
                            file: progress,
                            batch,
                        },
                    );
                },
                |phase| {
                    if phase == TransferPhase::AwaitingAck {
                        state.send_replace(SessionState::AwaitingAck);
                    }
                },
            );
            tokio::select! {
                r = send => r?,
                Some(error) = fatal_rx.recv() => return Err(error),
            }
            completed += file.metadata.size;
            emit(&self.events_tx, SessionEvent::FileSent { index });
        }

        // Distinct from the per-file ack: the batch is done.
        channel.send(&SignalingMessage::BatchComplete).await?;
        transfer.shutdown().await;
        negotiator.close().await;
        Ok(())
    }
}

/// Receiver side of one sharing session
pub struct ReceiverSession {
    api: Arc<dyn SessionApi>,
    transports: TransportFactory,
    connectors: ConnectorFactory,
    config: ShareConfig,
    events_tx: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    teardown: Arc<Teardown>,
}

impl ReceiverSession {
    pub fn new(
        api: Arc<dyn SessionApi>,
        transports: TransportFactory,
        connectors: ConnectorFactory,
        config: ShareConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        (
            Self {
                api,
                transports,
                connectors,
                config,
                events_tx,
                state_tx,
                teardown: Teardown::new(),
            },
            events_rx,
        )
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Redeem the code and receive the whole batch. `make_sink` is called
    /// once per announced file, `on_file` once per reconstructed artifact,
    /// in send order. Returns the number of files received.
    pub async fn run<S, F, G>(
        &self,
        code: &str,
        make_sink: F,
        on_file: G,
    ) -> Result<usize, ShareError>
    where
        S: TransferSink,
        F: FnMut(&FileMetadata) -> S,
        G: FnMut(S::Output, &FileMetadata),
    {
        let result = match tokio::time::timeout(
            self.config.session_timeout,
            self.run_inner(code, make_sink, on_file),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(ShareError::TransferTimeout(
                "session deadline exceeded".to_string(),
            )),
        };
        self.teardown.cleanup().await;
        match &result {
            Ok(files) => {
                self.state_tx.send_replace(SessionState::Complete);
                emit(&self.events_tx, SessionEvent::Completed { files: *files });
            }
            Err(error) => {
                self.state_tx.send_replace(SessionState::Failed);
                emit(
                    &self.events_tx,
                    SessionEvent::Failed {
                        error: error.clone(),
                    },
                );
            }
        }
        result
    }

    async fn run_inner<S, F, G>(
        &self,
        code: &str,
        make_sink: F,
        mut on_file: G,
    ) -> Result<usize, ShareError>
    where
        S: TransferSink,
        F: FnMut(&FileMetadata) -> S,
        G: FnMut(S::Output, &FileMetadata),
    {
        // Invalid and expired codes fail here, before any WebRTC setup.
        let descriptor = self.api.join_session(code).await?;

        let transport = (self.transports)(&descriptor);
        let channel = Arc::new(SignalingChannel::new(transport, &self.config));
        // Control subscriptions precede connect so the first
        // transfer_started can never race past us.
        let receiver = FileReceiver::new(channel.clone()).await;
        {
            let teardown = self.teardown.clone();
            channel
                .on(
                    MessageKind::PeerDisconnected,
                    Arc::new(move |_| {
                        // Closing the data channel makes an in-flight
                        // receive fail; between files it is benign.
                        let teardown = teardown.clone();
                        tokio::spawn(async move {
                            teardown.cleanup().await;
                        });
                    }),
                )
                .await;
        }
        // The negotiator must exist before connect too: our joining the
        // relay is what prompts the sender's offer, which can arrive the
        // moment the socket opens.
        self.state_tx.send_replace(SessionState::Negotiating);
        let (candidate_tx, candidate_rx) = mpsc::channel(64);
        let connector = (self.connectors)(&descriptor, candidate_tx).await?;
        self.teardown.set_connector(connector.clone()).await;
        let negotiator = PeerNegotiator::new(channel.clone(), connector, candidate_rx).await;
        negotiator.initialize_as_receiver();

        channel.connect().await?;
        self.teardown.set_channel(channel.clone()).await;
        let data = negotiator
            .wait_for_channel(self.config.session_timeout)
            .await?;
        self.teardown.set_data(data.clone()).await;
        emit(&self.events_tx, SessionEvent::ChannelOpen);

        self.state_tx.send_replace(SessionState::TransferringFile(0));
        let events = self.events_tx.clone();
        let state = self.state_tx.clone();
        let mut index = 0usize;
        let files = receiver
            .run(data, make_sink, |output, metadata| {
                emit(
                    &events,
                    SessionEvent::FileReceived {
                        index,
                        metadata: metadata.clone(),
                    },
                );
                on_file(output, metadata);
                index += 1;
                state.send_replace(SessionState::TransferringFile(index));
            })
            .await?;

        receiver.shutdown().await;
        negotiator.close().await;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_data_channel_pair;

    #[tokio::test]
    async fn teardown_runs_once() {
        let teardown = Teardown::new();
        let (data, remote) = mock_data_channel_pair();
        teardown.set_data(data).await;
        teardown.cleanup().await;
        assert!(!remote.is_open());
        // Second call must be a no-op, not a panic or double close.
        teardown.cleanup().await;
    }
}
