//! Chunked transfer protocol
//!
//! Streams one artifact at a time over the open data channel. Metadata and
//! acknowledgments travel over signaling; the data channel carries nothing
//! but raw 16 KiB chunks. Because the channel is reliable and ordered,
//! arrival order equals send order and no per-chunk sequencing is needed.
//!
//! Sender side: announce via `transfer_started`, stream chunks in order,
//! send `transfer_completed`, wait for the outgoing buffer to drain, then
//! wait (bounded) for the receiver's `receive_completed` ack.
//!
//! Receiver side: on `transfer_started` reset state for the new file, write
//! every chunk to the sink in arrival order, and finish exactly when the
//! received byte count reaches the declared size.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::ShareError;
use crate::signaling::{HandlerId, SignalingChannel};
use crate::transport::{DataChannel, SignalingTransport};
use crate::types::{
    FileMetadata, MessageKind, SendFile, ShareConfig, SignalingMessage, TransferProgress,
};

/// Where a single transfer currently is, reported to the phase callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Announcing,
    Streaming,
    Draining,
    AwaitingAck,
    Complete,
}

/// Number of data-channel messages a file of `size` bytes produces.
pub(crate) fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    if size == 0 {
        0
    } else {
        (size + chunk_size as u64 - 1) / chunk_size as u64
    }
}

/// Destination for received file bytes
///
/// Chunks are written in arrival order; `finish` runs once the declared
/// size has been reached and yields the reconstructed artifact.
#[async_trait]
pub trait TransferSink: Send {
    type Output: Send;

    async fn write(&mut self, chunk: Bytes) -> Result<(), ShareError>;

    async fn finish(&mut self) -> Result<Self::Output, ShareError>;
}

/// In-memory sink, preallocated to the declared size
pub struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new(declared_size: u64) -> Self {
        Self {
            buf: Vec::with_capacity(declared_size as usize),
        }
    }
}

#[async_trait]
impl TransferSink for MemorySink {
    type Output = Bytes;

    async fn write(&mut self, chunk: Bytes) -> Result<(), ShareError> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<Bytes, ShareError> {
        Ok(std::mem::take(&mut self.buf).into())
    }
}

/// Sink that streams chunks straight to disk, keeping memory use flat
/// regardless of file size
pub struct FileSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl FileSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, ShareError> {
        let path = path.into();
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ShareError::DataChannelError(format!("sink create: {e}")))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }
}

#[async_trait]
impl TransferSink for FileSink {
    type Output = PathBuf;

    async fn write(&mut self, chunk: Bytes) -> Result<(), ShareError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ShareError::DataChannelError("sink already finished".to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| ShareError::DataChannelError(format!("sink write: {e}")))
    }

    async fn finish(&mut self) -> Result<PathBuf, ShareError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| ShareError::DataChannelError(format!("sink flush: {e}")))?;
        }
        Ok(self.path.clone())
    }
}

/// Sender half of the transfer protocol
///
/// Owns the per-file send loop; one instance serves every file in a batch,
/// strictly sequentially.
pub struct FileTransfer<T: SignalingTransport + 'static> {
    channel: Arc<SignalingChannel<T>>,
    data: Arc<dyn DataChannel>,
    config: ShareConfig,
    ack_rx: Mutex<mpsc::Receiver<SignalingMessage>>,
    ack_handler: HandlerId,
}

impl<T: SignalingTransport + 'static> FileTransfer<T> {
    pub async fn new(
        channel: Arc<SignalingChannel<T>>,
        data: Arc<dyn DataChannel>,
        config: ShareConfig,
    ) -> Self {
        let (ack_tx, ack_rx) = mpsc::channel(8);
        let ack_handler = channel.forward(MessageKind::ReceiveCompleted, ack_tx).await;
        Self {
            channel,
            data,
            config,
            ack_rx: Mutex::new(ack_rx),
            ack_handler,
        }
    }

    /// Send one file. Resolves after the receiver acknowledges full
    /// receipt, or after the bounded ack timeout elapses.
    ///
    /// Must never be called while another `send_file` is in flight on the
    /// same channel.
    pub async fn send_file(
        &self,
        file: &SendFile,
        mut on_progress: impl FnMut(TransferProgress),
        mut on_phase: impl FnMut(TransferPhase),
    ) -> Result<(), ShareError> {
        let mut ack_rx = self.ack_rx.lock().await;
        // Discard any stale ack left over from a previous file.
        while ack_rx.try_recv().is_ok() {}

        let meta = &file.metadata;
        on_phase(TransferPhase::Announcing);
        self.channel
            .send(&SignalingMessage::TransferStarted {
                file_name: meta.name.clone(),
                file_size: meta.size,
                file_type: meta.mime_type.clone(),
            })
            .await?;

        on_phase(TransferPhase::Streaming);
        let mut sent: u64 = 0;
        let total = meta.size;
        debug!(
            file = %meta.name,
            size = total,
            chunks = chunk_count(total, self.config.chunk_size),
            "streaming"
        );
        if total == 0 {
            // Zero-byte files transmit no chunks and complete instantly.
            on_progress(TransferProgress::new(0, 0));
        } else {
            let mut offset = 0usize;
            while offset < file.content.len() {
                let end = (offset + self.config.chunk_size).min(file.content.len());
                let chunk = file.content.slice(offset..end);
                let len = chunk.len() as u64;
                self.data.send(chunk).await?;
                offset = end;
                sent += len;

                let progress = TransferProgress::new(sent, total);
                on_progress(progress);
                // Secondary, best-effort progress channel; the receiver's
                // own byte count stays authoritative.
                if let Err(e) = self
                    .channel
                    .send(&SignalingMessage::TransferProgress {
                        percent: progress.percent,
                        bytes_transferred: progress.bytes_transferred,
                    })
                    .await
                {
                    debug!(error = %e, "progress message not delivered");
                }
            }
        }

        self.channel.send(&SignalingMessage::TransferCompleted).await?;

        // The final chunk may still sit in the local queue; declaring
        // completion before drain would corrupt the handshake timing.
        on_phase(TransferPhase::Draining);
        loop {
            if self.data.buffered_amount().await == 0 {
                break;
            }
            if !self.data.is_open() {
                return Err(ShareError::DataChannelError(
                    "channel closed while draining".to_string(),
                ));
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        on_phase(TransferPhase::AwaitingAck);
        match tokio::time::timeout(self.config.ack_timeout, ack_rx.recv()).await {
            Ok(Some(_)) => {
                debug!(file = %meta.name, "receive acknowledged");
            }
            Ok(None) | Err(_) => {
                // Lossy fallback: resolve anyway rather than hang forever.
                warn!(
                    file = %meta.name,
                    timeout = ?self.config.ack_timeout,
                    "no receive acknowledgment, resolving without it"
                );
            }
        }

        on_phase(TransferPhase::Complete);
        info!(file = %meta.name, size = meta.size, "file sent");
        Ok(())
    }

    /// Unsubscribe the ack handler.
    pub async fn shutdown(&self) {
        self.channel.off(self.ack_handler).await;
    }
}

struct Incoming<S: TransferSink> {
    meta: FileMetadata,
    sink: S,
    received: u64,
}

/// Receiver half of the transfer protocol
///
/// Construct it before negotiation finishes so no control message can slip
/// past, then call [`FileReceiver::run`] with the open data channel.
pub struct FileReceiver<T: SignalingTransport + 'static> {
    channel: Arc<SignalingChannel<T>>,
    control_rx: Mutex<mpsc::Receiver<SignalingMessage>>,
    handler_ids: Vec<HandlerId>,
}

impl<T: SignalingTransport + 'static> FileReceiver<T> {
    pub async fn new(channel: Arc<SignalingChannel<T>>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(64);
        let mut handler_ids = Vec::new();
        for kind in [
            MessageKind::TransferStarted,
            MessageKind::BatchComplete,
            MessageKind::TransferFailed,
            MessageKind::PeerDisconnected,
            MessageKind::Error,
        ] {
            handler_ids.push(channel.forward(kind, control_tx.clone()).await);
        }
        Self {
            channel,
            control_rx: Mutex::new(control_rx),
            handler_ids,
        }
    }

    /// Receive files until the sender signals `batch_complete`. Returns the
    /// number of files received.
    ///
    /// `make_sink` is called once per announced file; `on_file` once per
    /// reconstructed artifact, in send order.
    pub async fn run<S, F, G>(
        &self,
        data: Arc<dyn DataChannel>,
        mut make_sink: F,
        mut on_file: G,
    ) -> Result<usize, ShareError>
    where
        S: TransferSink,
        F: FnMut(&FileMetadata) -> S,
        G: FnMut(S::Output, &FileMetadata),
    {
        let mut control_rx = self.control_rx.lock().await;
        let mut current: Option<Incoming<S>> = None;
        // Chunks that raced ahead of their transfer_started announcement;
        // control and data ride different paths, so this can happen.
        let mut early_chunks: Vec<Bytes> = Vec::new();
        let mut files_done = 0usize;
        let mut data_closed = false;

        loop {
            tokio::select! {
                // Control first: an announcement must take effect before the
                // chunks that follow it.
                biased;
                ctrl = control_rx.recv() => match ctrl {
                    Some(SignalingMessage::TransferStarted { file_name, file_size, file_type }) => {
                        // New announcement resets receive state entirely;
                        // nothing carries over from the previous file.
                        let meta = FileMetadata {
                            name: file_name,
                            size: file_size,
                            mime_type: file_type,
                        };
                        info!(file = %meta.name, size = meta.size, "incoming file");
                        let sink = make_sink(&meta);
                        current = Some(Incoming { meta, sink, received: 0 });
                        // Zero-byte files are complete with no chunks at all.
                        if file_size == 0 {
                            let mut inc = current.take().ok_or_else(|| {
                                ShareError::DataChannelError("receive state lost".to_string())
                            })?;
                            files_done += 1;
                            self.finalize(&mut inc, &mut on_file).await?;
                        }
                        for bytes in std::mem::take(&mut early_chunks) {
                            match current.as_mut() {
                                Some(inc) => {
                                    if Self::ingest(inc, bytes).await? {
                                        let mut inc = current.take().ok_or_else(|| {
                                            ShareError::DataChannelError(
                                                "receive state lost".to_string(),
                                            )
                                        })?;
                                        files_done += 1;
                                        self.finalize(&mut inc, &mut on_file).await?;
                                    }
                                }
                                // Already complete; keep for the next file.
                                None => early_chunks.push(bytes),
                            }
                        }
                    }
                    Some(SignalingMessage::BatchComplete) => {
                        info!(files = files_done, "batch complete");
                        return Ok(files_done);
                    }
                    Some(SignalingMessage::TransferFailed { error }) => {
                        return Err(ShareError::DataChannelError(format!(
                            "sender reported failure: {error}"
                        )));
                    }
                    // The sender leaving before batch_complete means the
                    // batch will never finish; fail now rather than sit on
                    // the session deadline. A completed batch never reaches
                    // here since batch_complete precedes the disconnect.
                    Some(SignalingMessage::PeerDisconnected { .. }) => {
                        return Err(ShareError::DataChannelError(
                            "peer disconnected before batch completed".to_string(),
                        ));
                    }
                    Some(SignalingMessage::Error { message }) => {
                        return Err(ShareError::SignalingUnreachable(message));
                    }
                    Some(other) => {
                        debug!(kind = ?other.kind(), "receiver ignoring message");
                    }
                    None => {
                        return Err(ShareError::SignalingUnreachable(
                            "signaling closed before batch completed".to_string(),
                        ));
                    }
                },
                chunk = data.recv(), if !data_closed => match chunk {
                    Some(bytes) => {
                        let Some(inc) = current.as_mut() else {
                            debug!(len = bytes.len(), "chunk ahead of announcement, buffering");
                            early_chunks.push(bytes);
                            continue;
                        };
                        if Self::ingest(inc, bytes).await? {
                            let mut inc = current.take().ok_or_else(|| {
                                ShareError::DataChannelError("receive state lost".to_string())
                            })?;
                            files_done += 1;
                            self.finalize(&mut inc, &mut on_file).await?;
                        }
                    }
                    None => {
                        // Mid-file close is a failure; between files it is
                        // teardown noise while we wait for batch_complete.
                        if current.is_some() {
                            return Err(ShareError::DataChannelError(
                                "data channel closed mid-transfer".to_string(),
                            ));
                        }
                        data_closed = true;
                    }
                },
            }
        }
    }

    /// Append one chunk; true once the declared size has been reached.
    /// Exact equality is the expected case; `>=` guards a boundary race.
    async fn ingest<S: TransferSink>(
        inc: &mut Incoming<S>,
        bytes: Bytes,
    ) -> Result<bool, ShareError> {
        inc.received += bytes.len() as u64;
        inc.sink.write(bytes).await?;
        Ok(inc.received >= inc.meta.size)
    }

    async fn finalize<S, G>(&self, inc: &mut Incoming<S>, on_file: &mut G) -> Result<(), ShareError>
    where
        S: TransferSink,
        G: FnMut(S::Output, &FileMetadata),
    {
        let output = inc.sink.finish().await?;
        // The artifact reaches its owner before the sender hears about it;
        // the ack must never precede local delivery.
        on_file(output, &inc.meta);
        // If this ack is lost the sender falls back to its bounded timeout.
        if let Err(e) = self.channel.send(&SignalingMessage::ReceiveCompleted).await {
            warn!(error = %e, "could not acknowledge receipt");
        }
        info!(file = %inc.meta.name, size = inc.meta.size, "file received");
        Ok(())
    }

    /// Unsubscribe control handlers.
    pub async fn shutdown(&self) {
        for id in &self.handler_ids {
            self.channel.off(*id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{mock_data_channel_pair, MockSignalingHub};
    use crate::types::ChannelState;
    use std::time::Duration;

    #[test]
    fn chunk_count_math() {
        assert_eq!(chunk_count(0, 16384), 0);
        assert_eq!(chunk_count(1, 16384), 1);
        assert_eq!(chunk_count(16384, 16384), 1);
        assert_eq!(chunk_count(16385, 16384), 2);
        assert_eq!(chunk_count(40960, 16384), 3);
    }

    #[tokio::test]
    async fn memory_sink_reassembles_in_order() {
        let mut sink = MemorySink::new(6);
        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        sink.write(Bytes::from_static(b"def")).await.unwrap();
        let out = sink.finish().await.unwrap();
        assert_eq!(&out[..], b"abcdef");
    }

    #[tokio::test]
    async fn file_sink_writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut sink = FileSink::create(&path).await.unwrap();
        sink.write(Bytes::from(vec![7u8; 100])).await.unwrap();
        let got = sink.finish().await.unwrap();
        assert_eq!(got, path);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![7u8; 100]);
    }

    async fn open_pair() -> (
        Arc<SignalingChannel<crate::mock::MockSignalingTransport>>,
        Arc<SignalingChannel<crate::mock::MockSignalingTransport>>,
    ) {
        let hub = MockSignalingHub::new();
        let a = Arc::new(SignalingChannel::new(hub.transport(), &ShareConfig::default()));
        let b = Arc::new(SignalingChannel::new(hub.transport(), &ShareConfig::default()));
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        assert_eq!(a.state(), ChannelState::Open);
        (a, b)
    }

    #[tokio::test]
    async fn send_resolves_without_ack_after_timeout() {
        let (sender_sig, _receiver_sig) = open_pair().await;
        let (local, _remote) = mock_data_channel_pair();
        let config = ShareConfig {
            ack_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let transfer = FileTransfer::new(sender_sig, local, config).await;
        let file = SendFile::from_bytes("a.bin", None, vec![1u8; 100]);
        // Nobody acks; the bounded fallback must still resolve Ok.
        transfer.send_file(&file, |_| {}, |_| {}).await.unwrap();
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_100() {
        let (sender_sig, _receiver_sig) = open_pair().await;
        let (local, remote) = mock_data_channel_pair();
        let config = ShareConfig {
            ack_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let transfer = FileTransfer::new(sender_sig, local, config).await;
        let file = SendFile::from_bytes("a.bin", None, vec![1u8; 40960]);

        let mut seen = Vec::new();
        transfer
            .send_file(&file, |p| seen.push(p.percent), |_| {})
            .await
            .unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100.0);
        // 40 KiB at 16 KiB chunking is exactly three messages.
        assert_eq!(remote.queued_messages(), 3);
    }

    #[tokio::test]
    async fn receiver_errors_on_mid_file_close() {
        let (sender_sig, receiver_sig) = open_pair().await;
        let (local, remote) = mock_data_channel_pair();
        let receiver = FileReceiver::new(receiver_sig).await;

        sender_sig
            .send(&SignalingMessage::TransferStarted {
                file_name: "big.bin".into(),
                file_size: 100_000,
                file_type: None,
            })
            .await
            .unwrap();
        local.send(Bytes::from(vec![0u8; 16384])).await.unwrap();

        let run = tokio::spawn(async move {
            receiver
                .run(remote, |m| MemorySink::new(m.size), |_, _| {})
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        local.close().await;
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ShareError::DataChannelError(_)));
    }

    #[tokio::test]
    async fn receiver_errors_when_peer_leaves_between_files() {
        let (sender_sig, receiver_sig) = open_pair().await;
        let (local, remote) = mock_data_channel_pair();
        let receiver = FileReceiver::new(receiver_sig).await;

        // One complete file, then the sender vanishes without ever sending
        // batch_complete. The loop must fail promptly, not sit on the
        // session deadline.
        sender_sig
            .send(&SignalingMessage::TransferStarted {
                file_name: "a.bin".into(),
                file_size: 100,
                file_type: None,
            })
            .await
            .unwrap();
        local.send(Bytes::from(vec![0u8; 100])).await.unwrap();

        let run = tokio::spawn(async move {
            receiver
                .run(remote, |m| MemorySink::new(m.size), |_, _| {})
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender_sig.disconnect().await;
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ShareError::DataChannelError(_)));
    }

    struct ScriptedTransport {
        script: Mutex<Vec<SignalingMessage>>,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SignalingTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), ShareError> {
            Ok(())
        }

        async fn send(&self, msg: &SignalingMessage) -> Result<(), ShareError> {
            self.log.lock().unwrap().push(format!("sent {:?}", msg.kind()));
            Ok(())
        }

        async fn recv(&self) -> Option<SignalingMessage> {
            let next = self.script.lock().await.pop();
            match next {
                Some(msg) => Some(msg),
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&self) {}
    }

    #[tokio::test]
    async fn artifact_is_delivered_before_the_ack() {
        let log: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let transport = ScriptedTransport {
            script: Mutex::new(vec![SignalingMessage::TransferStarted {
                file_name: "a.bin".into(),
                file_size: 3,
                file_type: None,
            }]),
            log: log.clone(),
        };
        let channel = Arc::new(SignalingChannel::new(transport, &ShareConfig::default()));
        let receiver = FileReceiver::new(channel.clone()).await;
        channel.connect().await.unwrap();

        let (local, remote) = mock_data_channel_pair();
        local.send(Bytes::from_static(b"abc")).await.unwrap();

        let run_log = log.clone();
        let run = tokio::spawn(async move {
            receiver
                .run(
                    remote,
                    |m| MemorySink::new(m.size),
                    move |_, _| {
                        run_log.lock().unwrap().push("delivered".to_string());
                    },
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        run.abort();

        // Both entries come from the same task in finalize, so this order
        // is exact, not a scheduling accident.
        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["delivered", "sent ReceiveCompleted"]);
    }
}
