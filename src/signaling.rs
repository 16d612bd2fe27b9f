//! Signaling channel
//!
//! A reconnecting control-message pipe between the two session parties.
//! Payload bytes never travel here. Handlers are registered per message
//! kind; all handlers for a kind run on every matching inbound message.
//!
//! After an unexpected close the channel reconnects with a linearly
//! increasing delay (base * attempt), up to a fixed attempt cap. A call to
//! `disconnect()` disables reconnection permanently for this instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ShareError;
use crate::transport::SignalingTransport;
use crate::types::{ChannelState, MessageKind, ShareConfig, SignalingMessage};

/// Callback invoked for each inbound message of a subscribed kind
pub type Handler = Arc<dyn Fn(&SignalingMessage) + Send + Sync>;

/// Token returned by [`SignalingChannel::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    kind: MessageKind,
    seq: u64,
}

type HandlerMap = HashMap<MessageKind, Vec<(u64, Handler)>>;

/// Linear backoff: delay = base * attempt number.
pub(crate) fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt
}

/// Control-message pipe over a [`SignalingTransport`]
pub struct SignalingChannel<T: SignalingTransport + 'static> {
    transport: Arc<T>,
    handlers: Arc<RwLock<HandlerMap>>,
    next_seq: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
    reconnect_enabled: Arc<AtomicBool>,
    reconnect_base_delay: Duration,
    max_reconnect_attempts: u32,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: SignalingTransport + 'static> SignalingChannel<T> {
    pub fn new(transport: T, config: &ShareConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            transport: Arc::new(transport),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
            state_tx,
            reconnect_enabled: Arc::new(AtomicBool::new(true)),
            reconnect_base_delay: config.reconnect_base_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
            dispatch_task: Mutex::new(None),
        }
    }

    /// Open the underlying socket and start dispatching inbound messages.
    ///
    /// Resolves only once the socket is actually open.
    pub async fn connect(&self) -> Result<(), ShareError> {
        if *self.state_tx.borrow() == ChannelState::Open {
            return Ok(());
        }
        self.state_tx.send_replace(ChannelState::Connecting);
        if let Err(e) = self.transport.connect().await {
            self.state_tx.send_replace(ChannelState::Disconnected);
            return Err(e);
        }
        self.state_tx.send_replace(ChannelState::Open);
        info!("signaling channel open");

        let transport = self.transport.clone();
        let handlers = self.handlers.clone();
        let state_tx = self.state_tx.clone();
        let reconnect_enabled = self.reconnect_enabled.clone();
        let base_delay = self.reconnect_base_delay;
        let max_attempts = self.max_reconnect_attempts;
        let task = tokio::spawn(async move {
            run_dispatch(
                transport,
                handlers,
                state_tx,
                reconnect_enabled,
                base_delay,
                max_attempts,
            )
            .await;
        });
        *self.dispatch_task.lock().await = Some(task);
        Ok(())
    }

    /// Send a control message.
    ///
    /// Fails fast with a visible error when the channel is not open, so a
    /// dropped message is never silent.
    pub async fn send(&self, msg: &SignalingMessage) -> Result<(), ShareError> {
        if *self.state_tx.borrow() != ChannelState::Open {
            return Err(ShareError::SignalingUnreachable(
                "channel is not open".to_string(),
            ));
        }
        self.transport.send(msg).await
    }

    /// Subscribe a handler for one message kind.
    pub async fn on(&self, kind: MessageKind, handler: Handler) -> HandlerId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write().await;
        handlers.entry(kind).or_default().push((seq, handler));
        HandlerId { kind, seq }
    }

    /// Remove a previously registered handler. Unknown ids are a no-op.
    pub async fn off(&self, id: HandlerId) {
        let mut handlers = self.handlers.write().await;
        if let Some(list) = handlers.get_mut(&id.kind) {
            list.retain(|(seq, _)| *seq != id.seq);
        }
    }

    /// Subscribe a forwarding handler that clones matching messages into
    /// an mpsc sender. Messages are dropped if the receiver lags.
    pub async fn forward(&self, kind: MessageKind, tx: mpsc::Sender<SignalingMessage>) -> HandlerId {
        self.on(
            kind,
            Arc::new(move |msg| {
                if tx.try_send(msg.clone()).is_err() {
                    warn!(?kind, "forward queue full, dropping signaling message");
                }
            }),
        )
        .await
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Close the socket and permanently disable reconnection.
    pub async fn disconnect(&self) {
        self.reconnect_enabled.store(false, Ordering::SeqCst);
        self.transport.disconnect().await;
        self.state_tx.send_replace(ChannelState::Closed);
        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
        }
    }
}

async fn run_dispatch<T: SignalingTransport>(
    transport: Arc<T>,
    handlers: Arc<RwLock<HandlerMap>>,
    state_tx: watch::Sender<ChannelState>,
    reconnect_enabled: Arc<AtomicBool>,
    base_delay: Duration,
    max_attempts: u32,
) {
    'connected: loop {
        while let Some(msg) = transport.recv().await {
            dispatch(&handlers, &msg).await;
        }

        // Socket ended. Either we were told to stop, or we retry.
        if !reconnect_enabled.load(Ordering::SeqCst) {
            state_tx.send_replace(ChannelState::Closed);
            return;
        }
        state_tx.send_replace(ChannelState::Closed);
        warn!("signaling socket closed unexpectedly, reconnecting");

        let mut attempt: u32 = 1;
        loop {
            if attempt > max_attempts {
                warn!(max_attempts, "reconnect attempts exhausted, giving up");
                state_tx.send_replace(ChannelState::Closed);
                return;
            }
            state_tx.send_replace(ChannelState::Connecting);
            tokio::time::sleep(reconnect_delay(base_delay, attempt)).await;
            if !reconnect_enabled.load(Ordering::SeqCst) {
                state_tx.send_replace(ChannelState::Closed);
                return;
            }
            match transport.connect().await {
                Ok(()) => {
                    info!(attempt, "signaling channel reconnected");
                    state_tx.send_replace(ChannelState::Open);
                    continue 'connected;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }
}

async fn dispatch(handlers: &RwLock<HandlerMap>, msg: &SignalingMessage) {
    let to_run: Vec<Handler> = {
        let map = handlers.read().await;
        match map.get(&msg.kind()) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => Vec::new(),
        }
    };
    for handler in to_run {
        handler(msg);
    }
}
