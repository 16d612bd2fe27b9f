//! End-to-end session tests over the in-process mock stack
//!
//! Both roles run as real sessions; only the network seams (relay socket,
//! WebRTC connector) are mocked.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use droplink::mock::{
    mock_connector_pair, MockConnector, MockSessionApi, MockSignalingHub,
};
use droplink::session::{ConnectorFactory, DynConnector, DynTransport, TransportFactory};
use droplink::{
    FileMetadata, MemorySink, ReceiverSession, SendFile, SenderSession, SessionEvent, ShareConfig,
    ShareError, SignalingTransport,
};

const CODE: &str = "123456";

fn transport_factory(hub: MockSignalingHub) -> TransportFactory {
    Box::new(move |_| Arc::new(hub.transport()) as DynTransport)
}

fn connector_factory(connector: Arc<MockConnector>) -> ConnectorFactory {
    let slot = Mutex::new(Some(connector));
    Box::new(move |_, _candidate_tx| {
        let taken = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        Box::pin(async move {
            taken
                .map(|c| c as DynConnector)
                .ok_or_else(|| ShareError::NegotiationFailed("connector already used".to_string()))
        })
    })
}

fn slow_connector_factory(connector: Arc<MockConnector>, delay: Duration) -> ConnectorFactory {
    let slot = Mutex::new(Some(connector));
    Box::new(move |_, _candidate_tx| {
        let taken = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            taken
                .map(|c| c as DynConnector)
                .ok_or_else(|| ShareError::NegotiationFailed("connector already used".to_string()))
        })
    })
}

fn fast_config() -> ShareConfig {
    ShareConfig {
        ack_timeout: Duration::from_secs(5),
        session_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

struct Pair {
    sender: SenderSession,
    sender_events: tokio::sync::mpsc::Receiver<SessionEvent>,
    receiver: ReceiverSession,
    #[allow(dead_code)]
    receiver_events: tokio::sync::mpsc::Receiver<SessionEvent>,
}

fn session_pair() -> Pair {
    let hub = MockSignalingHub::new();
    let api = Arc::new(MockSessionApi::with_code(CODE));
    let (sender_conn, receiver_conn) = mock_connector_pair();
    let (sender, sender_events) = SenderSession::new(
        api.clone(),
        transport_factory(hub.clone()),
        connector_factory(sender_conn),
        fast_config(),
    );
    let (receiver, receiver_events) = ReceiverSession::new(
        api,
        transport_factory(hub),
        connector_factory(receiver_conn),
        fast_config(),
    );
    Pair {
        sender,
        sender_events,
        receiver,
        receiver_events,
    }
}

type Received = Arc<Mutex<Vec<(Bytes, FileMetadata)>>>;

fn collecting_receiver(
    session: ReceiverSession,
) -> (Received, tokio::task::JoinHandle<Result<usize, ShareError>>) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink_log = received.clone();
    let handle = tokio::spawn(async move {
        session
            .run(
                CODE,
                |meta| MemorySink::new(meta.size),
                move |bytes, meta| {
                    sink_log
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((bytes, meta.clone()));
                },
            )
            .await
    });
    (received, handle)
}

#[tokio::test]
async fn single_file_round_trip_is_byte_identical() {
    let pair = session_pair();
    let payload: Vec<u8> = (0..40960u32).map(|i| (i % 251) as u8).collect();
    let file = SendFile::from_bytes("photo.bin", Some("application/octet-stream".into()), payload.clone());

    let (received, receiver_task) = collecting_receiver(pair.receiver);
    let sender = pair.sender;
    let sender_task = tokio::spawn(async move { sender.run(vec![file]).await });

    sender_task.await.unwrap().unwrap();
    let files = receiver_task.await.unwrap().unwrap();
    assert_eq!(files, 1);

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (bytes, meta) = &received[0];
    assert_eq!(meta.name, "photo.bin");
    assert_eq!(meta.size, 40960);
    assert_eq!(&bytes[..], &payload[..]);
}

#[tokio::test]
async fn code_ready_is_the_first_sender_event() {
    let mut pair = session_pair();
    let (_, receiver_task) = collecting_receiver(pair.receiver);
    let sender = pair.sender;
    let sender_task = tokio::spawn(async move {
        sender
            .run(vec![SendFile::from_bytes("a.txt", None, b"hi".to_vec())])
            .await
    });

    let first = pair.sender_events.recv().await.unwrap();
    match first {
        SessionEvent::CodeReady { code, .. } => assert_eq!(code, CODE),
        other => panic!("expected CodeReady first, got {other:?}"),
    }

    sender_task.await.unwrap().unwrap();
    receiver_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn zero_byte_file_completes_without_chunks() {
    let pair = session_pair();
    let file = SendFile::from_bytes("empty.txt", Some("text/plain".into()), Vec::new());

    let (received, receiver_task) = collecting_receiver(pair.receiver);
    let sender = pair.sender;
    let sender_task = tokio::spawn(async move { sender.run(vec![file]).await });

    sender_task.await.unwrap().unwrap();
    assert_eq!(receiver_task.await.unwrap().unwrap(), 1);

    let received = received.lock().unwrap();
    assert_eq!(received[0].0.len(), 0);
    assert_eq!(received[0].1.size, 0);
}

#[tokio::test]
async fn batch_preserves_order_and_progress_is_monotonic() {
    let mut pair = session_pair();
    let first = SendFile::from_bytes("first.bin", None, vec![1u8; 10 * 1024]);
    let second = SendFile::from_bytes("second.bin", None, vec![2u8; 1024]);

    let (received, receiver_task) = collecting_receiver(pair.receiver);
    let sender = pair.sender;
    let sender_task = tokio::spawn(async move { sender.run(vec![first, second]).await });

    sender_task.await.unwrap().unwrap();
    assert_eq!(receiver_task.await.unwrap().unwrap(), 2);

    // Arrival order equals send order.
    let received = received.lock().unwrap();
    assert_eq!(received[0].1.name, "first.bin");
    assert_eq!(received[1].1.name, "second.bin");

    // Batch progress never decreases across the file boundary, and the
    // first file completes (file percent 100) while the batch is still
    // partial.
    let mut batch_percents = Vec::new();
    let mut saw_file_boundary = false;
    while let Ok(event) = pair.sender_events.try_recv() {
        if let SessionEvent::FileProgress { index, file, batch } = event {
            batch_percents.push(batch.percent);
            if index == 0 && file.percent == 100.0 && batch.percent < 100.0 {
                saw_file_boundary = true;
            }
        }
    }
    assert!(saw_file_boundary);
    assert!(batch_percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*batch_percents.last().unwrap(), 100.0);
}

#[tokio::test]
async fn slow_receiver_setup_does_not_lose_the_offer() {
    // Connector setup on the receiver (ICE server lookups, peer connection
    // construction) can take a while; the sender's offer fires the moment
    // the receiver appears on the relay and must not fall into a window
    // with nobody subscribed to it.
    let hub = MockSignalingHub::new();
    let api = Arc::new(MockSessionApi::with_code(CODE));
    let (sender_conn, receiver_conn) = mock_connector_pair();
    let (sender, _sender_events) = SenderSession::new(
        api.clone(),
        transport_factory(hub.clone()),
        connector_factory(sender_conn),
        fast_config(),
    );
    let (receiver, _receiver_events) = ReceiverSession::new(
        api,
        transport_factory(hub),
        slow_connector_factory(receiver_conn, Duration::from_millis(500)),
        fast_config(),
    );

    let payload = vec![9u8; 1024];
    let file = SendFile::from_bytes("slow.bin", None, payload.clone());
    let (received, receiver_task) = collecting_receiver(receiver);
    let sender_task = tokio::spawn(async move { sender.run(vec![file]).await });

    sender_task.await.unwrap().unwrap();
    assert_eq!(receiver_task.await.unwrap().unwrap(), 1);
    let received = received.lock().unwrap();
    assert_eq!(&received[0].0[..], &payload[..]);
}

#[tokio::test]
async fn expired_code_fails_before_negotiation() {
    let hub = MockSignalingHub::new();
    let api = Arc::new(MockSessionApi::with_code(CODE));
    api.fail_join("999111", ShareError::SessionExpired).await;

    let negotiation_attempted = Arc::new(AtomicBool::new(false));
    let flag = negotiation_attempted.clone();
    let connectors: ConnectorFactory = Box::new(move |_, _| {
        flag.store(true, Ordering::SeqCst);
        Box::pin(async move {
            Err(ShareError::NegotiationFailed(
                "should not get here".to_string(),
            ))
        })
    });

    let (receiver, _events) =
        ReceiverSession::new(api.clone(), transport_factory(hub), connectors, fast_config());
    let err = receiver
        .run("999111", |m| MemorySink::new(m.size), |_, _| {})
        .await
        .unwrap_err();

    assert_eq!(err, ShareError::SessionExpired);
    assert_eq!(api.join_attempts(), 1);
    assert!(!negotiation_attempted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unknown_code_is_not_found() {
    let hub = MockSignalingHub::new();
    let api = Arc::new(MockSessionApi::with_code(CODE));
    let (_sender_conn, receiver_conn) = mock_connector_pair();
    let (receiver, _events) = ReceiverSession::new(
        api,
        transport_factory(hub),
        connector_factory(receiver_conn),
        fast_config(),
    );
    let err = receiver
        .run("000000", |m| MemorySink::new(m.size), |_, _| {})
        .await
        .unwrap_err();
    assert_eq!(err, ShareError::SessionNotFound);
}

#[tokio::test]
async fn sender_fails_when_peer_disconnects_during_negotiation() {
    let hub = MockSignalingHub::new();
    let api = Arc::new(MockSessionApi::with_code(CODE));
    // The counterpart connector never answers, so negotiation would hang
    // without the disconnect notification.
    let (sender_conn, _receiver_conn) = mock_connector_pair();
    let (sender, _events) = SenderSession::new(
        api,
        transport_factory(hub.clone()),
        connector_factory(sender_conn),
        fast_config(),
    );

    let ghost = hub.transport();
    let sender_task = tokio::spawn(async move {
        sender
            .run(vec![SendFile::from_bytes("a.bin", None, vec![0u8; 1024])])
            .await
    });

    // Join so the sender proceeds past AwaitingPeer, then vanish.
    tokio::time::sleep(Duration::from_millis(100)).await;
    ghost.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    ghost.disconnect().await;

    let err = sender_task.await.unwrap().unwrap_err();
    assert!(matches!(err, ShareError::DataChannelError(_)));
}
