//! Connection tests against an in-memory transport.

use super::*;
use crate::core::protocol::{FrameCodec, ProtocolEnvelope, RawFrame, WireMessage, paths};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

// =============================================================================
// Test transport
// =============================================================================

/// Server side of one in-memory socket.
struct Peer {
    from_client: mpsc::UnboundedReceiver<TransportFrame>,
    to_client: mpsc::UnboundedSender<Result<TransportFrame, TransportError>>,
}

struct MemoryTransport {
    statuses: Mutex<VecDeque<u16>>,
    peers: Mutex<Vec<Peer>>,
    opens: AtomicUsize,
    open_delay: Duration,
}

impl MemoryTransport {
    fn new(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            peers: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            open_delay: Duration::from_millis(20),
        })
    }

    fn take_peer(&self) -> Peer {
        self.peers.lock().remove(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _request: &TransportRequest) -> Result<TransportChannel, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.open_delay).await;

        let status = self.statuses.lock().pop_front().unwrap_or(HTTP_OK);
        if status != HTTP_OK {
            return Err(TransportError::Handshake {
                status_code: status,
                reason: "Forbidden".to_string(),
            });
        }

        let (client_tx, from_client) = mpsc::unbounded();
        let (to_client, client_rx) = mpsc::unbounded();
        self.peers.lock().push(Peer {
            from_client,
            to_client,
        });
        Ok(TransportChannel {
            sink: Box::pin(client_tx.sink_map_err(|e| TransportError::Io(e.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}

fn request() -> TransportRequest {
    TransportRequest {
        url: Url::parse(
            "wss://westus.stt.speech.microsoft.com/speech/recognition/interactive/cognitiveservices/v1",
        )
        .unwrap(),
        headers: vec![
            ("Ocp-Apim-Subscription-Key".to_string(), "key".to_string()),
            ("X-ConnectionId".to_string(), "CONN1".to_string()),
        ],
        connection_id: "CONN1".to_string(),
    }
}

fn service_message(path: &str) -> TransportFrame {
    let wire = ProtocolEnvelope::text(path, "REQ1", None, "{}").into_wire();
    TransportFrame::from(FrameCodec::encode(&wire).unwrap())
}

// =============================================================================
// Open
// =============================================================================

#[tokio::test]
async fn test_concurrent_open_shares_one_establish() {
    let transport = MemoryTransport::new(&[HTTP_OK]);
    let connection = Arc::new(Connection::new(transport.clone(), request()));

    let (first, second) = tokio::join!(connection.open(), connection.open());
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);

    // Repeated open while connected returns the cached outcome.
    assert!(connection.open().await.unwrap().is_success());
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_handshake_resolves_with_status() {
    let transport = MemoryTransport::new(&[403]);
    let connection = Connection::new(transport.clone(), request());

    let response = connection.open().await.unwrap();
    assert_eq!(response.status_code, 403);
    assert!(!response.is_success());
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // The failed connection is disconnected; no new attempt.
    assert!(matches!(connection.open().await, Err(ConnectionError::Closed(_))));
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_after_close_fails_fast() {
    let transport = MemoryTransport::new(&[]);
    let connection = Connection::new(transport.clone(), request());
    connection.close("not needed").await;

    assert!(matches!(
        connection.open().await,
        Err(ConnectionError::Closed(reason)) if reason == "not needed"
    ));
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reopen_after_established_close_fails_fast() {
    let transport = MemoryTransport::new(&[HTTP_OK]);
    let connection = Connection::new(transport.clone(), request());
    assert!(connection.open().await.unwrap().is_success());

    connection.close("done").await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    assert!(matches!(
        connection.open().await,
        Err(ConnectionError::Closed(reason)) if reason == "done"
    ));
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Send / receive
// =============================================================================

#[tokio::test]
async fn test_send_requires_connected_state() {
    let connection = Connection::new(MemoryTransport::new(&[]), request());
    let message = ProtocolEnvelope::binary(paths::AUDIO, "REQ1", vec![0u8; 4]).into_wire();

    assert_eq!(
        connection.send(message).await,
        Err(ConnectionError::NotConnected(ConnectionState::None))
    );
}

#[tokio::test]
async fn test_sends_are_written_in_order() {
    let transport = MemoryTransport::new(&[HTTP_OK]);
    let connection = Connection::new(transport.clone(), request());
    connection.open().await.unwrap();
    let mut peer = transport.take_peer();

    for index in 0u8..3 {
        let message = ProtocolEnvelope::binary(paths::AUDIO, "REQ1", vec![index; 10]).into_wire();
        connection.send(message).await.unwrap();
    }

    for index in 0u8..3 {
        let frame = peer.from_client.next().await.unwrap().into_raw().unwrap();
        let message = FrameCodec::decode(frame).unwrap();
        assert_eq!(message.path(), Some("audio"));
        assert_eq!(
            message.body(),
            &crate::core::protocol::MessageBody::Binary(vec![index; 10].into())
        );
    }
}

#[tokio::test]
async fn test_receive_delivers_in_arrival_order_and_skips_bad_frames() {
    let transport = MemoryTransport::new(&[HTTP_OK]);
    let connection = Connection::new(transport.clone(), request());
    connection.open().await.unwrap();
    let peer = transport.take_peer();

    peer.to_client.unbounded_send(Ok(service_message(paths::TURN_START))).unwrap();
    peer.to_client
        .unbounded_send(Ok(TransportFrame::Binary(vec![0u8].into())))
        .unwrap();
    peer.to_client.unbounded_send(Ok(service_message(paths::TURN_END))).unwrap();

    let first: WireMessage = connection.receive().await.unwrap();
    let second = connection.receive().await.unwrap();
    assert_eq!(first.path(), Some(paths::TURN_START));
    assert_eq!(second.path(), Some(paths::TURN_END));
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_peer_close_rejects_waiting_receive() {
    let transport = MemoryTransport::new(&[HTTP_OK]);
    let connection = Arc::new(Connection::new(transport.clone(), request()));
    connection.open().await.unwrap();
    let peer = transport.take_peer();

    let waiting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    peer.to_client
        .unbounded_send(Ok(TransportFrame::Close {
            code: 1007,
            reason: "bad payload".to_string(),
        }))
        .unwrap();

    assert_eq!(
        waiting.await.unwrap(),
        Err(ConnectionError::Closed("bad payload".to_string()))
    );
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(
        connection.close_status(),
        Some((1007, "bad payload".to_string()))
    );
}

#[tokio::test]
async fn test_close_sends_normal_closure() {
    let transport = MemoryTransport::new(&[HTTP_OK]);
    let connection = Connection::new(transport.clone(), request());
    connection.open().await.unwrap();
    let mut peer = transport.take_peer();

    connection.close("done").await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    let frame = peer.from_client.next().await.unwrap();
    assert_eq!(
        frame,
        TransportFrame::Close {
            code: NORMAL_CLOSURE,
            reason: "done".to_string()
        }
    );
}

#[test]
fn test_transport_frame_conversion() {
    let raw = RawFrame::Text("Path: a\r\n\r\n".to_string());
    let frame = TransportFrame::from(raw.clone());
    assert_eq!(frame.into_raw(), Some(raw));
    assert_eq!(
        TransportFrame::Close {
            code: 1000,
            reason: String::new()
        }
        .into_raw(),
        None
    );
}
