//! In-memory speech service for integration tests.
//!
//! [`MockTransport`] answers each handshake from a scripted list of status
//! codes. Every accepted socket is handed to the test as a
//! [`MockServerConnection`], which reads client messages and writes service
//! messages in wire format.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as frame_channel;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use waav_speech_client::core::auth::{AuthError, AuthInfo, Authentication};
use waav_speech_client::core::connection::{
    HTTP_OK, Transport, TransportChannel, TransportError, TransportFrame, TransportRequest,
};
use waav_speech_client::core::protocol::{
    FrameCodec, JSON_CONTENT_TYPE, ProtocolEnvelope, WireMessage, headers,
};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn request(url: &str) -> TransportRequest {
    TransportRequest {
        url: url::Url::parse(url).expect("test URL must parse"),
        headers: vec![
            ("Ocp-Apim-Subscription-Key".to_string(), "test-key".to_string()),
            (headers::CONNECTION_ID.to_string(), "CONNECTION".to_string()),
        ],
        connection_id: "CONNECTION".to_string(),
    }
}

// =============================================================================
// Transport
// =============================================================================

pub struct MockTransport {
    statuses: Mutex<VecDeque<u16>>,
    accepted: mpsc::UnboundedSender<MockServerConnection>,
    opens: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
    stall_writes: bool,
}

/// Test side of a [`MockTransport`].
pub struct MockService {
    pub transport: Arc<MockTransport>,
    accepted: mpsc::UnboundedReceiver<MockServerConnection>,
}

impl MockService {
    /// Handshakes are answered with `statuses` in order, then with 200.
    pub fn new(statuses: &[u16]) -> Self {
        Self::build(statuses, false)
    }

    /// Accepts every handshake but never completes a frame write.
    pub fn with_stalled_writes() -> Self {
        Self::build(&[], true)
    }

    fn build(statuses: &[u16], stall_writes: bool) -> Self {
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        Self {
            transport: Arc::new(MockTransport {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                accepted: accepted_tx,
                opens: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                stall_writes,
            }),
            accepted,
        }
    }

    pub async fn next_connection(&mut self) -> MockServerConnection {
        timeout(STEP_TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }

    pub fn opens(&self) -> usize {
        self.transport.opens.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.transport.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: &TransportRequest) -> Result<TransportChannel, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let status = self.statuses.lock().pop_front().unwrap_or(HTTP_OK);
        if status != HTTP_OK {
            return Err(TransportError::Handshake {
                status_code: status,
                reason: "Rejected by mock service".to_string(),
            });
        }

        let (client_tx, from_client) = frame_channel::unbounded();
        let (to_client, client_rx) = frame_channel::unbounded();
        let connection = MockServerConnection {
            request: request.clone(),
            from_client,
            to_client,
        };
        self.accepted
            .send(connection)
            .map_err(|_| TransportError::Io("mock service is gone".to_string()))?;

        if self.stall_writes {
            return Ok(TransportChannel {
                sink: Box::pin(StalledSink),
                stream: Box::pin(client_rx),
            });
        }
        Ok(TransportChannel {
            sink: Box::pin(client_tx.sink_map_err(|e| TransportError::Io(e.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}

/// Sink that is never ready.
struct StalledSink;

impl Sink<TransportFrame> for StalledSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: TransportFrame) -> Result<(), Self::Error> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Server connection
// =============================================================================

pub struct MockServerConnection {
    pub request: TransportRequest,
    from_client: frame_channel::UnboundedReceiver<TransportFrame>,
    to_client: frame_channel::UnboundedSender<Result<TransportFrame, TransportError>>,
}

impl MockServerConnection {
    /// Next client message, or `None` once the client closed the socket.
    pub async fn next_message(&mut self) -> Option<ProtocolEnvelope> {
        let frame = timeout(STEP_TIMEOUT, self.from_client.next())
            .await
            .expect("timed out waiting for a client message")?;
        let raw = frame.into_raw()?;
        let wire = FrameCodec::decode(raw).expect("client sent an undecodable frame");
        Some(ProtocolEnvelope::try_from(wire).expect("client message without path"))
    }

    /// Next client message, which must exist and carry `path`.
    pub async fn expect_path(&mut self, path: &str) -> ProtocolEnvelope {
        let message = self
            .next_message()
            .await
            .unwrap_or_else(|| panic!("connection closed while waiting for {path}"));
        assert_eq!(message.path, path, "unexpected client message");
        message
    }

    pub fn send_text(&self, path: &str, request_id: &str, body: &str) {
        let envelope = ProtocolEnvelope::text(path, request_id, Some(JSON_CONTENT_TYPE), body);
        self.send_wire(&envelope.into_wire());
    }

    pub fn send_wire(&self, message: &WireMessage) {
        let frame = FrameCodec::encode(message).expect("service message must encode");
        let _ = self.to_client.unbounded_send(Ok(TransportFrame::from(frame)));
    }

    /// Close from the service side with a close frame.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.unbounded_send(Ok(TransportFrame::Close {
            code,
            reason: reason.to_string(),
        }));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request
            .headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.header(headers::CONNECTION_ID)
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// Static credential that counts how it was fetched.
#[derive(Default)]
pub struct CountingAuth {
    pub fetches: AtomicUsize,
    pub refreshes: AtomicUsize,
}

impl CountingAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn info() -> AuthInfo {
        AuthInfo {
            header_name: "Ocp-Apim-Subscription-Key".to_string(),
            token: "test-key".to_string(),
        }
    }
}

#[async_trait]
impl Authentication for CountingAuth {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Self::info())
    }

    async fn fetch_on_expiry(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Self::info())
    }
}

// =============================================================================
// Payloads
// =============================================================================

pub fn simple_phrase(status: &str, text: &str, offset: u64, duration: u64) -> String {
    serde_json::json!({
        "RecognitionStatus": status,
        "DisplayText": text,
        "Offset": offset,
        "Duration": duration,
    })
    .to_string()
}

pub fn hypothesis(text: &str, offset: u64, duration: u64) -> String {
    serde_json::json!({
        "Text": text,
        "Offset": offset,
        "Duration": duration,
    })
    .to_string()
}
