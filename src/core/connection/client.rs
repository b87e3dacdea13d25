//! One duplex connection to the recognition service.
//!
//! ```text
//!   send() ──► send queue ──► writer task ──► FrameSink ──► service
//!                                                            │
//!   receive() ◄── receive queue ◄── reader task ◄── FrameStream
//! ```
//!
//! The writer drains the send queue in FIFO order, one frame at a time. The
//! reader decodes inbound frames and enqueues them in arrival order. Closing
//! (locally or by the peer) drains both queues, rejecting every pending send
//! and receive with the close reason.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OnceCell, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{
    ABNORMAL_CLOSURE, FrameSink, FrameStream, NORMAL_CLOSURE, Transport, TransportError,
    TransportFrame, TransportRequest,
};
use crate::core::events::{self, PlatformEvent};
use crate::core::protocol::{FrameCodec, FramingError, RawFrame, WireMessage};
use crate::core::queue::{OrderedQueue, QueueError};

const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub const HTTP_OK: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    Disconnected,
}

/// Outcome of [`Connection::open`]: an HTTP-style status and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOpenResponse {
    pub status_code: u16,
    pub reason: String,
}

impl ConnectionOpenResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == HTTP_OK
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is not open (state: {0:?})")]
    NotConnected(ConnectionState),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Framing(#[from] FramingError),
}

struct SendItem {
    frame: RawFrame,
    message_id: String,
    path: Option<String>,
    done: oneshot::Sender<Result<(), ConnectionError>>,
}

/// State shared between the connection handle and its I/O tasks.
struct Shared {
    id: String,
    state: Mutex<ConnectionState>,
    close_status: Mutex<Option<(u16, String)>>,
    send_queue: OrderedQueue<SendItem>,
    receive_queue: OrderedQueue<WireMessage>,
    shutdown: CancellationToken,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock() = next;
    }

    fn closed_error(&self) -> ConnectionError {
        match self.close_status.lock().as_ref() {
            Some((_, reason)) => ConnectionError::Closed(reason.clone()),
            None => ConnectionError::Closed("connection closed".to_string()),
        }
    }

    /// Move to Disconnected and reject all queued work. Returns false when
    /// the connection was already disconnected.
    fn disconnect(&self, status_code: u16, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }
        *self.close_status.lock() = Some((status_code, reason.to_string()));

        let rejected_sends = self.send_queue.drain_and_dispose(
            |item| {
                let _ = item.done.send(Err(ConnectionError::Closed(reason.to_string())));
            },
            reason,
        );
        let rejected_receives = self.receive_queue.drain_and_dispose(|_| {}, reason);
        debug!(
            connection_id = %self.id,
            rejected_sends,
            rejected_receives,
            "Connection queues drained"
        );

        self.shutdown.cancel();
        events::publish(PlatformEvent::ConnectionClosed {
            connection_id: self.id.clone(),
            status_code,
            reason: reason.to_string(),
        });
        true
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    request: TransportRequest,
    open_outcome: OnceCell<ConnectionOpenResponse>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, request: TransportRequest) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: request.connection_id.clone(),
                state: Mutex::new(ConnectionState::None),
                close_status: Mutex::new(None),
                send_queue: OrderedQueue::new(),
                receive_queue: OrderedQueue::new(),
                shutdown: CancellationToken::new(),
            }),
            transport,
            request,
            open_outcome: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Status code and reason of the close, once disconnected.
    pub fn close_status(&self) -> Option<(u16, String)> {
        self.shared.close_status.lock().clone()
    }

    /// Establish the socket. Concurrent and repeated callers share the
    /// outcome of a single establish attempt. A handshake failure resolves
    /// with its status code rather than an error; calling `open` once the
    /// connection is disconnected fails.
    pub async fn open(&self) -> Result<ConnectionOpenResponse, ConnectionError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(self.shared.closed_error());
        }
        let outcome = self.open_outcome.get_or_init(|| self.establish()).await;
        Ok(outcome.clone())
    }

    async fn establish(&self) -> ConnectionOpenResponse {
        self.shared.set_state(ConnectionState::Connecting);
        events::publish(PlatformEvent::ConnectionStarting {
            connection_id: self.shared.id.clone(),
            uri: self.request.url.to_string(),
        });

        let channel = match self.transport.open(&self.request).await {
            Ok(channel) => channel,
            Err(error) => {
                let (status_code, reason) = match error {
                    TransportError::Handshake {
                        status_code,
                        reason,
                    } => (status_code, reason),
                    TransportError::Io(reason) => (ABNORMAL_CLOSURE, reason),
                };
                warn!(
                    connection_id = %self.shared.id,
                    status_code,
                    reason = %reason,
                    "Connection establish failed"
                );
                self.shared.set_state(ConnectionState::Disconnected);
                *self.shared.close_status.lock() = Some((status_code, reason.clone()));
                self.shared.send_queue.drain_and_dispose(|_| {}, &reason);
                self.shared.receive_queue.drain_and_dispose(|_| {}, &reason);
                events::publish(PlatformEvent::ConnectionEstablishError {
                    connection_id: self.shared.id.clone(),
                    status_code,
                    reason: reason.clone(),
                });
                return ConnectionOpenResponse {
                    status_code,
                    reason,
                };
            }
        };

        // A local close may have raced the handshake.
        if self.state() == ConnectionState::Disconnected {
            let mut sink = channel.sink;
            let _ = timeout(CLOSE_HANDSHAKE_TIMEOUT, sink.close()).await;
            let (status_code, reason) = self
                .close_status()
                .unwrap_or((NORMAL_CLOSURE, "connection closed".to_string()));
            return ConnectionOpenResponse {
                status_code,
                reason,
            };
        }

        self.shared.set_state(ConnectionState::Connected);
        info!(connection_id = %self.shared.id, "Connection established");
        events::publish(PlatformEvent::ConnectionEstablished {
            connection_id: self.shared.id.clone(),
        });

        let writer = tokio::spawn(run_writer(self.shared.clone(), channel.sink));
        let reader = tokio::spawn(run_reader(self.shared.clone(), channel.stream));
        self.tasks.lock().extend([writer, reader]);

        ConnectionOpenResponse {
            status_code: HTTP_OK,
            reason: "Connection established".to_string(),
        }
    }

    /// Encode and enqueue `message`. Resolves once the frame was written to
    /// the transport, or with the close reason if the connection closes
    /// first.
    pub async fn send(&self, message: WireMessage) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(state));
        }
        let frame = FrameCodec::encode(&message)?;

        let (done, result) = oneshot::channel();
        let item = SendItem {
            frame,
            message_id: message.id().to_string(),
            path: message.path().map(str::to_string),
            done,
        };
        self.shared
            .send_queue
            .enqueue(item)
            .map_err(|e| queue_error(&self.shared, e))?;

        result
            .await
            .unwrap_or_else(|_| Err(self.shared.closed_error()))
    }

    /// Next inbound message, in arrival order.
    pub async fn receive(&self) -> Result<WireMessage, ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(state));
        }
        self.shared
            .receive_queue
            .dequeue()
            .await
            .map_err(|e| queue_error(&self.shared, e))
    }

    /// Close with a normal closure. Pending sends and receives are rejected
    /// with `reason`. Resolves once the I/O tasks have finished.
    pub async fn close(&self, reason: &str) {
        if self.shared.disconnect(NORMAL_CLOSURE, reason) {
            info!(connection_id = %self.shared.id, reason, "Connection closed locally");
        }
        self.shared.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if timeout(CLOSE_HANDSHAKE_TIMEOUT, task).await.is_err() {
                warn!(connection_id = %self.shared.id, "Connection task did not stop in time");
                abort.abort();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn queue_error(shared: &Shared, error: QueueError) -> ConnectionError {
    match error {
        QueueError::Drained(reason) => ConnectionError::Closed(reason),
        QueueError::ProducerDropped => shared.closed_error(),
    }
}

async fn run_writer(shared: Arc<Shared>, mut sink: FrameSink) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            item = shared.send_queue.dequeue() => match item {
                Ok(item) => item,
                Err(_) => break,
            },
        };

        let SendItem {
            frame,
            message_id,
            path,
            done,
        } = item;
        let sent = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => {
                // In-flight send loses to the close.
                let _ = done.send(Err(shared.closed_error()));
                break;
            }
            sent = sink.send(TransportFrame::from(frame)) => sent,
        };

        match sent {
            Ok(()) => {
                events::publish(PlatformEvent::ConnectionMessageSent {
                    connection_id: shared.id.clone(),
                    message_id,
                    path,
                });
                let _ = done.send(Ok(()));
            }
            Err(error) => {
                warn!(connection_id = %shared.id, error = %error, "Send failed");
                let _ = done.send(Err(ConnectionError::Transport(error.to_string())));
                shared.disconnect(ABNORMAL_CLOSURE, &error.to_string());
                return;
            }
        }
    }

    let reason = shared
        .close_status
        .lock()
        .as_ref()
        .map(|(_, reason)| reason.clone())
        .unwrap_or_default();
    let closed = timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        sink.send(TransportFrame::Close {
            code: NORMAL_CLOSURE,
            reason,
        })
        .await?;
        sink.close().await
    })
    .await;
    if let Ok(Err(error)) = closed {
        debug!(connection_id = %shared.id, error = %error, "Close frame not delivered");
    }
}

async fn run_reader(shared: Arc<Shared>, mut stream: FrameStream) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return,
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                warn!(connection_id = %shared.id, error = %error, "Receive failed");
                shared.disconnect(ABNORMAL_CLOSURE, &error.to_string());
                return;
            }
            None => {
                shared.disconnect(ABNORMAL_CLOSURE, "transport stream ended");
                return;
            }
        };

        let raw = match frame {
            TransportFrame::Close { code, reason } => {
                info!(
                    connection_id = %shared.id,
                    code,
                    reason = %reason,
                    "Connection closed by peer"
                );
                shared.disconnect(code, &reason);
                return;
            }
            other => match other.into_raw() {
                Some(raw) => raw,
                None => continue,
            },
        };

        match FrameCodec::decode(raw) {
            Ok(message) => {
                events::publish(PlatformEvent::ConnectionMessageReceived {
                    connection_id: shared.id.clone(),
                    message_id: message.id().to_string(),
                    path: message.path().map(str::to_string),
                });
                if shared.receive_queue.enqueue(message).is_err() {
                    return;
                }
            }
            Err(error) => {
                warn!(connection_id = %shared.id, error = %error, "Dropping undecodable frame");
                events::publish(PlatformEvent::ConnectionFramingError {
                    connection_id: shared.id.clone(),
                    error: error.to_string(),
                });
            }
        }
    }
}
