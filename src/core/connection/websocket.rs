//! WebSocket transport over `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{
    self, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, warn};

use super::transport::{
    ABNORMAL_CLOSURE, NO_STATUS_RECEIVED, Transport, TransportChannel, TransportError,
    TransportFrame, TransportRequest,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn build_request(
        request: &TransportRequest,
    ) -> Result<http::Request<()>, TransportError> {
        let host = match (request.url.host_str(), request.url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(handshake_error(format!(
                    "URL has no host: {}",
                    request.url
                )));
            }
        };

        let mut builder = http::Request::builder()
            .uri(request.url.as_str())
            .header("Host", host)
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(()).map_err(|e| handshake_error(e.to_string()))
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn handshake_error(reason: String) -> TransportError {
    TransportError::Handshake {
        status_code: ABNORMAL_CLOSURE,
        reason,
    }
}

fn to_message(frame: TransportFrame) -> Message {
    match frame {
        TransportFrame::Text(text) => Message::Text(text.into()),
        TransportFrame::Binary(data) => Message::Binary(data),
        TransportFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_message(message: Message) -> Option<TransportFrame> {
    match message {
        Message::Text(text) => Some(TransportFrame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(TransportFrame::Binary(data)),
        Message::Close(frame) => Some(match frame {
            Some(frame) => TransportFrame::Close {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_owned(),
            },
            None => TransportFrame::Close {
                code: NO_STATUS_RECEIVED,
                reason: String::new(),
            },
        }),
        // Pongs are answered by tungstenite while the stream is polled.
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: &TransportRequest) -> Result<TransportChannel, TransportError> {
        let http_request = Self::build_request(request)?;
        debug!(
            connection_id = %request.connection_id,
            url = %request.url,
            "Opening WebSocket"
        );

        let connected = timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(http_request),
        )
        .await
        .map_err(|_| handshake_error("connection timed out".to_string()))?;

        let (ws_stream, response) = match connected {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status();
                warn!(
                    connection_id = %request.connection_id,
                    status = status.as_u16(),
                    "WebSocket handshake rejected"
                );
                return Err(TransportError::Handshake {
                    status_code: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("").to_string(),
                });
            }
            Err(e) => return Err(handshake_error(e.to_string())),
        };
        debug!(
            connection_id = %request.connection_id,
            status = response.status().as_u16(),
            "WebSocket connected"
        );

        let (ws_sink, ws_source) = ws_stream.split();
        let sink = ws_sink
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|frame: TransportFrame| {
                future::ready(Ok::<_, TransportError>(to_message(frame)))
            });
        let stream = ws_source.filter_map(|message| {
            future::ready(match message {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(TransportError::Io(e.to_string()))),
            })
        });

        Ok(TransportChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
