use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use thiserror::Error;
use url::Url;

use crate::core::protocol::RawFrame;

/// Close code for a normal, locally requested closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the transport went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when the peer sent a close frame without a code.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Frame as seen by a duplex transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

impl TransportFrame {
    /// Data frames convert to a [`RawFrame`]; close frames do not.
    pub fn into_raw(self) -> Option<RawFrame> {
        match self {
            TransportFrame::Text(text) => Some(RawFrame::Text(text)),
            TransportFrame::Binary(data) => Some(RawFrame::Binary(data)),
            TransportFrame::Close { .. } => None,
        }
    }
}

impl From<RawFrame> for TransportFrame {
    fn from(frame: RawFrame) -> Self {
        match frame {
            RawFrame::Text(text) => TransportFrame::Text(text),
            RawFrame::Binary(data) => TransportFrame::Binary(data),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The handshake did not produce an open socket. `status_code` is the
    /// HTTP status when the server answered, otherwise [`ABNORMAL_CLOSURE`].
    #[error("handshake failed with status {status_code}: {reason}")]
    Handshake { status_code: u16, reason: String },

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Everything needed to open one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: Url,
    /// Handshake headers; always contains the credential pair and
    /// `X-ConnectionId`.
    pub headers: Vec<(String, String)>,
    pub connection_id: String,
}

pub type FrameSink = Pin<Box<dyn Sink<TransportFrame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<TransportFrame, TransportError>> + Send>>;

/// Both halves of an open socket.
pub struct TransportChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Duplex frame transport. Implemented over WebSockets for production and
/// by in-memory fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &TransportRequest) -> Result<TransportChannel, TransportError>;
}
