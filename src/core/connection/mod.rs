//! Service connection: the [`Transport`] seam, its WebSocket implementation
//! and the queued [`Connection`] built on top of it.

pub mod client;
pub mod transport;
pub mod websocket;

pub use client::{Connection, ConnectionError, ConnectionOpenResponse, ConnectionState, HTTP_OK};
pub use transport::{
    ABNORMAL_CLOSURE, FrameSink, FrameStream, NORMAL_CLOSURE, Transport, TransportChannel,
    TransportError, TransportFrame, TransportRequest,
};
pub use websocket::WebSocketTransport;

#[cfg(test)]
mod tests;
