//! Process-wide observability sink.
//!
//! Connections, sessions and audio sources publish [`PlatformEvent`]s here.
//! The sink is a single replaceable cell; the default forwards every event to
//! `tracing` at debug level, and [`NoopEventSink`] discards them.

use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::core::audio::AudioSourceEvent;

/// Lifecycle event published by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    // Connection lifecycle
    ConnectionStarting {
        connection_id: String,
        uri: String,
    },
    ConnectionEstablished {
        connection_id: String,
    },
    ConnectionEstablishError {
        connection_id: String,
        status_code: u16,
        reason: String,
    },
    ConnectionClosed {
        connection_id: String,
        status_code: u16,
        reason: String,
    },
    ConnectionMessageSent {
        connection_id: String,
        message_id: String,
        path: Option<String>,
    },
    ConnectionMessageReceived {
        connection_id: String,
        message_id: String,
        path: Option<String>,
    },
    ConnectionFramingError {
        connection_id: String,
        error: String,
    },

    // Request session lifecycle
    RecognitionTriggered {
        request_id: String,
        audio_source_id: String,
        audio_node_id: String,
    },
    ListeningStarted {
        request_id: String,
        audio_source_id: String,
        audio_node_id: String,
    },
    ConnectingToService {
        request_id: String,
        auth_fetch_event_id: String,
        session_id: String,
    },
    RecognitionStarted {
        request_id: String,
        session_id: String,
    },
    RecognitionEnded {
        request_id: String,
        session_id: Option<String>,
        error: Option<String>,
    },

    // Audio source lifecycle
    AudioSource(AudioSourceEvent),
}

/// Consumer of platform events. Must not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &PlatformEvent);
}

/// Default sink: one `debug!` record per event.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &PlatformEvent) {
        debug!(?event, "platform event");
    }
}

pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn on_event(&self, _event: &PlatformEvent) {}
}

static EVENT_SINK: Lazy<ArcSwap<Box<dyn EventSink>>> =
    Lazy::new(|| ArcSwap::from_pointee(Box::new(TracingEventSink) as Box<dyn EventSink>));

/// Replace the process-wide sink.
pub fn set_event_sink<S: EventSink + 'static>(sink: S) {
    EVENT_SINK.store(Arc::new(Box::new(sink)));
}

/// Restore the default tracing sink.
pub fn reset_event_sink() {
    set_event_sink(TracingEventSink);
}

pub fn publish(event: PlatformEvent) {
    EVENT_SINK.load().on_event(&event);
}
