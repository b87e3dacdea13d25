//! Request session: the bookkeeping for one recognition call.
//!
//! ```text
//! Created ─► AudioAttached ─► Connecting ─► Listening ─► Recognizing ─┐
//!                                              ▲                      │
//!                                              └──── next turn ◄──────┤
//!                                                                     ▼
//!                                                        Completed | Canceled
//! ```
//!
//! A session owns the request id of the current turn, the audio offsets used
//! to shrink and replay the audio buffer, and the completion token the
//! engine's loops watch. Transitions never fail; anything that ends the
//! session resolves the completion token instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::messages::{TelemetryMetric, TelemetryPayload};
use crate::core::audio::ReplayableAudioNode;
use crate::core::connection::HTTP_OK;
use crate::core::events::{self, PlatformEvent};
use crate::core::protocol::{new_message_id, timestamp_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AudioAttached,
    Connecting,
    Listening,
    Recognizing,
    Completed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Failure(String),
}

/// Received-message timestamps and latency metrics for `telemetry`.
#[derive(Debug, Default)]
struct TelemetryRecorder {
    received: BTreeMap<String, Vec<String>>,
    metrics: Vec<TelemetryMetric>,
    listening_start: Option<String>,
    connection_start: Option<(String, String)>,
}

impl TelemetryRecorder {
    fn take_payload(&mut self) -> Option<TelemetryPayload> {
        if self.received.is_empty() && self.metrics.is_empty() {
            return None;
        }
        Some(TelemetryPayload {
            received_messages: std::mem::take(&mut self.received),
            metrics: std::mem::take(&mut self.metrics),
        })
    }
}

/// Resources released when a session is disposed.
pub(crate) struct SessionResources {
    pub audio_node: Option<Arc<ReplayableAudioNode>>,
    pub source_listener: Option<JoinHandle<()>>,
}

pub struct RequestSession {
    request_id: String,
    session_id: Option<String>,
    audio_source_id: String,
    audio_node_id: String,
    auth_fetch_event_id: Option<String>,
    state: SessionState,
    turn_start_audio_offset: u64,
    last_recognized_offset: u64,
    is_speech_ended: bool,
    is_canceled: bool,
    is_disposed: bool,
    bytes_sent: u64,
    connection_attempts: u32,
    outcome: Option<SessionOutcome>,
    completion: CancellationToken,
    audio_node: Option<Arc<ReplayableAudioNode>>,
    source_listener: Option<JoinHandle<()>>,
    telemetry: TelemetryRecorder,
}

impl RequestSession {
    pub fn new(audio_source_id: impl Into<String>) -> Self {
        let session = Self {
            request_id: new_message_id(),
            session_id: None,
            audio_source_id: audio_source_id.into(),
            audio_node_id: new_message_id(),
            auth_fetch_event_id: None,
            state: SessionState::Created,
            turn_start_audio_offset: 0,
            last_recognized_offset: 0,
            is_speech_ended: false,
            is_canceled: false,
            is_disposed: false,
            bytes_sent: 0,
            connection_attempts: 0,
            outcome: None,
            completion: CancellationToken::new(),
            audio_node: None,
            source_listener: None,
            telemetry: TelemetryRecorder::default(),
        };
        events::publish(PlatformEvent::RecognitionTriggered {
            request_id: session.request_id.clone(),
            audio_source_id: session.audio_source_id.clone(),
            audio_node_id: session.audio_node_id.clone(),
        });
        session
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Connection id of the first connection made for this session.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn audio_source_id(&self) -> &str {
        &self.audio_source_id
    }

    pub fn audio_node_id(&self) -> &str {
        &self.audio_node_id
    }

    pub fn auth_fetch_event_id(&self) -> Option<&str> {
        self.auth_fetch_event_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turn_start_audio_offset(&self) -> u64 {
        self.turn_start_audio_offset
    }

    pub fn last_recognized_offset(&self) -> u64 {
        self.last_recognized_offset
    }

    pub fn is_speech_ended(&self) -> bool {
        self.is_speech_ended
    }

    pub fn is_canceled(&self) -> bool {
        self.is_canceled
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_recognizing(&self) -> bool {
        !self.is_completed()
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    pub fn audio_node(&self) -> Option<Arc<ReplayableAudioNode>> {
        self.audio_node.clone()
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    /// Cancelled once the session completes.
    pub fn completion(&self) -> CancellationToken {
        self.completion.clone()
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    pub fn listen_for_source_events(&mut self, listener: JoinHandle<()>) {
        if let Some(previous) = self.source_listener.replace(listener) {
            previous.abort();
        }
        self.telemetry.listening_start = Some(timestamp_now());
    }

    pub fn on_audio_source_attach_completed(
        &mut self,
        audio_node: Option<Arc<ReplayableAudioNode>>,
        is_error: bool,
        error: Option<&str>,
    ) {
        if let Some(start) = self.telemetry.listening_start.take() {
            self.telemetry.metrics.push(TelemetryMetric {
                name: "ListeningTrigger",
                id: None,
                start,
                end: timestamp_now(),
                error: error.map(str::to_string),
            });
        }

        if is_error {
            self.complete(SessionOutcome::Failure(
                error.unwrap_or("audio source attach failed").to_string(),
            ));
            return;
        }
        self.audio_node = audio_node;
        self.state = SessionState::AudioAttached;
        events::publish(PlatformEvent::ListeningStarted {
            request_id: self.request_id.clone(),
            audio_source_id: self.audio_source_id.clone(),
            audio_node_id: self.audio_node_id.clone(),
        });
    }

    pub fn on_pre_connection_start(&mut self, auth_fetch_event_id: &str, connection_id: &str) {
        self.auth_fetch_event_id = Some(auth_fetch_event_id.to_string());
        if self.session_id.is_none() {
            self.session_id = Some(connection_id.to_string());
        }
        if self.is_recognizing() {
            self.state = SessionState::Connecting;
        }
        self.telemetry.connection_start = Some((connection_id.to_string(), timestamp_now()));
        events::publish(PlatformEvent::ConnectingToService {
            request_id: self.request_id.clone(),
            auth_fetch_event_id: auth_fetch_event_id.to_string(),
            session_id: connection_id.to_string(),
        });
    }

    pub fn on_auth_completed(&mut self, is_error: bool, error: Option<&str>) {
        if is_error {
            self.complete(SessionOutcome::Failure(
                error.unwrap_or("authentication failed").to_string(),
            ));
        }
    }

    pub fn on_connection_establish_completed(&mut self, status_code: u16, reason: &str) {
        if let Some((connection_id, start)) = self.telemetry.connection_start.take() {
            self.telemetry.metrics.push(TelemetryMetric {
                name: "Connection",
                id: Some(connection_id),
                start,
                end: timestamp_now(),
                error: (status_code != HTTP_OK).then(|| format!("{status_code}: {reason}")),
            });
        }

        if status_code != HTTP_OK {
            warn!(
                request_id = %self.request_id,
                status_code,
                reason,
                "Connection to the service failed"
            );
            self.complete(SessionOutcome::Failure(format!(
                "Unable to contact server. StatusCode: {status_code}, Reason: {reason}"
            )));
            return;
        }

        events::publish(PlatformEvent::RecognitionStarted {
            request_id: self.request_id.clone(),
            session_id: self.session_id.clone().unwrap_or_default(),
        });
        if let Some(node) = &self.audio_node {
            node.replay();
        }
        self.turn_start_audio_offset = self.last_recognized_offset;
        self.bytes_sent = 0;
        if self.is_recognizing() {
            self.state = SessionState::Listening;
        }
    }

    /// A recognition starting on a connection opened by an earlier one.
    pub fn on_connection_reused(&mut self, connection_id: &str) {
        if self.session_id.is_none() {
            self.session_id = Some(connection_id.to_string());
        }
        self.on_connection_establish_completed(HTTP_OK, "OK");
    }

    pub fn on_service_turn_start_response(&mut self) {
        if self.is_recognizing() {
            self.state = SessionState::Recognizing;
        }
    }

    /// End of a turn. Single-shot sessions, and continuous ones whose audio
    /// has ended, complete; otherwise a new turn starts with a fresh request
    /// id and the unconfirmed audio is replayed.
    pub fn on_service_turn_end_response(&mut self, continuous: bool) {
        if !continuous || self.is_speech_ended {
            self.complete(SessionOutcome::Success);
            return;
        }
        if !self.is_recognizing() {
            return;
        }

        self.turn_start_audio_offset = self.last_recognized_offset;
        self.request_id = new_message_id();
        self.state = SessionState::Listening;
        debug!(
            request_id = %self.request_id,
            turn_start = self.turn_start_audio_offset,
            "New turn"
        );
        if let Some(node) = &self.audio_node {
            node.replay();
        }
    }

    pub fn on_hypothesis(&mut self, offset: u64) {
        if !self.is_speech_ended {
            self.last_recognized_offset = offset;
        }
    }

    pub fn on_phrase_recognized(&mut self, offset: u64) {
        if !self.is_speech_ended {
            self.on_service_recognized(offset);
        }
    }

    /// The service confirmed recognition up to `offset` ticks: buffered
    /// audio before it will never be replayed.
    pub fn on_service_recognized(&mut self, offset: u64) {
        self.last_recognized_offset = offset;
        self.connection_attempts = 0;
        if let Some(node) = &self.audio_node {
            node.shrink_buffers(offset);
        }
    }

    pub fn on_audio_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn on_speech_ended(&mut self) {
        self.is_speech_ended = true;
    }

    pub fn on_retry_connection(&mut self) {
        self.connection_attempts += 1;
    }

    pub fn record_received_message(&mut self, path: &str) {
        self.telemetry
            .received
            .entry(path.to_string())
            .or_default()
            .push(timestamp_now());
    }

    /// Telemetry recorded since the last call, as JSON.
    pub fn take_telemetry(&mut self) -> Option<String> {
        let payload = self.telemetry.take_payload()?;
        match serde_json::to_string(&payload) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize telemetry");
                None
            }
        }
    }

    pub fn on_stop_recognizing(&mut self) {
        self.complete(SessionOutcome::Success);
    }

    pub fn on_canceled(&mut self) {
        self.is_canceled = true;
        self.complete(SessionOutcome::Success);
        self.state = SessionState::Canceled;
    }

    pub fn on_error(&mut self, error: &str) {
        self.complete(SessionOutcome::Failure(error.to_string()));
    }

    fn complete(&mut self, outcome: SessionOutcome) {
        if self.outcome.is_some() {
            return;
        }
        debug!(request_id = %self.request_id, ?outcome, "Session completed");
        self.state = if self.is_canceled {
            SessionState::Canceled
        } else {
            SessionState::Completed
        };
        self.outcome = Some(outcome);
        self.completion.cancel();
    }

    /// Mark disposed and hand back what needs async cleanup. Only the first
    /// call returns resources.
    pub(crate) fn release(&mut self) -> Option<SessionResources> {
        if self.is_disposed {
            return None;
        }
        self.is_disposed = true;
        self.complete(SessionOutcome::Success);

        let error = match &self.outcome {
            Some(SessionOutcome::Failure(error)) => Some(error.clone()),
            _ => None,
        };
        events::publish(PlatformEvent::RecognitionEnded {
            request_id: self.request_id.clone(),
            session_id: self.session_id.clone(),
            error,
        });
        Some(SessionResources {
            audio_node: self.audio_node.take(),
            source_listener: self.source_listener.take(),
        })
    }
}

/// Session handle shared by the upload and dispatch loops. Lock only for
/// short synchronous sections; never hold the guard across an await.
#[derive(Clone)]
pub struct SharedSession(Arc<Mutex<RequestSession>>);

impl SharedSession {
    pub fn new(audio_source_id: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(RequestSession::new(audio_source_id))))
    }

    pub fn lock(&self) -> MutexGuard<'_, RequestSession> {
        self.0.lock()
    }

    /// Release the audio node and source listener. Idempotent; returns
    /// whether this call did the work.
    pub async fn dispose(&self) -> bool {
        let resources = self.lock().release();
        let Some(resources) = resources else {
            return false;
        };
        if let Some(listener) = resources.source_listener {
            listener.abort();
        }
        if let Some(node) = resources.audio_node {
            if let Err(e) = node.detach().await {
                warn!(node_id = %node.id(), error = %e, "Audio node detach failed");
            }
        }
        true
    }
}
