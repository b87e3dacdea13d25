//! Recognition engine.
//!
//! Drives one request session at a time over a cached service connection:
//!
//! ```text
//!                 ┌──────────────────────── run ───────────────────────────┐
//!  AudioSource ──►│ ReplayableAudioNode ──► upload loop ──► audio ───────┐ │
//!                 │                                                      ▼ │
//!                 │                        fetch_connection ◄──► Connection│◄──► service
//!                 │                                                      │ │
//!  callback ◄─────│ EventSender ◄── mode handler ◄── dispatch loop ◄─────┘ │
//!                 └────────────────────────────────────────────────────────┘
//! ```
//!
//! The upload loop paces audio at no more than twice real time. The dispatch
//! loop owns the turn protocol and hands every other message to the active
//! [`RecognitionModeHandler`]. A dropped connection is re-established by
//! whichever loop notices first; the session then replays unconfirmed audio.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Map;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use super::base::{
    CancellationDetails, CancellationErrorCode, CancellationReason, EventSender, OutputFormat,
    RecognitionError, RecognitionEvent, RecognitionEventCallback, RecognitionResult,
    RecognizerConfig, ResultSlot,
};
use super::messages::{SpeechConfigPayload, SpeechDetected, speech_context};
use super::modes::{DispatchContext, RecognitionModeHandler, parse_body};
use super::pacing::UploadPacer;
use super::session::SharedSession;
use crate::core::audio::{AudioSource, ReplayableAudioNode};
use crate::core::auth::Authentication;
use crate::core::connection::{
    ABNORMAL_CLOSURE, Connection, HTTP_OK, Transport, TransportRequest,
};
use crate::core::events::{self, PlatformEvent};
use crate::core::protocol::{
    JSON_CONTENT_TYPE, ProtocolEnvelope, headers, new_message_id, paths,
};

/// Remote close codes that end the session instead of reconnecting.
const FATAL_CLOSE_CODES: [u16; 4] = [1002, 1003, 1007, 4000];
/// Close code for an invalid payload.
const INVALID_PAYLOAD_CLOSE: u16 = 1007;

struct ActiveRecognition {
    session: SharedSession,
    task: JoinHandle<()>,
}

struct EngineInner {
    config: RecognizerConfig,
    authentication: Arc<dyn Authentication>,
    transport: Arc<dyn Transport>,
    audio_source: Arc<dyn AudioSource>,
    handler: tokio::sync::Mutex<Box<dyn RecognitionModeHandler>>,
    /// Kept across recognitions; replaced when it drops.
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    event_callback: RwLock<Option<RecognitionEventCallback>>,
    active: Mutex<Option<ActiveRecognition>>,
    closed: AtomicBool,
}

/// Speech recognizer over the service's WebSocket protocol.
///
/// Register a callback with [`on_event`](Self::on_event), then either call
/// [`recognize_once`](Self::recognize_once) or bracket a continuous
/// recognition with [`start_continuous`](Self::start_continuous) /
/// [`stop_continuous`](Self::stop_continuous).
#[derive(Clone)]
pub struct RecognitionEngine {
    inner: Arc<EngineInner>,
}

impl RecognitionEngine {
    pub fn new(
        config: RecognizerConfig,
        authentication: Arc<dyn Authentication>,
        transport: Arc<dyn Transport>,
        audio_source: Arc<dyn AudioSource>,
        handler: Box<dyn RecognitionModeHandler>,
    ) -> Result<Self, RecognitionError> {
        config.validate()?;
        let format = audio_source.format();
        if format.avg_bytes_per_sec == 0 || format.bits_per_sample == 0 || format.channels == 0 {
            return Err(RecognitionError::ArgumentInvalid(format!(
                "unsupported audio format: {format:?}"
            )));
        }
        handler.service_url(&config)?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                authentication,
                transport,
                audio_source,
                handler: tokio::sync::Mutex::new(handler),
                connection: tokio::sync::Mutex::new(None),
                event_callback: RwLock::new(None),
                active: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.inner.config
    }

    /// Receive every recognition event, in order. Replaces any previous
    /// callback.
    pub fn on_event(&self, callback: RecognitionEventCallback) {
        *self.inner.event_callback.write() = Some(callback);
    }

    pub fn is_recognizing(&self) -> bool {
        self.inner
            .active
            .lock()
            .as_ref()
            .is_some_and(|active| active.session.lock().is_recognizing())
    }

    /// Recognize a single phrase and return its result. Canceled results
    /// (service errors, end of stream without speech) are returned as
    /// results, not errors.
    pub async fn recognize_once(&self) -> Result<RecognitionResult, RecognitionError> {
        let (slot, result) = ResultSlot::pending();
        self.start(false, slot)?;

        let result = result.await.map_err(|_| {
            RecognitionError::RuntimeError("Recognition ended without a result".to_string())
        });
        self.join_active().await;
        result
    }

    pub async fn start_continuous(&self) -> Result<(), RecognitionError> {
        self.start(true, ResultSlot::default())?;
        Ok(())
    }

    /// End the running continuous recognition and wait for it to wind down.
    pub async fn stop_continuous(&self) -> Result<(), RecognitionError> {
        let active = self.inner.active.lock().take();
        let Some(active) = active else {
            return Ok(());
        };

        let request_id = {
            let mut session = active.session.lock();
            session.on_speech_ended();
            session.request_id().to_string()
        };
        let connection = self.inner.connection.lock().await.clone();
        if let Some(connection) = connection.filter(|c| c.is_connected()) {
            let end_of_audio = ProtocolEnvelope::binary(paths::AUDIO, &request_id, Bytes::new());
            if let Err(e) = connection.send(end_of_audio.into_wire()).await {
                debug!(error = %e, "Failed to send end of audio on stop");
            }
        }
        active.session.lock().on_stop_recognizing();

        if let Err(e) = active.task.await {
            error!(error = %e, "Recognition task failed");
            return Err(RecognitionError::RuntimeError(e.to_string()));
        }
        info!("Continuous recognition stopped");
        Ok(())
    }

    /// Stop any recognition, close the connection and turn the audio source
    /// off. The engine rejects further recognitions.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let active = self.inner.active.lock().take();
        if let Some(active) = active {
            active.session.lock().on_stop_recognizing();
            if let Err(e) = active.task.await {
                error!(error = %e, "Recognition task failed");
            }
        }

        let connection = self.inner.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close("Recognizer closed").await;
        }
        if let Err(e) = self.inner.audio_source.turn_off().await {
            warn!(error = %e, "Failed to turn off audio source");
        }
        info!("Recognizer closed");
    }

    fn start(&self, continuous: bool, slot: ResultSlot) -> Result<SharedSession, RecognitionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RecognitionError::InvalidState(
                "recognizer is closed".to_string(),
            ));
        }

        let mut active = self.inner.active.lock();
        if active
            .as_ref()
            .is_some_and(|current| !current.task.is_finished())
        {
            return Err(RecognitionError::InvalidState(
                "a recognition is already running".to_string(),
            ));
        }

        let session = SharedSession::new(self.inner.audio_source.id());
        let task = tokio::spawn(self.inner.clone().run(session.clone(), continuous, slot));
        *active = Some(ActiveRecognition {
            session: session.clone(),
            task,
        });
        Ok(session)
    }

    async fn join_active(&self) {
        let active = self.inner.active.lock().take();
        if let Some(active) = active {
            if let Err(e) = active.task.await {
                error!(error = %e, "Recognition task failed");
            }
        }
    }
}

// =============================================================================
// Run
// =============================================================================

/// Computed once per recognition.
struct RunPlan {
    url: Url,
    context: String,
    continuous: bool,
    output_format: OutputFormat,
}

impl RunPlan {
    fn new(
        config: &RecognizerConfig,
        handler: &dyn RecognitionModeHandler,
        continuous: bool,
    ) -> Result<Self, RecognitionError> {
        let url = handler.service_url(config)?;
        let mut sections = Map::new();
        handler.augment_context(&mut sections);
        Ok(Self {
            url,
            context: speech_context(&config.phrase_hints, sections).to_string(),
            continuous,
            output_format: config.output_format,
        })
    }
}

impl EngineInner {
    async fn run(self: Arc<Self>, session: SharedSession, continuous: bool, slot: ResultSlot) {
        let (events, receiver) = EventSender::channel();
        let forwarder = tokio::spawn(forward_events(self.clone(), receiver));

        {
            let mut handler = self.handler.lock().await;
            handler.reset();
            info!(
                request_id = %session.lock().request_id(),
                mode = handler.name(),
                continuous,
                "Recognition started"
            );

            match RunPlan::new(&self.config, &**handler, continuous) {
                Ok(plan) => {
                    let run = Run {
                        engine: &*self,
                        session: &session,
                        events: &events,
                        slot: &slot,
                        plan: &plan,
                        started: AtomicBool::new(false),
                        stopped: AtomicBool::new(false),
                        end_sent_on: Mutex::new(None),
                    };
                    if let Err(e) = run.execute(&mut **handler).await {
                        warn!(error = %e, "Recognition failed");
                        session.lock().on_error(&e.to_string());
                        run.report_cancellation(
                            CancellationReason::Error,
                            e.cancellation_code(),
                            &e.to_string(),
                        );
                    }
                    run.session_stopped();
                }
                Err(e) => {
                    session.lock().on_error(&e.to_string());
                    let request_id = session.lock().request_id().to_string();
                    slot.resolve(RecognitionResult::canceled(
                        request_id,
                        CancellationDetails {
                            reason: CancellationReason::Error,
                            error_code: e.cancellation_code(),
                            error_details: e.to_string(),
                        },
                    ));
                }
            }
        }

        if slot.is_pending() {
            let request_id = session.lock().request_id().to_string();
            slot.resolve(RecognitionResult::canceled(
                request_id,
                CancellationDetails {
                    reason: CancellationReason::Error,
                    error_code: CancellationErrorCode::RuntimeError,
                    error_details: "Recognition ended without a result".to_string(),
                },
            ));
        }

        session.dispose().await;
        drop(events);
        if let Err(e) = forwarder.await {
            error!(error = %e, "Event forwarder failed");
        }
        debug!("Recognition finished");
    }
}

/// Deliver events to the registered callback one at a time.
async fn forward_events(
    engine: Arc<EngineInner>,
    mut receiver: mpsc::UnboundedReceiver<RecognitionEvent>,
) {
    while let Some(event) = receiver.recv().await {
        let callback = engine.event_callback.read().clone();
        if let Some(callback) = callback {
            callback(event).await;
        }
    }
}

/// Borrowed state of one recognition, shared by the upload and dispatch
/// loops.
struct Run<'a> {
    engine: &'a EngineInner,
    session: &'a SharedSession,
    events: &'a EventSender,
    slot: &'a ResultSlot,
    plan: &'a RunPlan,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Connection that last carried the end-of-audio marker.
    end_sent_on: Mutex<Option<Arc<Connection>>>,
}

impl Run<'_> {
    async fn execute(
        &self,
        handler: &mut dyn RecognitionModeHandler,
    ) -> Result<(), RecognitionError> {
        self.attach_audio().await?;

        let Some((connection, fresh)) = self.fetch_connection().await? else {
            return Ok(());
        };
        if !fresh {
            let connection_id = connection.id().to_string();
            self.session.lock().on_connection_reused(&connection_id);
            self.send_context(&connection).await?;
        }

        self.events.send(RecognitionEvent::SessionStarted {
            session_id: self.session_id(),
        });
        self.started.store(true, Ordering::SeqCst);

        let upload = async {
            let result = self.upload_loop().await;
            if let Err(e) = &result {
                self.session.lock().on_error(&e.to_string());
            }
            result
        };
        let dispatch = async {
            let result = self.dispatch_loop(handler).await;
            if let Err(e) = &result {
                self.session.lock().on_error(&e.to_string());
            }
            result
        };
        let (upload, dispatch) = tokio::join!(upload, dispatch);
        upload.and(dispatch)
    }

    fn session_id(&self) -> String {
        self.session
            .lock()
            .session_id()
            .unwrap_or_default()
            .to_string()
    }

    fn request_id(&self) -> String {
        self.session.lock().request_id().to_string()
    }

    // =========================================================================
    // Audio
    // =========================================================================

    async fn attach_audio(&self) -> Result<(), RecognitionError> {
        let source = &self.engine.audio_source;
        let node_id = self.session.lock().audio_node_id().to_string();

        let mut source_events = source.subscribe();
        let listener = tokio::spawn(async move {
            loop {
                match source_events.recv().await {
                    Ok(event) => events::publish(PlatformEvent::AudioSource(event)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Audio source events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.session.lock().listen_for_source_events(listener);

        let attached = async {
            source.turn_on().await?;
            source.attach(&node_id).await
        };
        match attached.await {
            Ok(node) => {
                let node = Arc::new(ReplayableAudioNode::new(node, source.format()));
                self.session
                    .lock()
                    .on_audio_source_attach_completed(Some(node), false, None);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.session
                    .lock()
                    .on_audio_source_attach_completed(None, true, Some(&message));
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Cached connection, or a new one with `speech.config` and
    /// `speech.context` already sent. `None` once the session is over.
    async fn fetch_connection(&self) -> Result<Option<(Arc<Connection>, bool)>, RecognitionError> {
        let mut cached = self.engine.connection.lock().await;
        if let Some(connection) = cached.as_ref() {
            if connection.is_connected() {
                return Ok(Some((connection.clone(), false)));
            }
        }
        if self.engine.closed.load(Ordering::SeqCst) || !self.session.lock().is_recognizing() {
            return Ok(None);
        }
        *cached = None;

        let connection = self.retryable_connect().await?;

        let speech_config = SpeechConfigPayload::new(
            &self.engine.audio_source.format(),
            self.engine.audio_source.id(),
        );
        let body = serde_json::to_string(&speech_config)
            .map_err(|e| RecognitionError::RuntimeError(format!("speech.config: {e}")))?;
        let envelope = ProtocolEnvelope::text(
            paths::SPEECH_CONFIG,
            &self.request_id(),
            Some(JSON_CONTENT_TYPE),
            body,
        );
        connection.send(envelope.into_wire()).await?;
        self.send_context(&connection).await?;

        *cached = Some(connection.clone());
        Ok(Some((connection, true)))
    }

    async fn retryable_connect(&self) -> Result<Arc<Connection>, RecognitionError> {
        let connection_id = self
            .session
            .lock()
            .session_id()
            .map(str::to_string)
            .unwrap_or_else(new_message_id);
        let auth_fetch_event_id = new_message_id();
        self.session
            .lock()
            .on_pre_connection_start(&auth_fetch_event_id, &connection_id);

        let max_retry_count = self.engine.config.max_retry_count;
        let mut force_refresh = false;
        let mut refreshed = false;
        let mut last_status = (0u16, String::from("No connection attempt"));

        while self.session.lock().connection_attempts() <= max_retry_count {
            let auth = if force_refresh {
                self.engine
                    .authentication
                    .fetch_on_expiry(&auth_fetch_event_id)
                    .await
            } else {
                self.engine.authentication.fetch(&auth_fetch_event_id).await
            };
            let auth = match auth {
                Ok(auth) => auth,
                Err(e) => {
                    let message = e.to_string();
                    self.session.lock().on_auth_completed(true, Some(&message));
                    return Err(e.into());
                }
            };
            self.session.lock().on_auth_completed(false, None);

            let request = TransportRequest {
                url: self.plan.url.clone(),
                headers: vec![
                    (auth.header_name, auth.token),
                    (headers::CONNECTION_ID.to_string(), connection_id.clone()),
                ],
                connection_id: connection_id.clone(),
            };
            let connection = Arc::new(Connection::new(self.engine.transport.clone(), request));
            let response = connection.open().await?;

            if response.is_success() {
                self.session
                    .lock()
                    .on_connection_establish_completed(HTTP_OK, &response.reason);
                info!(connection_id = %connection_id, url = %self.plan.url, "Connected to service");
                return Ok(connection);
            }

            warn!(
                connection_id = %connection_id,
                status_code = response.status_code,
                reason = %response.reason,
                "Service rejected the connection"
            );
            // Rejected credentials get exactly one forced refresh.
            force_refresh = matches!(response.status_code, 401 | 403) && !refreshed;
            refreshed |= force_refresh;
            self.session.lock().on_retry_connection();
            last_status = (response.status_code, response.reason);
        }

        let (status_code, reason) = last_status;
        self.session
            .lock()
            .on_connection_establish_completed(status_code, &reason);
        Err(RecognitionError::TransportFailure(format!(
            "Unable to contact server. StatusCode: {status_code}, Reason: {reason}"
        )))
    }

    async fn send_context(&self, connection: &Connection) -> Result<(), RecognitionError> {
        let envelope = ProtocolEnvelope::text(
            paths::SPEECH_CONTEXT,
            &self.request_id(),
            Some(JSON_CONTENT_TYPE),
            self.plan.context.clone(),
        );
        connection.send(envelope.into_wire()).await?;
        Ok(())
    }

    // =========================================================================
    // Upload
    // =========================================================================

    async fn upload_loop(&self) -> Result<(), RecognitionError> {
        let (node, completion) = {
            let session = self.session.lock();
            (session.audio_node(), session.completion())
        };
        let Some(node) = node else {
            return Err(RecognitionError::InvalidState(
                "no audio node attached".to_string(),
            ));
        };
        let mut pacer = UploadPacer::new(self.engine.audio_source.format().avg_bytes_per_sec);

        loop {
            let (speech_ended, recognizing) = {
                let session = self.session.lock();
                (session.is_speech_ended(), session.is_recognizing())
            };
            if speech_ended || !recognizing {
                return Ok(());
            }

            let (chunk, generation) = tokio::select! {
                biased;
                _ = completion.cancelled() => return Ok(()),
                read = node.read_with_generation() => read?,
            };
            // Stopped while waiting on the source.
            if self.session.lock().is_speech_ended() {
                return Ok(());
            }
            if chunk.data.is_empty() && !chunk.is_end {
                continue;
            }

            let Some((connection, _)) = self.fetch_connection().await? else {
                return Ok(());
            };
            // A reconnect armed a replay after this chunk was read; the
            // replay resends it in order.
            if generation != node.replay_generation() {
                continue;
            }

            let delay = pacer.delay(Instant::now());
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = completion.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            pacer.record_send(chunk.data.len(), Instant::now());
            self.session.lock().on_audio_sent(chunk.data.len());

            let payload = if chunk.is_end {
                Bytes::new()
            } else {
                chunk.data.clone()
            };
            let envelope = ProtocolEnvelope::binary(paths::AUDIO, &self.request_id(), payload);
            if let Err(e) = connection.send(envelope.into_wire()).await {
                // The next iteration reconnects and replays.
                warn!(error = %e, "Failed to send audio");
                continue;
            }

            if chunk.is_end {
                debug!(bytes_sent = self.session.lock().bytes_sent(), "End of audio sent");
                *self.end_sent_on.lock() = Some(connection.clone());
                self.session.lock().on_speech_ended();

                // The dispatch loop may have reconnected while the marker was
                // in flight, before it could see that speech ended.
                let current = self.engine.connection.lock().await.clone();
                if let Some(current) = current {
                    if current.is_connected() && !Arc::ptr_eq(&current, &connection) {
                        self.resend_after_end(&current).await?;
                    }
                }
                return Ok(());
            }
        }
    }

    /// Replay the unconfirmed audio and the end-of-audio marker on a
    /// connection opened after the upload loop finished. At most once per
    /// connection.
    async fn resend_after_end(&self, connection: &Arc<Connection>) -> Result<(), RecognitionError> {
        {
            let mut end_sent_on = self.end_sent_on.lock();
            if end_sent_on
                .as_ref()
                .is_some_and(|sent| Arc::ptr_eq(sent, connection))
            {
                return Ok(());
            }
            *end_sent_on = Some(connection.clone());
        }
        let (node, completion) = {
            let session = self.session.lock();
            (session.audio_node(), session.completion())
        };
        let Some(node) = node else {
            return Ok(());
        };
        let mut pacer = UploadPacer::new(self.engine.audio_source.format().avg_bytes_per_sec);
        let mut replayed = 0usize;

        while node.is_replaying() {
            let chunk = node.read().await?;
            if chunk.is_end {
                break;
            }
            if chunk.data.is_empty() {
                continue;
            }
            let delay = pacer.delay(Instant::now());
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = completion.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            pacer.record_send(chunk.data.len(), Instant::now());
            self.session.lock().on_audio_sent(chunk.data.len());
            replayed += chunk.data.len();

            let envelope = ProtocolEnvelope::binary(paths::AUDIO, &self.request_id(), chunk.data);
            if let Err(e) = connection.send(envelope.into_wire()).await {
                // The dispatch loop reconnects and replays again.
                warn!(error = %e, "Failed to replay audio");
                return Ok(());
            }
        }

        let envelope = ProtocolEnvelope::binary(paths::AUDIO, &self.request_id(), Bytes::new());
        if let Err(e) = connection.send(envelope.into_wire()).await {
            warn!(error = %e, "Failed to resend end of audio");
            return Ok(());
        }
        info!(replayed, "Replayed audio after reconnecting");
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn dispatch_loop(
        &self,
        handler: &mut dyn RecognitionModeHandler,
    ) -> Result<(), RecognitionError> {
        let completion = self.session.lock().completion();
        let mut must_report_end_of_stream = false;

        loop {
            if !self.session.lock().is_recognizing() {
                return Ok(());
            }
            let Some((connection, fresh)) = self.fetch_connection().await? else {
                return Ok(());
            };
            if fresh && self.session.lock().is_speech_ended() {
                self.resend_after_end(&connection).await?;
            }

            let received = tokio::select! {
                biased;
                _ = completion.cancelled() => return Ok(()),
                received = connection.receive() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    if !self.session.lock().is_recognizing() {
                        return Ok(());
                    }
                    let (code, reason) = connection
                        .close_status()
                        .unwrap_or((ABNORMAL_CLOSURE, e.to_string()));
                    if FATAL_CLOSE_CODES.contains(&code) {
                        let error_code = if code == INVALID_PAYLOAD_CLOSE {
                            CancellationErrorCode::BadRequestParameters
                        } else {
                            CancellationErrorCode::ConnectionFailure
                        };
                        self.cancel_local(
                            CancellationReason::Error,
                            error_code,
                            &format!("Connection closed by service: {code} {reason}"),
                        );
                        return Ok(());
                    }

                    let attempts = {
                        let mut session = self.session.lock();
                        session.on_retry_connection();
                        session.connection_attempts()
                    };
                    if attempts > self.engine.config.max_retry_count {
                        self.cancel_local(
                            CancellationReason::Error,
                            CancellationErrorCode::ConnectionFailure,
                            &format!("Connection lost: {code} {reason}"),
                        );
                        return Ok(());
                    }
                    warn!(code, reason = %reason, attempts, "Connection lost; reconnecting");
                    continue;
                }
            };

            let envelope = match ProtocolEnvelope::try_from(message) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed service message");
                    continue;
                }
            };
            let request_id = self.request_id();
            if !envelope.request_id.eq_ignore_ascii_case(&request_id) {
                debug!(
                    path = %envelope.path,
                    message_request_id = %envelope.request_id,
                    request_id = %request_id,
                    "Dropping message for another request"
                );
                continue;
            }
            self.session.lock().record_received_message(&envelope.path);

            if envelope.is_path(paths::TURN_START) {
                must_report_end_of_stream = true;
                self.session.lock().on_service_turn_start_response();
            } else if envelope.is_path(paths::SPEECH_START_DETECTED)
                || envelope.is_path(paths::SPEECH_END_DETECTED)
            {
                let detected: SpeechDetected = if envelope.text_body().trim().is_empty() {
                    SpeechDetected::default()
                } else {
                    match parse_body(&envelope) {
                        Ok(detected) => detected,
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed speech detection message");
                            continue;
                        }
                    }
                };
                let offset = detected.offset + self.session.lock().turn_start_audio_offset();
                let session_id = self.session_id();

                if envelope.is_path(paths::SPEECH_START_DETECTED) {
                    self.events
                        .send(RecognitionEvent::SpeechStartDetected { session_id, offset });
                } else {
                    self.events
                        .send(RecognitionEvent::SpeechEndDetected { session_id, offset });
                    if self.plan.continuous {
                        self.session.lock().on_service_recognized(offset);
                    }
                }
            } else if envelope.is_path(paths::TURN_END) {
                if self.engine.config.telemetry_enabled {
                    self.send_telemetry(&connection).await;
                }

                let speech_ended = self.session.lock().is_speech_ended();
                if speech_ended && must_report_end_of_stream {
                    must_report_end_of_stream = false;
                    self.cancel_local(
                        CancellationReason::EndOfStream,
                        CancellationErrorCode::NoError,
                        "",
                    );
                }

                let done = {
                    let mut session = self.session.lock();
                    session.on_service_turn_end_response(self.plan.continuous);
                    !self.plan.continuous || session.is_speech_ended() || !session.is_recognizing()
                };
                if done {
                    self.session_stopped();
                    return Ok(());
                }
                if let Err(e) = self.send_context(&connection).await {
                    warn!(error = %e, "Failed to send speech context for the next turn");
                }
            } else {
                let mut ctx = DispatchContext::new(
                    self.session,
                    self.events,
                    self.slot,
                    self.plan.continuous,
                    self.plan.output_format,
                );
                match handler.process_message(&envelope, &mut ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(path = %envelope.path, mode = handler.name(), "Unhandled message")
                    }
                    Err(RecognitionError::Framing(e)) => {
                        warn!(error = %e, "Dropping malformed service message");
                    }
                    Err(e) => return Err(e),
                }
                if let Some(cancellation) = ctx.take_cancellation() {
                    self.cancel_local(
                        cancellation.reason,
                        cancellation.error_code,
                        &cancellation.details,
                    );
                }
            }
        }
    }

    async fn send_telemetry(&self, connection: &Connection) {
        let telemetry = self.session.lock().take_telemetry();
        let Some(body) = telemetry else {
            return;
        };
        let envelope = ProtocolEnvelope::text(
            paths::TELEMETRY,
            &self.request_id(),
            Some(JSON_CONTENT_TYPE),
            body,
        );
        if let Err(e) = connection.send(envelope.into_wire()).await {
            warn!(error = %e, "Failed to send telemetry");
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Stop the session and report why, unless it already ended.
    fn cancel_local(
        &self,
        reason: CancellationReason,
        error_code: CancellationErrorCode,
        details: &str,
    ) {
        {
            let mut session = self.session.lock();
            if !session.is_recognizing() {
                return;
            }
            session.on_stop_recognizing();
        }
        self.report_cancellation(reason, error_code, details);
    }

    /// Raise `canceled` and resolve a waiting single-shot caller. At most
    /// once per session.
    fn report_cancellation(
        &self,
        reason: CancellationReason,
        error_code: CancellationErrorCode,
        details: &str,
    ) {
        let (session_id, request_id) = {
            let mut session = self.session.lock();
            if session.is_canceled() {
                return;
            }
            session.on_canceled();
            (
                session.session_id().unwrap_or_default().to_string(),
                session.request_id().to_string(),
            )
        };
        info!(?reason, ?error_code, details, "Recognition canceled");

        let result = RecognitionResult::canceled(
            request_id,
            CancellationDetails {
                reason,
                error_code,
                error_details: details.to_string(),
            },
        );
        self.events.send(RecognitionEvent::Canceled {
            session_id,
            result: result.clone(),
        });
        self.slot.resolve(result);
    }

    fn session_stopped(&self) {
        if self.started.load(Ordering::SeqCst) && !self.stopped.swap(true, Ordering::SeqCst) {
            self.events.send(RecognitionEvent::SessionStopped {
                session_id: self.session_id(),
            });
        }
    }
}
