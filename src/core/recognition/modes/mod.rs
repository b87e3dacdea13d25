//! Per-mode message handling.
//!
//! The engine owns the connection, the turn protocol (`turn.start`,
//! `speech.startdetected`, `speech.enddetected`, `turn.end`) and the session.
//! Everything else a service sends is mode specific and goes to the active
//! [`RecognitionModeHandler`]:
//!
//! ```text
//! ┌─────────────┐  envelope   ┌──────────────────────┐  events   ┌──────────┐
//! │ dispatch    │ ──────────► │ RecognitionMode-     │ ────────► │ callback │
//! │ loop        │             │ Handler              │           └──────────┘
//! └─────────────┘ ◄────────── └──────────────────────┘ ────────► one-shot
//!                  handled?            │ cancel()
//!                                      ▼
//!                              engine cancellation
//! ```

pub mod intent;
pub mod speech;
pub mod translation;

pub use intent::IntentHandler;
pub use speech::SpeechHandler;
pub use translation::TranslationHandler;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use url::Url;

use super::base::{
    CancellationErrorCode, CancellationReason, EventSender, OutputFormat, RecognitionError,
    RecognitionEvent, RecognitionResult, RecognizerConfig, ResultReason, ResultSlot,
};
use super::session::SharedSession;
use crate::core::protocol::{FramingError, ProtocolEnvelope};

/// Strategy for the mode-specific part of the service protocol.
pub trait RecognitionModeHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called before every recognition.
    fn reset(&mut self) {}

    fn service_url(&self, config: &RecognizerConfig) -> Result<Url, RecognitionError> {
        config.speech_service_url()
    }

    /// Add mode sections to the `speech.context` body.
    fn augment_context(&self, _sections: &mut Map<String, Value>) {}

    /// Handle one service message. Returns `false` for paths the mode does
    /// not know.
    fn process_message(
        &mut self,
        message: &ProtocolEnvelope,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<bool, RecognitionError>;
}

/// Cancellation requested by a handler, applied by the engine once the
/// handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCancellation {
    pub reason: CancellationReason,
    pub error_code: CancellationErrorCode,
    pub details: String,
}

/// What a handler may touch while processing a message.
pub struct DispatchContext<'a> {
    session: &'a SharedSession,
    events: &'a EventSender,
    result_slot: &'a ResultSlot,
    continuous: bool,
    output_format: OutputFormat,
    cancellation: Option<PendingCancellation>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(
        session: &'a SharedSession,
        events: &'a EventSender,
        result_slot: &'a ResultSlot,
        continuous: bool,
        output_format: OutputFormat,
    ) -> Self {
        Self {
            session,
            events,
            result_slot,
            continuous,
            output_format,
            cancellation: None,
        }
    }

    pub fn session_id(&self) -> String {
        self.session
            .lock()
            .session_id()
            .unwrap_or_default()
            .to_string()
    }

    pub fn request_id(&self) -> String {
        self.session.lock().request_id().to_string()
    }

    /// Audio offset of the current turn start, added to every service offset.
    pub fn turn_offset(&self) -> u64 {
        self.session.lock().turn_start_audio_offset()
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn is_speech_ended(&self) -> bool {
        self.session.lock().is_speech_ended()
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    pub fn on_hypothesis(&self, offset: u64) {
        self.session.lock().on_hypothesis(offset);
    }

    pub fn on_phrase_recognized(&self, offset: u64) {
        self.session.lock().on_phrase_recognized(offset);
    }

    pub fn emit(&self, event: RecognitionEvent) {
        self.events.send(event);
    }

    pub fn recognizing(&self, result: RecognitionResult) {
        self.emit(RecognitionEvent::Recognizing {
            session_id: self.session_id(),
            result,
        });
    }

    pub fn recognized(&self, result: RecognitionResult) {
        self.emit(RecognitionEvent::Recognized {
            session_id: self.session_id(),
            result,
        });
    }

    /// Hand `result` to a waiting single-shot caller, if any.
    pub fn resolve(&self, result: RecognitionResult) {
        self.result_slot.resolve(result);
    }

    pub fn cancel(
        &mut self,
        reason: CancellationReason,
        error_code: CancellationErrorCode,
        details: impl Into<String>,
    ) {
        if self.cancellation.is_none() {
            self.cancellation = Some(PendingCancellation {
                reason,
                error_code,
                details: details.into(),
            });
        }
    }

    pub fn take_cancellation(&mut self) -> Option<PendingCancellation> {
        self.cancellation.take()
    }

    /// Result skeleton for the current turn.
    pub fn result(&self, reason: ResultReason) -> RecognitionResult {
        RecognitionResult::new(self.request_id(), reason)
    }
}

/// Deserialize a JSON message body, mapping failures to a framing error so
/// the message is dropped without ending the session.
pub fn parse_body<T: DeserializeOwned>(message: &ProtocolEnvelope) -> Result<T, RecognitionError> {
    serde_json::from_str(message.text_body()).map_err(|e| {
        RecognitionError::Framing(FramingError::InvalidPayload {
            path: message.path.clone(),
            reason: e.to_string(),
        })
    })
}

/// Whether a final NoMatch result is not worth reporting: the audio already
/// ended and the service only saw trailing silence.
pub(crate) fn suppress_no_match(
    ctx: &DispatchContext<'_>,
    reason: ResultReason,
    initial_silence: bool,
) -> bool {
    reason == ResultReason::NoMatch && ctx.is_speech_ended() && !initial_silence
}
