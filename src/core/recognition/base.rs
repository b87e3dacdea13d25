use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::core::audio::AudioError;
use crate::core::auth::AuthError;
use crate::core::connection::ConnectionError;
use crate::core::protocol::FramingError;

/// Connection attempts allowed per session before giving up.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 4;

// =============================================================================
// Modes
// =============================================================================

/// Service recognition mode; selects the URL path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    #[default]
    Interactive,
    Conversation,
    Dictation,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::Interactive => "interactive",
            RecognitionMode::Conversation => "conversation",
            RecognitionMode::Dictation => "dictation",
        }
    }
}

impl FromStr for RecognitionMode {
    type Err = RecognitionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "interactive" => Ok(RecognitionMode::Interactive),
            "conversation" => Ok(RecognitionMode::Conversation),
            "dictation" => Ok(RecognitionMode::Dictation),
            other => Err(RecognitionError::ArgumentInvalid(format!(
                "unknown recognition mode '{other}'"
            ))),
        }
    }
}

/// Shape of `speech.phrase` payloads requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Simple,
    Detailed,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Simple => "simple",
            OutputFormat::Detailed => "detailed",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = RecognitionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "simple" => Ok(OutputFormat::Simple),
            "detailed" => Ok(OutputFormat::Detailed),
            other => Err(RecognitionError::ArgumentInvalid(format!(
                "unknown output format '{other}'"
            ))),
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultReason {
    NoMatch,
    Canceled,
    RecognizingSpeech,
    RecognizedSpeech,
    RecognizingIntent,
    RecognizedIntent,
    TranslatingSpeech,
    TranslatedSpeech,
    SynthesizingAudio,
    SynthesizingAudioCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    Error,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationErrorCode {
    NoError,
    AuthenticationFailure,
    BadRequestParameters,
    TooManyRequests,
    Forbidden,
    ConnectionFailure,
    ServiceTimeout,
    ServiceError,
    ServiceUnavailable,
    RuntimeError,
}

/// `RecognitionStatus` field of service phrase payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RecognitionStatus {
    Success,
    NoMatch,
    InitialSilenceTimeout,
    BabbleTimeout,
    Error,
    EndOfDictation,
    TooManyRequests,
    BadRequest,
    Forbidden,
    #[serde(other)]
    Unknown,
}

impl RecognitionStatus {
    pub fn result_reason(self) -> ResultReason {
        match self {
            RecognitionStatus::Success => ResultReason::RecognizedSpeech,
            RecognitionStatus::NoMatch
            | RecognitionStatus::InitialSilenceTimeout
            | RecognitionStatus::BabbleTimeout
            | RecognitionStatus::EndOfDictation => ResultReason::NoMatch,
            _ => ResultReason::Canceled,
        }
    }

    pub fn cancellation_reason(self) -> CancellationReason {
        match self {
            RecognitionStatus::Success
            | RecognitionStatus::NoMatch
            | RecognitionStatus::EndOfDictation => CancellationReason::EndOfStream,
            _ => CancellationReason::Error,
        }
    }

    pub fn cancellation_error_code(self) -> CancellationErrorCode {
        match self {
            RecognitionStatus::Error => CancellationErrorCode::ServiceError,
            RecognitionStatus::TooManyRequests => CancellationErrorCode::TooManyRequests,
            RecognitionStatus::BadRequest => CancellationErrorCode::BadRequestParameters,
            RecognitionStatus::Forbidden => CancellationErrorCode::Forbidden,
            _ => CancellationErrorCode::NoError,
        }
    }
}

impl fmt::Display for RecognitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationDetails {
    pub reason: CancellationReason,
    pub error_code: CancellationErrorCode,
    pub error_details: String,
}

/// Recognition result delivered to callbacks and one-shot callers.
///
/// `offset` and `duration` are in ticks from the start of the audio stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    /// Request id of the turn that produced the result.
    pub result_id: String,
    pub reason: ResultReason,
    pub text: String,
    pub offset: u64,
    pub duration: u64,
    pub language: Option<String>,
    /// Raw service payload.
    pub json: String,
    pub intent_id: Option<String>,
    /// Target language to translated text.
    pub translations: BTreeMap<String, String>,
    pub cancellation: Option<CancellationDetails>,
}

impl RecognitionResult {
    pub fn new(result_id: impl Into<String>, reason: ResultReason) -> Self {
        Self {
            result_id: result_id.into(),
            reason,
            text: String::new(),
            offset: 0,
            duration: 0,
            language: None,
            json: String::new(),
            intent_id: None,
            translations: BTreeMap::new(),
            cancellation: None,
        }
    }

    pub fn canceled(result_id: impl Into<String>, details: CancellationDetails) -> Self {
        Self {
            cancellation: Some(details),
            ..Self::new(result_id, ResultReason::Canceled)
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    SessionStarted {
        session_id: String,
    },
    SessionStopped {
        session_id: String,
    },
    SpeechStartDetected {
        session_id: String,
        offset: u64,
    },
    SpeechEndDetected {
        session_id: String,
        offset: u64,
    },
    /// Intermediate hypothesis.
    Recognizing {
        session_id: String,
        result: RecognitionResult,
    },
    /// Final result of a phrase.
    Recognized {
        session_id: String,
        result: RecognitionResult,
    },
    Canceled {
        session_id: String,
        result: RecognitionResult,
    },
    /// Synthesized translation audio. `completed` marks the end of the
    /// synthesis for the current phrase.
    Synthesizing {
        session_id: String,
        audio: Bytes,
        completed: bool,
    },
}

/// Async callback receiving every [`RecognitionEvent`] in order.
pub type RecognitionEventCallback =
    Arc<dyn Fn(RecognitionEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Queue feeding the event forwarding task.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RecognitionEvent>,
}

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<RecognitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: RecognitionEvent) {
        // The forwarder only stops after every sender is gone.
        let _ = self.tx.send(event);
    }
}

/// Result of a single-shot recognition; resolved at most once.
#[derive(Clone, Default)]
pub struct ResultSlot {
    tx: Arc<Mutex<Option<oneshot::Sender<RecognitionResult>>>>,
}

impl ResultSlot {
    pub(crate) fn pending() -> (Self, oneshot::Receiver<RecognitionResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn is_pending(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Deliver `result` if nothing was delivered yet.
    pub fn resolve(&self, result: RecognitionResult) -> bool {
        let tx = self.tx.lock().take();
        match tx {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecognitionError {
    #[error("Invalid argument: {0}")]
    ArgumentInvalid(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Credentials rejected: {0}")]
    AuthExpired(String),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("Canceled by service ({code:?}): {details}")]
    ServiceCanceled {
        code: CancellationErrorCode,
        details: String,
    },

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RecognitionError {
    /// Error code reported in the cancellation event for this failure.
    pub fn cancellation_code(&self) -> CancellationErrorCode {
        match self {
            RecognitionError::TransportFailure(_) | RecognitionError::AuthExpired(_) => {
                CancellationErrorCode::ConnectionFailure
            }
            RecognitionError::ServiceCanceled { code, .. } => *code,
            RecognitionError::ArgumentInvalid(_) => CancellationErrorCode::BadRequestParameters,
            _ => CancellationErrorCode::RuntimeError,
        }
    }
}

impl From<ConnectionError> for RecognitionError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Framing(framing) => RecognitionError::Framing(framing),
            other => RecognitionError::TransportFailure(other.to_string()),
        }
    }
}

impl From<AudioError> for RecognitionError {
    fn from(error: AudioError) -> Self {
        RecognitionError::RuntimeError(error.to_string())
    }
}

impl From<AuthError> for RecognitionError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InvalidArgument(message) => RecognitionError::ArgumentInvalid(message),
            AuthError::Failed(message) => RecognitionError::AuthExpired(message),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerConfig {
    /// Service region, e.g. `westus`. Ignored when `endpoint` is set.
    pub region: String,
    /// Explicit service endpoint overriding the regional host and path.
    pub endpoint: Option<Url>,
    pub language: String,
    pub mode: RecognitionMode,
    pub output_format: OutputFormat,
    pub max_retry_count: u32,
    /// Send a `telemetry` message at every turn end.
    pub telemetry_enabled: bool,
    /// Phrase hints sent in the `speech.context` dynamic grammar.
    pub phrase_hints: Vec<String>,
}

impl RecognizerConfig {
    pub fn new(region: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint: None,
            language: language.into(),
            mode: RecognitionMode::default(),
            output_format: OutputFormat::default(),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            telemetry_enabled: false,
            phrase_hints: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), RecognitionError> {
        if self.endpoint.is_none() && self.region.trim().is_empty() {
            return Err(RecognitionError::ArgumentInvalid(
                "either a region or an endpoint is required".to_string(),
            ));
        }
        if self.language.trim().is_empty() {
            return Err(RecognitionError::ArgumentInvalid(
                "recognition language is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Speech (and intent) recognition URL.
    pub fn speech_service_url(&self) -> Result<Url, RecognitionError> {
        let mut url = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => Url::parse(&format!(
                "wss://{}.stt.speech.microsoft.com/speech/recognition/{}/cognitiveservices/v1",
                self.region,
                self.mode.as_str()
            ))
            .map_err(|e| RecognitionError::ArgumentInvalid(format!("invalid region: {e}")))?,
        };
        set_query_default(&mut url, "language", &self.language);
        set_query_default(&mut url, "format", self.output_format.as_str());
        Ok(url)
    }
}

/// Append `name=value` unless the URL already carries `name`.
pub(crate) fn set_query_default(url: &mut Url, name: &str, value: &str) {
    if url.query_pairs().any(|(existing, _)| existing == name) {
        return;
    }
    url.query_pairs_mut().append_pair(name, value);
}
