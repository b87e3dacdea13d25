//! Speech recognition over the service protocol: request sessions, the
//! recognition engine and the per-mode message handlers.

pub mod base;
pub mod engine;
pub mod messages;
pub mod modes;
pub mod pacing;
pub mod session;

pub use base::{
    CancellationDetails, CancellationErrorCode, CancellationReason, DEFAULT_MAX_RETRY_COUNT,
    EventSender, OutputFormat, RecognitionError, RecognitionEvent, RecognitionEventCallback,
    RecognitionMode, RecognitionResult, RecognitionStatus, RecognizerConfig, ResultReason,
    ResultSlot,
};
pub use engine::RecognitionEngine;
pub use modes::{
    DispatchContext, IntentHandler, PendingCancellation, RecognitionModeHandler, SpeechHandler,
    TranslationHandler,
};
pub use pacing::UploadPacer;
pub use session::{RequestSession, SessionOutcome, SessionState, SharedSession};
