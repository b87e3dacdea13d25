pub mod audio;
pub mod auth;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod recognition;

// Re-export commonly used types for convenience
pub use audio::{
    AudioChunk, AudioError, AudioFormat, AudioSource, AudioSourceEvent, AudioStreamNode,
    PushAudioSource, PushAudioWriter, ReplayableAudioNode, WavFileSource,
};
pub use auth::{AuthError, AuthInfo, Authentication, IssueTokenAuth, SubscriptionKeyAuth};
pub use connection::{
    Connection, ConnectionError, ConnectionState, Transport, TransportRequest, WebSocketTransport,
};
pub use events::{EventSink, NoopEventSink, PlatformEvent, TracingEventSink};
pub use protocol::{FrameCodec, FramingError, ProtocolEnvelope, WireMessage};
pub use queue::{OrderedQueue, QueueError};
pub use recognition::{
    CancellationDetails, CancellationErrorCode, CancellationReason, IntentHandler, OutputFormat,
    RecognitionEngine, RecognitionError, RecognitionEvent, RecognitionEventCallback,
    RecognitionMode, RecognitionModeHandler, RecognitionResult, RecognizerConfig, ResultReason,
    SpeechHandler, TranslationHandler,
};
