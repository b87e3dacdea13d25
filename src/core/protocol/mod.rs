//! Wire protocol: message model, frame codec and the well-known paths and
//! headers spoken with the recognition service.

pub mod codec;
pub mod message;

pub use codec::{FrameCodec, FramingError, RawFrame};
pub use message::{
    Headers, MessageBody, MessageKind, ProtocolEnvelope, WireMessage, new_message_id,
    timestamp_now,
};

/// Reserved and well-known header names.
pub mod headers {
    pub const PATH: &str = "Path";
    pub const REQUEST_ID: &str = "X-RequestId";
    pub const TIMESTAMP: &str = "X-Timestamp";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const STREAM_ID: &str = "X-StreamId";
    pub const CONNECTION_ID: &str = "X-ConnectionId";
}

/// Message paths.
pub mod paths {
    pub const SPEECH_CONFIG: &str = "speech.config";
    pub const SPEECH_CONTEXT: &str = "speech.context";
    pub const AUDIO: &str = "audio";
    pub const TELEMETRY: &str = "telemetry";

    pub const TURN_START: &str = "turn.start";
    pub const TURN_END: &str = "turn.end";
    pub const SPEECH_START_DETECTED: &str = "speech.startdetected";
    pub const SPEECH_END_DETECTED: &str = "speech.enddetected";
    pub const SPEECH_HYPOTHESIS: &str = "speech.hypothesis";
    pub const SPEECH_FRAGMENT: &str = "speech.fragment";
    pub const SPEECH_PHRASE: &str = "speech.phrase";

    pub const TRANSLATION_HYPOTHESIS: &str = "translation.hypothesis";
    pub const TRANSLATION_PHRASE: &str = "translation.phrase";
    pub const TRANSLATION_SYNTHESIS: &str = "translation.synthesis";
    pub const TRANSLATION_SYNTHESIS_END: &str = "translation.synthesis.end";

    pub const INTENT_RESPONSE: &str = "response";
}

pub const JSON_CONTENT_TYPE: &str = "application/json";
