//! Audio sources and the replay buffer that sits between a source and the
//! upload loop.

pub mod push;
pub mod replay;
pub mod source;
pub mod wav;

pub use push::{PushAudioSource, PushAudioWriter};
pub use replay::ReplayableAudioNode;
pub use source::{
    AudioChunk, AudioError, AudioFormat, AudioSource, AudioSourceEvent, AudioStreamNode,
    TICKS_PER_SECOND,
};
pub use wav::WavFileSource;
