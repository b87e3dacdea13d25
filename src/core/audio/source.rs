use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// Audio offsets are expressed in 100-nanosecond ticks.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// PCM stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub samples_per_sec: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
}

impl AudioFormat {
    pub fn pcm(samples_per_sec: u32, bits_per_sample: u16, channels: u16) -> Self {
        let block_align = channels * bits_per_sample.div_ceil(8);
        Self {
            samples_per_sec,
            bits_per_sample,
            channels,
            avg_bytes_per_sec: samples_per_sec * u32::from(block_align),
            block_align,
        }
    }

    /// Byte position of an offset in ticks, rounded to the nearest byte.
    pub fn ticks_to_bytes(&self, ticks: u64) -> u64 {
        (ticks as f64 * f64::from(self.avg_bytes_per_sec) / TICKS_PER_SECOND as f64).round() as u64
    }

    /// Duration of `bytes` of audio in ticks, rounded to the nearest tick.
    pub fn bytes_to_ticks(&self, bytes: u64) -> u64 {
        if self.avg_bytes_per_sec == 0 {
            return 0;
        }
        (bytes as f64 * TICKS_PER_SECOND as f64 / f64::from(self.avg_bytes_per_sec)).round() as u64
    }
}

impl Default for AudioFormat {
    /// 16 kHz, 16-bit, mono.
    fn default() -> Self {
        Self::pcm(16_000, 16, 1)
    }
}

/// One read from a stream node. An `is_end` chunk carries no audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Bytes,
    pub is_end: bool,
    pub time_received: Instant,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_end: false,
            time_received: Instant::now(),
        }
    }

    pub fn end() -> Self {
        Self {
            data: Bytes::new(),
            is_end: true,
            time_received: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("Audio source error: {0}")]
    SourceFailed(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio node {0} is not attached")]
    NotAttached(String),

    #[error("Audio source is closed")]
    Closed,

    #[error("Audio I/O error: {0}")]
    Io(String),
}

/// Lifecycle event published by an audio source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSourceEvent {
    Initializing { source_id: String },
    Ready { source_id: String },
    Off { source_id: String },
    NodeAttaching { source_id: String, node_id: String },
    NodeAttached { source_id: String, node_id: String },
    NodeDetached { source_id: String, node_id: String },
    Error { source_id: String, error: String },
}

/// A readable stream handed out by [`AudioSource::attach`].
#[async_trait]
pub trait AudioStreamNode: Send {
    fn id(&self) -> &str;

    async fn read(&mut self) -> Result<AudioChunk, AudioError>;

    async fn detach(&mut self) -> Result<(), AudioError>;
}

/// Producer of audio for a recognition session.
#[async_trait]
pub trait AudioSource: Send + Sync {
    fn id(&self) -> &str;

    fn format(&self) -> AudioFormat;

    async fn turn_on(&self) -> Result<(), AudioError>;

    async fn attach(&self, node_id: &str) -> Result<Box<dyn AudioStreamNode>, AudioError>;

    async fn detach(&self, node_id: &str) -> Result<(), AudioError>;

    async fn turn_off(&self) -> Result<(), AudioError>;

    /// Lifecycle events. Receivers that lag lose the oldest events.
    fn subscribe(&self) -> broadcast::Receiver<AudioSourceEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_format_derives_rates() {
        let format = AudioFormat::pcm(16_000, 16, 1);
        assert_eq!(format.block_align, 2);
        assert_eq!(format.avg_bytes_per_sec, 32_000);

        let stereo = AudioFormat::pcm(44_100, 16, 2);
        assert_eq!(stereo.block_align, 4);
        assert_eq!(stereo.avg_bytes_per_sec, 176_400);
    }

    #[test]
    fn test_tick_conversions() {
        let format = AudioFormat::default();
        assert_eq!(format.ticks_to_bytes(TICKS_PER_SECOND), 32_000);
        assert_eq!(format.bytes_to_ticks(32_000), TICKS_PER_SECOND);
        assert_eq!(format.ticks_to_bytes(0), 0);
        assert_eq!(format.bytes_to_ticks(3_200), 1_000_000);
    }
}
