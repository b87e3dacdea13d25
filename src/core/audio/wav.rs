//! WAV file source. Reads 16-bit PCM WAV files with `hound` and serves them
//! in 100 ms chunks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use super::source::{
    AudioChunk, AudioError, AudioFormat, AudioSource, AudioSourceEvent, AudioStreamNode,
};
use crate::core::protocol::new_message_id;

const EVENT_CAPACITY: usize = 64;
const CHUNKS_PER_SECOND: u32 = 10;

pub struct WavFileSource {
    id: String,
    path: PathBuf,
    format: AudioFormat,
    events: broadcast::Sender<AudioSourceEvent>,
}

impl WavFileSource {
    /// Validate the file header. Samples are loaded on attach.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let path = path.as_ref().to_path_buf();
        let reader = hound::WavReader::open(&path).map_err(|e| AudioError::Io(e.to_string()))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?} {}-bit, expected 16-bit integer PCM",
                spec.sample_format, spec.bits_per_sample
            )));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            id: new_message_id(),
            path,
            format: AudioFormat::pcm(spec.sample_rate, spec.bits_per_sample, spec.channels),
            events,
        })
    }

    fn load_samples(path: PathBuf) -> Result<Bytes, AudioError> {
        let reader = hound::WavReader::open(&path).map_err(|e| AudioError::Io(e.to_string()))?;
        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<i16>, _>>()
            .map_err(|e| AudioError::Io(e.to_string()))?;
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Ok(Bytes::from(bytes))
    }

    fn emit(&self, event: AudioSourceEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl AudioSource for WavFileSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn turn_on(&self) -> Result<(), AudioError> {
        self.emit(AudioSourceEvent::Initializing {
            source_id: self.id.clone(),
        });
        self.emit(AudioSourceEvent::Ready {
            source_id: self.id.clone(),
        });
        Ok(())
    }

    async fn attach(&self, node_id: &str) -> Result<Box<dyn AudioStreamNode>, AudioError> {
        self.emit(AudioSourceEvent::NodeAttaching {
            source_id: self.id.clone(),
            node_id: node_id.to_string(),
        });

        let path = self.path.clone();
        let loaded = tokio::task::spawn_blocking(move || Self::load_samples(path))
            .await
            .map_err(|e| AudioError::SourceFailed(e.to_string()))?;
        let data = match loaded {
            Ok(data) => data,
            Err(error) => {
                self.emit(AudioSourceEvent::Error {
                    source_id: self.id.clone(),
                    error: error.to_string(),
                });
                return Err(error);
            }
        };
        debug!(
            source_id = %self.id,
            bytes = data.len(),
            path = %self.path.display(),
            "WAV file loaded"
        );

        self.emit(AudioSourceEvent::NodeAttached {
            source_id: self.id.clone(),
            node_id: node_id.to_string(),
        });
        let chunk_bytes = (self.format.avg_bytes_per_sec / CHUNKS_PER_SECOND).max(2) as usize;
        Ok(Box::new(WavStreamNode {
            id: node_id.to_string(),
            source_id: self.id.clone(),
            data,
            position: 0,
            chunk_bytes,
            events: self.events.clone(),
        }))
    }

    async fn detach(&self, _node_id: &str) -> Result<(), AudioError> {
        Ok(())
    }

    async fn turn_off(&self) -> Result<(), AudioError> {
        self.emit(AudioSourceEvent::Off {
            source_id: self.id.clone(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AudioSourceEvent> {
        self.events.subscribe()
    }
}

struct WavStreamNode {
    id: String,
    source_id: String,
    data: Bytes,
    position: usize,
    chunk_bytes: usize,
    events: broadcast::Sender<AudioSourceEvent>,
}

#[async_trait]
impl AudioStreamNode for WavStreamNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&mut self) -> Result<AudioChunk, AudioError> {
        if self.position >= self.data.len() {
            return Ok(AudioChunk::end());
        }
        let end = (self.position + self.chunk_bytes).min(self.data.len());
        let chunk = self.data.slice(self.position..end);
        self.position = end;
        Ok(AudioChunk::new(chunk))
    }

    async fn detach(&mut self) -> Result<(), AudioError> {
        self.position = self.data.len();
        let _ = self.events.send(AudioSourceEvent::NodeDetached {
            source_id: self.source_id.clone(),
            node_id: self.id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn test_wav_source_serves_100ms_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        // 250 ms at 16 kHz.
        write_wav(&path, 16_000, &vec![0x0102; 4_000]);

        let source = WavFileSource::open(&path).unwrap();
        assert_eq!(source.format(), AudioFormat::pcm(16_000, 16, 1));

        let mut node = source.attach("N1").await.unwrap();
        let sizes = [
            node.read().await.unwrap().data.len(),
            node.read().await.unwrap().data.len(),
            node.read().await.unwrap().data.len(),
        ];
        assert_eq!(sizes, [3_200, 3_200, 1_600]);
        assert!(node.read().await.unwrap().is_end);
    }

    #[tokio::test]
    async fn test_samples_are_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.wav");
        write_wav(&path, 8_000, &[0x0102, -2]);

        let source = WavFileSource::open(&path).unwrap();
        let mut node = source.attach("N1").await.unwrap();
        let chunk = node.read().await.unwrap();
        assert_eq!(&chunk.data[..], &[0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn test_rejects_float_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(
            WavFileSource::open(&path),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            WavFileSource::open("/nonexistent/file.wav"),
            Err(AudioError::Io(_))
        ));
    }
}
