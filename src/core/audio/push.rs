//! Push audio source: the caller writes PCM bytes and closes the stream when
//! done. Successive sessions attached to the same source keep reading where
//! the previous one stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::source::{
    AudioChunk, AudioError, AudioFormat, AudioSource, AudioSourceEvent, AudioStreamNode,
};
use crate::core::protocol::new_message_id;

const EVENT_CAPACITY: usize = 64;

enum PushItem {
    Data(Bytes),
    End,
}

struct PushStream {
    receiver: mpsc::UnboundedReceiver<PushItem>,
    ended: bool,
}

/// Write half of a [`PushAudioSource`].
#[derive(Clone)]
pub struct PushAudioWriter {
    sender: mpsc::UnboundedSender<PushItem>,
}

impl PushAudioWriter {
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), AudioError> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.sender
            .send(PushItem::Data(data))
            .map_err(|_| AudioError::Closed)
    }

    /// Mark the end of the stream. Readers see an end chunk once everything
    /// written before has been read.
    pub fn close(&self) {
        let _ = self.sender.send(PushItem::End);
    }
}

pub struct PushAudioSource {
    id: String,
    format: AudioFormat,
    writer: PushAudioWriter,
    stream: Arc<tokio::sync::Mutex<PushStream>>,
    attached: Arc<Mutex<Option<String>>>,
    chunks_read: Arc<AtomicUsize>,
    events: broadcast::Sender<AudioSourceEvent>,
}

impl PushAudioSource {
    pub fn new(format: AudioFormat) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: new_message_id(),
            format,
            writer: PushAudioWriter { sender },
            stream: Arc::new(tokio::sync::Mutex::new(PushStream {
                receiver,
                ended: false,
            })),
            attached: Arc::new(Mutex::new(None)),
            chunks_read: Arc::new(AtomicUsize::new(0)),
            events,
        }
    }

    pub fn writer(&self) -> PushAudioWriter {
        self.writer.clone()
    }

    /// Number of data chunks handed to readers so far.
    pub fn chunks_read(&self) -> usize {
        self.chunks_read.load(Ordering::SeqCst)
    }

    fn emit(&self, event: AudioSourceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl AudioSource for PushAudioSource {
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
        {
            let mut attached = self.attached.lock();
            if let Some(existing) = attached.as_ref() {
                return Err(AudioError::SourceFailed(format!(
                    "node {existing} is already attached"
                )));
            }
            *attached = Some(node_id.to_string());
        }
        self.emit(AudioSourceEvent::NodeAttached {
            source_id: self.id.clone(),
            node_id: node_id.to_string(),
        });

        Ok(Box::new(PushStreamNode {
            id: node_id.to_string(),
            source_id: self.id.clone(),
            stream: self.stream.clone(),
            attached: self.attached.clone(),
            chunks_read: self.chunks_read.clone(),
            events: self.events.clone(),
            detached: false,
        }))
    }

    async fn detach(&self, node_id: &str) -> Result<(), AudioError> {
        let mut attached = self.attached.lock();
        if attached.as_deref() == Some(node_id) {
            *attached = None;
        }
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

struct PushStreamNode {
    id: String,
    source_id: String,
    stream: Arc<tokio::sync::Mutex<PushStream>>,
    attached: Arc<Mutex<Option<String>>>,
    chunks_read: Arc<AtomicUsize>,
    events: broadcast::Sender<AudioSourceEvent>,
    detached: bool,
}

#[async_trait]
impl AudioStreamNode for PushStreamNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&mut self) -> Result<AudioChunk, AudioError> {
        if self.detached {
            return Err(AudioError::NotAttached(self.id.clone()));
        }
        let mut stream = self.stream.lock().await;
        if stream.ended {
            return Ok(AudioChunk::end());
        }
        match stream.receiver.recv().await {
            Some(PushItem::Data(data)) => {
                self.chunks_read.fetch_add(1, Ordering::SeqCst);
                Ok(AudioChunk::new(data))
            }
            Some(PushItem::End) | None => {
                stream.ended = true;
                Ok(AudioChunk::end())
            }
        }
    }

    async fn detach(&mut self) -> Result<(), AudioError> {
        if !self.detached {
            self.detached = true;
            {
                let mut attached = self.attached.lock();
                if attached.as_deref() == Some(self.id.as_str()) {
                    *attached = None;
                }
            }
            let _ = self.events.send(AudioSourceEvent::NodeDetached {
                source_id: self.source_id.clone(),
                node_id: self.id.clone(),
            });
        }
        Ok(())
    }
}
