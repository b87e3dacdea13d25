//! Replayable audio node.
//!
//! Wraps a stream node and keeps every chunk it has delivered until the
//! service confirms recognition past that point. After a reconnect the
//! engine arms replay and the node serves the unconfirmed tail again before
//! reading new audio from the source.
//!
//! ```text
//!  bufferStartOffset      lastShrinkOffset         replayOffset
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//!        [ chunk n ][ chunk n+1 ][ chunk n+2 ][ chunk n+3 ] ◄── source
//!                    ◄──────────── replayed ───────────────►
//! ```
//!
//! Offsets are in ticks (100 ns) from the start of the stream.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::source::{AudioChunk, AudioError, AudioFormat, AudioStreamNode};

#[derive(Debug)]
struct AudioBufferEntry {
    data: Bytes,
    serial_number: u64,
    byte_offset: u64,
}

#[derive(Debug, Default)]
struct ReplayState {
    buffers: VecDeque<AudioBufferEntry>,
    replay_active: bool,
    replay_offset: u64,
    last_shrink_offset: u64,
    buffer_start_offset: u64,
    buffered_bytes: u64,
    next_serial: u64,
    pending_end: bool,
    generation: u64,
}

pub struct ReplayableAudioNode {
    id: String,
    format: AudioFormat,
    source: tokio::sync::Mutex<Box<dyn AudioStreamNode>>,
    state: Mutex<ReplayState>,
}

impl ReplayableAudioNode {
    pub fn new(source: Box<dyn AudioStreamNode>, format: AudioFormat) -> Self {
        Self {
            id: source.id().to_string(),
            format,
            source: tokio::sync::Mutex::new(source),
            state: Mutex::new(ReplayState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next chunk: replayed bytes while replay is armed, otherwise the
    /// source's next chunk (which is buffered for a later replay).
    pub async fn read(&self) -> Result<AudioChunk, AudioError> {
        self.read_with_generation().await.map(|(chunk, _)| chunk)
    }

    /// Like [`read`](Self::read), also returning the replay generation the
    /// chunk was served under. A chunk whose generation is older than
    /// [`replay_generation`](Self::replay_generation) is covered by the
    /// newer replay.
    pub async fn read_with_generation(&self) -> Result<(AudioChunk, u64), AudioError> {
        {
            let mut state = self.state.lock();
            let generation = state.generation;
            if let Some(chunk) = self.next_replayed(&mut state) {
                return Ok((chunk, generation));
            }
            if std::mem::take(&mut state.pending_end) {
                return Ok((AudioChunk::end(), generation));
            }
        }

        let chunk = self.source.lock().await.read().await?;
        let mut state = self.state.lock();
        if !chunk.data.is_empty() {
            let entry = AudioBufferEntry {
                data: chunk.data.clone(),
                serial_number: state.next_serial,
                byte_offset: state.buffered_bytes,
            };
            state.next_serial += 1;
            state.buffered_bytes += chunk.data.len() as u64;
            state.buffers.push_back(entry);
        }
        let generation = state.generation;
        if !state.replay_active {
            return Ok((chunk, generation));
        }

        // Replay was armed while waiting on the source: the fresh chunk is
        // now the buffer tail and goes out after the replayed bytes.
        if chunk.is_end {
            state.pending_end = true;
        }
        match self.next_replayed(&mut state) {
            Some(replayed) => Ok((replayed, generation)),
            None => {
                state.pending_end = false;
                Ok((chunk, generation))
            }
        }
    }

    fn next_replayed(&self, state: &mut ReplayState) -> Option<AudioChunk> {
        if !state.replay_active || state.buffers.is_empty() {
            return None;
        }

        let mut bytes_to_seek = self
            .format
            .ticks_to_bytes(state.replay_offset.saturating_sub(state.buffer_start_offset));
        // Never split a 16-bit sample.
        if bytes_to_seek % 2 != 0 {
            bytes_to_seek += 1;
        }

        let mut index = 0;
        while index < state.buffers.len()
            && bytes_to_seek >= state.buffers[index].data.len() as u64
        {
            bytes_to_seek -= state.buffers[index].data.len() as u64;
            index += 1;
        }

        if index >= state.buffers.len() {
            // Everything buffered has been replayed.
            state.replay_active = false;
            return None;
        }

        let entry = &state.buffers[index];
        let data = entry.data.slice(bytes_to_seek as usize..);
        debug!(
            node_id = %self.id,
            serial_number = entry.serial_number,
            byte_offset = entry.byte_offset + bytes_to_seek,
            len = data.len(),
            "Replaying buffered audio"
        );
        state.replay_offset += self.format.bytes_to_ticks(data.len() as u64);
        if index == state.buffers.len() - 1 {
            state.replay_active = false;
        }
        Some(AudioChunk::new(data))
    }

    /// Arm replay from the last confirmed offset. No-op when nothing is
    /// buffered.
    pub fn replay(&self) {
        let mut state = self.state.lock();
        if state.buffers.is_empty() {
            return;
        }
        state.replay_active = true;
        state.replay_offset = state.last_shrink_offset;
        state.generation += 1;
    }

    /// Number of times replay has been armed.
    pub fn replay_generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Drop every buffered chunk that ends at or before `offset` ticks.
    pub fn shrink_buffers(&self, offset: u64) {
        let mut state = self.state.lock();
        if state.buffers.is_empty() {
            return;
        }
        state.last_shrink_offset = offset;

        let mut bytes_to_seek = self
            .format
            .ticks_to_bytes(offset.saturating_sub(state.buffer_start_offset));
        let mut dropped = 0;
        while dropped < state.buffers.len()
            && bytes_to_seek >= state.buffers[dropped].data.len() as u64
        {
            bytes_to_seek -= state.buffers[dropped].data.len() as u64;
            dropped += 1;
        }
        state.buffer_start_offset =
            offset.saturating_sub(self.format.bytes_to_ticks(bytes_to_seek));
        state.buffers.drain(..dropped);
    }

    pub fn is_replaying(&self) -> bool {
        self.state.lock().replay_active
    }

    /// Bytes currently held for replay.
    pub fn buffered_len(&self) -> usize {
        self.state
            .lock()
            .buffers
            .iter()
            .map(|entry| entry.data.len())
            .sum()
    }

    /// Free the buffer and detach the wrapped node.
    pub async fn detach(&self) -> Result<(), AudioError> {
        {
            let mut state = self.state.lock();
            state.buffers.clear();
            state.replay_active = false;
        }
        self.source.lock().await.detach().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedNode {
        chunks: VecDeque<Bytes>,
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AudioStreamNode for ScriptedNode {
        fn id(&self) -> &str {
            "node"
        }

        async fn read(&mut self) -> Result<AudioChunk, AudioError> {
            match self.chunks.pop_front() {
                Some(data) => {
                    self.reads.fetch_add(1, Ordering::SeqCst);
                    Ok(AudioChunk::new(data))
                }
                None => Ok(AudioChunk::end()),
            }
        }

        async fn detach(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    /// 1000 bytes per second: one byte is 10_000 ticks.
    fn format() -> AudioFormat {
        AudioFormat::pcm(500, 16, 1)
    }

    fn node_with_chunks() -> (ReplayableAudioNode, Arc<AtomicUsize>, Vec<Bytes>) {
        let chunks: Vec<Bytes> = (1u8..=3).map(|fill| Bytes::from(vec![fill; 100])).collect();
        let reads = Arc::new(AtomicUsize::new(0));
        let source = ScriptedNode {
            chunks: chunks.iter().cloned().collect(),
            reads: reads.clone(),
        };
        (ReplayableAudioNode::new(Box::new(source), format()), reads, chunks)
    }

    #[tokio::test]
    async fn test_replay_after_shrink_returns_unconfirmed_tail() {
        let (node, reads, chunks) = node_with_chunks();
        for _ in 0..3 {
            node.read().await.unwrap();
        }

        // 150 bytes in: halfway through chunk 2.
        node.shrink_buffers(1_500_000);
        assert_eq!(node.buffered_len(), 200);

        node.replay();
        let first = node.read().await.unwrap();
        assert_eq!(first.data, chunks[1].slice(50..));
        let second = node.read().await.unwrap();
        assert_eq!(second.data, chunks[2]);
        assert!(!node.is_replaying());

        // Replay done: next read goes to the source, which has ended.
        assert!(node.read().await.unwrap().is_end);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_replay_without_shrink_replays_everything() {
        let (node, _reads, chunks) = node_with_chunks();
        for _ in 0..3 {
            node.read().await.unwrap();
        }

        node.replay();
        for chunk in &chunks {
            assert_eq!(&node.read().await.unwrap().data, chunk);
        }
        assert!(!node.is_replaying());
    }

    #[tokio::test]
    async fn test_replay_twice_is_idempotent() {
        let (node, _reads, chunks) = node_with_chunks();
        for _ in 0..3 {
            node.read().await.unwrap();
        }
        node.shrink_buffers(1_500_000);

        for _ in 0..2 {
            node.replay();
            assert_eq!(node.read().await.unwrap().data, chunks[1].slice(50..));
            assert_eq!(node.read().await.unwrap().data, chunks[2]);
        }
    }

    #[tokio::test]
    async fn test_replay_on_empty_buffer_is_noop() {
        let (node, reads, chunks) = node_with_chunks();
        node.replay();
        assert!(!node.is_replaying());
        assert_eq!(node.read().await.unwrap().data, chunks[0]);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shrink_past_everything_empties_buffer() {
        let (node, _reads, _chunks) = node_with_chunks();
        for _ in 0..3 {
            node.read().await.unwrap();
        }
        node.shrink_buffers(5_000_000);
        assert_eq!(node.buffered_len(), 0);

        node.replay();
        assert!(!node.is_replaying());
    }

    #[tokio::test]
    async fn test_replay_seek_rounds_up_to_even_byte() {
        let (node, _reads, chunks) = node_with_chunks();
        for _ in 0..3 {
            node.read().await.unwrap();
        }
        // 151 bytes: replay starts on byte 152.
        node.shrink_buffers(1_510_000);
        node.replay();
        assert_eq!(node.read().await.unwrap().data, chunks[1].slice(52..));
    }

    struct ChannelNode {
        rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    }

    #[async_trait]
    impl AudioStreamNode for ChannelNode {
        fn id(&self) -> &str {
            "channel"
        }

        async fn read(&mut self) -> Result<AudioChunk, AudioError> {
            match self.rx.recv().await {
                Some(data) => Ok(AudioChunk::new(data)),
                None => Ok(AudioChunk::end()),
            }
        }

        async fn detach(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_replay_armed_during_pending_read_serves_replay_first() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let node = Arc::new(ReplayableAudioNode::new(Box::new(ChannelNode { rx }), format()));
        let chunks: Vec<Bytes> = (1u8..=3).map(|fill| Bytes::from(vec![fill; 100])).collect();

        tx.send(chunks[0].clone()).unwrap();
        tx.send(chunks[1].clone()).unwrap();
        node.read().await.unwrap();
        node.read().await.unwrap();

        let pending = tokio::spawn({
            let node = node.clone();
            async move { node.read().await }
        });
        tokio::task::yield_now().await;

        node.replay();
        tx.send(chunks[2].clone()).unwrap();

        assert_eq!(pending.await.unwrap().unwrap().data, chunks[0]);
        assert_eq!(node.read().await.unwrap().data, chunks[1]);
        assert_eq!(node.read().await.unwrap().data, chunks[2]);

        drop(tx);
        assert!(node.read().await.unwrap().is_end);
    }

    #[tokio::test]
    async fn test_generation_tracks_armed_replays() {
        let (node, _reads, chunks) = node_with_chunks();
        let (first, generation) = node.read_with_generation().await.unwrap();
        assert_eq!(first.data, chunks[0]);
        assert_eq!(generation, 0);

        node.replay();
        assert_eq!(node.replay_generation(), 1);
        let (replayed, generation) = node.read_with_generation().await.unwrap();
        assert_eq!(replayed.data, chunks[0]);
        assert_eq!(generation, 1);

        // Nothing buffered: no new generation.
        node.shrink_buffers(5_000_000);
        node.replay();
        assert_eq!(node.replay_generation(), 1);
    }
}
