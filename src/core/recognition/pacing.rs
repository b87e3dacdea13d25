//! Upload pacing.
//!
//! Audio is sent at no more than twice real time: after a chunk of `n`
//! bytes, the next send waits until `n / (2 * avg_bytes_per_sec)` seconds
//! have elapsed.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct UploadPacer {
    avg_bytes_per_sec: u32,
    next_send: Option<Instant>,
}

impl UploadPacer {
    pub fn new(avg_bytes_per_sec: u32) -> Self {
        Self {
            avg_bytes_per_sec,
            next_send: None,
        }
    }

    /// How long to wait before the next send. Never negative.
    pub fn delay(&self, now: Instant) -> Duration {
        match self.next_send {
            Some(next_send) => next_send.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn record_send(&mut self, payload_bytes: usize, now: Instant) {
        if self.avg_bytes_per_sec == 0 {
            return;
        }
        let seconds = payload_bytes as f64 / (2.0 * f64::from(self.avg_bytes_per_sec));
        self.next_send = Some(now + Duration::from_secs_f64(seconds));
    }
}
