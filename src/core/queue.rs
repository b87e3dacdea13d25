//! Ordered async queue.
//!
//! FIFO of values that may not be resolved yet. `dequeue` suspends until the
//! next slot is available and then waits for that slot's value, so results
//! are delivered in enqueue order even when later producers finish first.
//! Draining rejects every waiting consumer and hands every ready item to a
//! disposal callback exactly once.

use std::collections::VecDeque;
use std::future::Future;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue drained: {0}")]
    Drained(String),

    #[error("producer dropped before resolving its slot")]
    ProducerDropped,
}

enum Slot<T> {
    Ready(Result<T, QueueError>),
    Pending(oneshot::Receiver<Result<T, QueueError>>),
}

impl<T> Slot<T> {
    async fn resolve(self) -> Result<T, QueueError> {
        match self {
            Slot::Ready(result) => result,
            Slot::Pending(receiver) => receiver.await.unwrap_or(Err(QueueError::ProducerDropped)),
        }
    }
}

struct QueueState<T> {
    slots: VecDeque<Slot<T>>,
    waiters: VecDeque<oneshot::Sender<Slot<T>>>,
    drained: Option<String>,
}

pub struct OrderedQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T: Send + 'static> OrderedQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                slots: VecDeque::new(),
                waiters: VecDeque::new(),
                drained: None,
            }),
        }
    }

    pub fn enqueue(&self, value: T) -> Result<(), QueueError> {
        self.push(Slot::Ready(Ok(value)))
    }

    /// Reserve the next slot for the output of `future`. The slot keeps its
    /// position in the queue while the future runs on its own task.
    pub fn enqueue_from_future<F>(&self, future: F) -> Result<(), QueueError>
    where
        F: Future<Output = Result<T, QueueError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push(Slot::Pending(rx))?;
        tokio::spawn(async move {
            let _ = tx.send(future.await);
        });
        Ok(())
    }

    fn push(&self, mut slot: Slot<T>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.drained {
            return Err(QueueError::Drained(reason.clone()));
        }
        // Hand the slot straight to the oldest live waiter.
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(slot) {
                Ok(()) => return Ok(()),
                Err(returned) => slot = returned,
            }
        }
        state.slots.push_back(slot);
        Ok(())
    }

    pub async fn dequeue(&self) -> Result<T, QueueError> {
        let waiting = {
            let mut state = self.state.lock();
            match state.slots.pop_front() {
                Some(slot) => Ok(slot),
                None => {
                    if let Some(reason) = &state.drained {
                        return Err(QueueError::Drained(reason.clone()));
                    }
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Err(rx)
                }
            }
        };

        let slot = match waiting {
            Ok(slot) => slot,
            Err(rx) => rx
                .await
                .map_err(|_| QueueError::Drained("queue dropped".to_string()))?,
        };
        slot.resolve().await
    }

    /// Reject every waiting consumer with `reason` and pass every ready item
    /// to `dispose`. Pending producer slots are discarded. Later enqueues and
    /// dequeues fail with the same reason. Returns the number of consumers
    /// rejected; a second drain is a no-op returning zero.
    pub fn drain_and_dispose<F>(&self, mut dispose: F, reason: &str) -> usize
    where
        F: FnMut(T),
    {
        let (slots, waiters) = {
            let mut state = self.state.lock();
            if state.drained.is_some() {
                return 0;
            }
            state.drained = Some(reason.to_string());
            (
                std::mem::take(&mut state.slots),
                std::mem::take(&mut state.waiters),
            )
        };

        let mut rejected = 0;
        for waiter in waiters {
            let rejection = Slot::Ready(Err(QueueError::Drained(reason.to_string())));
            if waiter.send(rejection).is_ok() {
                rejected += 1;
            }
        }
        for slot in slots {
            if let Slot::Ready(Ok(item)) = slot {
                dispose(item);
            }
        }
        rejected
    }

    pub fn is_drained(&self) -> bool {
        self.state.lock().drained.is_some()
    }

    /// Number of slots not yet handed to a consumer.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
