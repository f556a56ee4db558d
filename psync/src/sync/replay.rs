//! ReplaySubject - broadcast with a bounded replay buffer
//!
//! Late subscribers first receive the buffered messages, then live ones.
//! The buffer is bounded; once full the oldest message is dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Live delivery capacity per subscriber
const LIVE_CAPACITY: usize = 64;

/// Multi-producer, multi-subscriber stream replaying its last `capacity` items
pub struct ReplaySubject<T: Clone> {
    buffer: Mutex<VecDeque<T>>,
    capacity: usize,
    tx: broadcast::Sender<T>,
}

impl<T: Clone> ReplaySubject<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `value`; returns the number of live subscribers reached
    pub fn next(&self, value: T) -> usize {
        let mut buffer = self.lock();
        if self.capacity > 0 {
            if buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(value.clone());
        }
        // Held across send: a subscriber sees each item replayed or live, never both
        self.tx.send(value).unwrap_or(0)
    }

    /// Subscribe, starting with the buffered items
    pub fn subscribe(&self) -> ReplayReceiver<T> {
        let buffer = self.lock();
        let rx = self.tx.subscribe();
        debug!(backlog = buffer.len(), "ReplaySubject::subscribe: called");
        ReplayReceiver {
            backlog: buffer.clone(),
            rx,
        }
    }

    /// Items currently held for late subscribers
    pub fn buffered(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscription to a [`ReplaySubject`]
pub struct ReplayReceiver<T: Clone> {
    backlog: VecDeque<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> ReplayReceiver<T> {
    /// Next item, or `None` once the subject is dropped
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(item) = self.backlog.pop_front() {
            return Some(item);
        }
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ReplayReceiver::recv: subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
