//! Thread-safe FIFO of pending keys shared between the producer task and the
//! dispatch task on the master rank.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

struct QueueState {
    keys: VecDeque<String>,
    complete: bool,
}

/// Unbounded queue of keys plus a "scheduling complete" flag.
///
/// The queue is deliberately unbounded: `push` must never block the producer
/// task. A fast producer against slow workers grows memory without limit;
/// the total scheduled count is surfaced in the run summary so operators can
/// see the imbalance.
pub struct KeyQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    total_pushed: AtomicU64,
}

impl Default for KeyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState { keys: VecDeque::new(), complete: false }),
            available: Condvar::new(),
            total_pushed: AtomicU64::new(0),
        }
    }

    /// Enqueue a key. Never blocks.
    pub fn push(&self, key: String) {
        let mut state = self.state.lock().unwrap();
        state.keys.push_back(key);
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.available.notify_all();
    }

    /// Pop the next key, blocking until one is available or scheduling is
    /// complete and the queue has drained. `None` means no key will ever
    /// arrive again.
    pub fn next_key(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(key) = state.keys.pop_front() {
                return Some(key);
            }
            if state.complete {
                return None;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<String> {
        self.state.lock().unwrap().keys.pop_front()
    }

    /// Mark that the producer will push no further keys, waking any blocked
    /// `next_key` callers.
    pub fn mark_complete(&self) {
        let mut state = self.state.lock().unwrap();
        state.complete = true;
        self.available.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().complete
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().keys.len()
    }

    /// Total number of keys ever pushed.
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Relaxed)
    }
}
