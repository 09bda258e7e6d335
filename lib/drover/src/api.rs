use crate::queue::KeyQueue;
use anyhow::Result;
use std::sync::Arc;
use tracing::trace;

// ========== Core batch-processing traits ==========

/// Handle through which a `KeyProducer` feeds keys into the run. Pushing
/// never blocks; keys become visible to the dispatch loop immediately.
pub struct KeyScheduler {
    queue: Arc<KeyQueue>,
}

impl KeyScheduler {
    pub(crate) fn new(queue: Arc<KeyQueue>) -> Self {
        Self { queue }
    }

    pub fn schedule_key(&self, key: impl Into<String>) {
        let key = key.into();
        trace!(key = %key, "key scheduled");
        self.queue.push(key);
    }
}

/// Invoked exactly once, on the master rank, to enumerate the work. Expected
/// to call `scheduler.schedule_key` zero or more times before returning.
pub trait KeyProducer: Send {
    fn produce_keys(&self, scheduler: &KeyScheduler) -> Result<()>;
}

impl<F> KeyProducer for F
where
    F: Fn(&KeyScheduler) -> Result<()> + Send,
{
    fn produce_keys(&self, scheduler: &KeyScheduler) -> Result<()> {
        self(scheduler)
    }
}

/// Invoked once per received key on a worker rank. Should be a side-effect
/// free mapping from key to result line and must not block indefinitely.
pub trait KeyProcessor: Send + Sync {
    fn process_key(&self, key: &str) -> Result<String>;
}

impl<F> KeyProcessor for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn process_key(&self, key: &str) -> Result<String> {
        self(key)
    }
}

/// Destination for result lines on the master. The processor serializes all
/// appends behind a mutex, so lines from different workers never interleave.
pub trait OutputSink: Send {
    fn append(&mut self, line: &str) -> Result<()>;
}
