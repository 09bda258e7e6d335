//! Master/worker batch orchestration.
//!
//! Rank 0 coordinates: a producer task fills the key queue, a dispatch task
//! answers READY messages with WORK or EXIT, and a result-collection task
//! drains RESULT messages into the output sink. All three run on the local
//! thread pool, so `wait` is simply the pool's completion barrier. Every
//! other rank runs a synchronous pull loop on its calling thread:
//! READY -> WORK -> RESULT, until EXIT.

use crate::api::{KeyProcessor, KeyProducer, KeyScheduler, OutputSink};
use crate::channel::RankChannel;
use crate::constants::DEFAULT_RESULT_TICK_MS;
use crate::message::{Envelope, Tag, MASTER_RANK};
use crate::pool::ThreadPool;
use crate::queue::KeyQueue;
use crate::stats::{BatchSummary, WorkerSummary};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct RemoteStatus {
    ready: bool,
    exited: bool,
}

/// Shared master-side bookkeeping. One mutex per remote rank keeps the
/// result loop and the dispatch loop from contending on a single lock.
struct MasterState {
    queue: Arc<KeyQueue>,
    remotes: Vec<Mutex<RemoteStatus>>,
    keys_dispatched: AtomicU64,
    results_received: AtomicU64,
    results_failed: AtomicU64,
    exits_sent: AtomicUsize,
    started: Mutex<Option<Instant>>,
}

impl MasterState {
    fn new(world_size: usize) -> Self {
        let workers = world_size.saturating_sub(1);
        Self {
            queue: Arc::new(KeyQueue::new()),
            remotes: (0..workers).map(|_| Mutex::new(RemoteStatus::default())).collect(),
            keys_dispatched: AtomicU64::new(0),
            results_received: AtomicU64::new(0),
            results_failed: AtomicU64::new(0),
            exits_sent: AtomicUsize::new(0),
            started: Mutex::new(None),
        }
    }

    fn remote(&self, rank: usize) -> Option<&Mutex<RemoteStatus>> {
        rank.checked_sub(1).and_then(|i| self.remotes.get(i))
    }

    fn set_ready(&self, rank: usize, ready: bool) {
        if let Some(remote) = self.remote(rank) {
            remote.lock().unwrap().ready = ready;
        }
    }

    fn mark_exited(&self, rank: usize) {
        if let Some(remote) = self.remote(rank) {
            let mut status = remote.lock().unwrap();
            status.ready = true;
            status.exited = true;
        }
        self.exits_sent.fetch_add(1, Ordering::SeqCst);
    }

    /// Global-completion condition: scheduling finished, queue drained,
    /// every remote sent EXIT and known idle, every dispatched key answered.
    fn drained(&self) -> bool {
        self.queue.is_complete()
            && self.queue.is_empty()
            && self.remotes.iter().all(|r| {
                let status = r.lock().unwrap();
                status.exited && status.ready
            })
            && self.results_received.load(Ordering::SeqCst) + self.results_failed.load(Ordering::SeqCst)
                == self.keys_dispatched.load(Ordering::SeqCst)
    }

    fn summary(&self) -> BatchSummary {
        let wall_ms = self
            .started
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        BatchSummary {
            keys_scheduled: self.queue.total_pushed(),
            keys_dispatched: self.keys_dispatched.load(Ordering::SeqCst),
            results_received: self.results_received.load(Ordering::SeqCst),
            results_failed: self.results_failed.load(Ordering::SeqCst),
            exits_sent: self.exits_sent.load(Ordering::SeqCst),
            workers: self.remotes.len(),
            wall_ms,
        }
    }
}

pub struct BatchProcessor<C: RankChannel + 'static> {
    channel: Arc<C>,
    pool: Arc<ThreadPool>,
    state: Arc<MasterState>,
}

impl<C: RankChannel + 'static> BatchProcessor<C> {
    pub fn new(channel: Arc<C>, pool: Arc<ThreadPool>) -> Self {
        let state = Arc::new(MasterState::new(channel.world_size()));
        Self { channel, pool, state }
    }

    pub fn rank(&self) -> usize {
        self.channel.rank()
    }

    pub fn world_size(&self) -> usize {
        self.channel.world_size()
    }

    /// Run the batch. On rank 0 this schedules the master tasks on the pool
    /// and returns; call `wait` to block until global completion. On worker
    /// ranks it runs the pull loop to completion on the calling thread.
    pub fn process_keys<P, W, S, G>(&self, producer: P, processor: &W, get_sink: G) -> Result<()>
    where
        P: KeyProducer + 'static,
        W: KeyProcessor,
        S: OutputSink + 'static,
        G: FnOnce() -> Result<S>,
    {
        if self.world_size() < 2 {
            bail!(
                "batch processing requires at least two ranks (one master, one worker), got world size {}",
                self.world_size()
            );
        }
        if self.rank() == MASTER_RANK {
            self.master_routine(producer, get_sink)
        } else {
            self.worker_routine(processor)
        }
    }

    /// Block until every task on the pool has finished. On the master the
    /// orchestration tasks only finish once scheduling is complete, the key
    /// queue is drained, and every remote rank has been sent EXIT, so this
    /// is the global-completion barrier.
    pub fn wait(&self) {
        self.pool.wait();
        if self.rank() == MASTER_RANK && self.state.started.lock().unwrap().is_some() {
            let s = self.state.summary();
            debug_assert!(self.state.drained());
            info!(
                keys_scheduled = s.keys_scheduled,
                keys_dispatched = s.keys_dispatched,
                results_received = s.results_received,
                results_failed = s.results_failed,
                exits_sent = s.exits_sent,
                workers = s.workers,
                wall_ms = s.wall_ms,
                "batch run complete"
            );
        }
    }

    /// Master-side accounting, valid after `wait`.
    pub fn summary(&self) -> BatchSummary {
        self.state.summary()
    }

    fn master_routine<P, S, G>(&self, producer: P, get_sink: G) -> Result<()>
    where
        P: KeyProducer + 'static,
        S: OutputSink + 'static,
        G: FnOnce() -> Result<S>,
    {
        if self.pool.size() < 2 {
            // The result loop and the dispatch loop both run until global
            // completion; a single worker cannot host them concurrently.
            bail!(
                "master rank needs a pool of at least two threads, got {}",
                self.pool.size()
            );
        }
        *self.state.started.lock().unwrap() = Some(Instant::now());
        let sink = get_sink().context("obtaining output sink")?;
        let sink = Arc::new(Mutex::new(sink));
        info!(workers = self.world_size() - 1, "master starting batch run");

        // Task A: key production.
        {
            let queue = Arc::clone(&self.state.queue);
            self.pool.schedule(move || {
                let scheduler = KeyScheduler::new(Arc::clone(&queue));
                if let Err(e) = producer.produce_keys(&scheduler) {
                    error!("key producer failed, draining what was scheduled: {e:#}");
                }
                queue.mark_complete();
                debug!(keys = queue.total_pushed(), "key scheduling complete");
            });
        }

        // Task B: result collection.
        {
            let channel = Arc::clone(&self.channel);
            let state = Arc::clone(&self.state);
            self.pool.schedule(move || result_loop(channel, state, sink));
        }

        // Task C: work dispatch.
        {
            let channel = Arc::clone(&self.channel);
            let state = Arc::clone(&self.state);
            self.pool.schedule(move || dispatch_loop(channel, state));
        }

        Ok(())
    }

    fn worker_routine<W: KeyProcessor>(&self, processor: &W) -> Result<()> {
        let channel = &self.channel;
        let rank = channel.rank();
        let start = Instant::now();
        let mut processed: u64 = 0;
        let mut failed: u64 = 0;

        loop {
            channel
                .send(MASTER_RANK, Tag::Ready, &[])
                .context("sending ready signal to master")?;

            let envelope = match channel.probe(Some(MASTER_RANK), None) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(rank, "probing for next message: {e:#}");
                    continue;
                }
            };

            match envelope.tag {
                Tag::Exit => {
                    let _ = channel.recv(&envelope);
                    break;
                }
                Tag::Work => {
                    let payload = match channel.recv(&envelope) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(rank, "receiving work payload: {e:#}");
                            continue;
                        }
                    };
                    let key = match String::from_utf8(payload) {
                        Ok(key) => key,
                        Err(e) => {
                            error!(rank, "corrupt key payload: {e}");
                            failed += 1;
                            channel
                                .send(MASTER_RANK, Tag::Result, &[])
                                .context("reporting failed key to master")?;
                            continue;
                        }
                    };
                    let line = match processor.process_key(&key) {
                        Ok(line) => {
                            processed += 1;
                            line
                        }
                        Err(e) => {
                            // Failure stays isolated to this key; an empty
                            // RESULT keeps the master's accounting exact.
                            error!(rank, key = %key, "processing key failed: {e:#}");
                            failed += 1;
                            String::new()
                        }
                    };
                    channel
                        .send(MASTER_RANK, Tag::Result, line.as_bytes())
                        .context("sending result to master")?;
                }
                other => {
                    warn!(rank, tag = ?other, "unexpected message from master, discarding");
                    let _ = channel.recv(&envelope);
                }
            }
        }

        let summary = WorkerSummary { rank, processed, failed, wall_ms: start.elapsed().as_millis() as u64 };
        info!(
            rank = summary.rank,
            processed = summary.processed,
            failed = summary.failed,
            wall_ms = summary.wall_ms,
            "worker exiting"
        );
        Ok(())
    }
}

/// Task B. Polls for RESULT messages; the timeout lap is what lets the loop
/// notice that the run drained without any further result arriving (the
/// zero-key case in particular).
fn result_loop<C: RankChannel>(channel: Arc<C>, state: Arc<MasterState>, sink: Arc<Mutex<impl OutputSink>>) {
    let tick = Duration::from_millis(DEFAULT_RESULT_TICK_MS);
    loop {
        match channel.probe_timeout(None, Some(Tag::Result), tick) {
            Ok(Some(envelope)) => {
                let payload = match channel.recv(&envelope) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(source = envelope.source, "receiving result: {e:#}");
                        continue;
                    }
                };
                state.set_ready(envelope.source, true);
                if payload.is_empty() {
                    warn!(source = envelope.source, "worker reported a failed key");
                    state.results_failed.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                match String::from_utf8(payload) {
                    Ok(line) => {
                        state.results_received.fetch_add(1, Ordering::SeqCst);
                        let mut sink = sink.lock().unwrap();
                        if let Err(e) = sink.append(&line) {
                            error!(source = envelope.source, "writing result line: {e:#}");
                        }
                    }
                    Err(e) => {
                        error!(source = envelope.source, "discarding corrupt result payload: {e}");
                        state.results_failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            Ok(None) => {
                if state.drained() {
                    break;
                }
            }
            Err(e) => {
                error!("probing for results: {e:#}");
                thread::sleep(tick);
            }
        }
    }
    debug!("result collection finished");
}

/// Task C. Answers each READY with exactly one WORK or EXIT. The key is
/// popped under the queue lock at reply time, so no key is ever sent twice
/// for one READY; blocking inside `next_key` is how a READY that raced the
/// queue's empty->non-empty transition still gets served.
fn dispatch_loop<C: RankChannel>(channel: Arc<C>, state: Arc<MasterState>) {
    let workers = channel.world_size() - 1;
    while state.exits_sent.load(Ordering::SeqCst) < workers {
        let envelope = match channel.probe(None, Some(Tag::Ready)) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("probing for ready workers: {e:#}");
                continue;
            }
        };
        if let Err(e) = channel.recv(&envelope) {
            error!(source = envelope.source, "receiving ready signal: {e:#}");
            continue;
        }
        serve_ready(&*channel, &state, &envelope);
    }
    info!(workers, "all workers signaled to exit");
}

fn serve_ready<C: RankChannel>(channel: &C, state: &MasterState, envelope: &Envelope) {
    match state.queue.next_key() {
        Some(key) => match channel.send(envelope.source, Tag::Work, key.as_bytes()) {
            Ok(()) => {
                state.set_ready(envelope.source, false);
                state.keys_dispatched.fetch_add(1, Ordering::SeqCst);
                debug!(dest = envelope.source, queue_depth = state.queue.len(), "dispatched key");
            }
            Err(e) => {
                // An unreachable peer never sends another READY, so it is
                // written off here; the key goes back for a live worker.
                error!(dest = envelope.source, key = %key, "sending work failed, writing rank off: {e:#}");
                state.queue.push(key);
                state.mark_exited(envelope.source);
            }
        },
        None => {
            // Queue observed drained for good; release this worker. A send
            // failure still counts as released, or the run could never drain.
            if let Err(e) = channel.send(envelope.source, Tag::Exit, &[]) {
                error!(dest = envelope.source, "sending exit signal: {e:#}");
            } else {
                debug!(rank = envelope.source, "sent exit signal");
            }
            state.mark_exited(envelope.source);
        }
    }
}
