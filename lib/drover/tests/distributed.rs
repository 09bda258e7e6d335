//! End-to-end master/worker runs over the in-process transport, one thread
//! per rank.

use anyhow::Result;
use drover::{BatchProcessor, Envelope, KeyScheduler, MemChannel, MemorySink, RankChannel, Tag, ThreadPool};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct RunOutcome {
    sink: MemorySink,
    summary: drover::BatchSummary,
    processed_per_rank: Vec<u64>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// Spin up `world_size` ranks over MemChannel, schedule `keys` on the
/// master, process each key as `{key}:done` on the workers.
fn run_cluster(world_size: usize, keys: Vec<String>, key_delay: Option<Duration>) -> RunOutcome {
    init_tracing();
    let endpoints = MemChannel::cluster(world_size);
    let sink = MemorySink::new();
    let counters: Vec<Arc<AtomicU64>> = (0..world_size).map(|_| Arc::new(AtomicU64::new(0))).collect();

    let mut handles = Vec::new();
    let mut summary = None;
    for (rank, endpoint) in endpoints.into_iter().enumerate() {
        let keys = keys.clone();
        let sink = sink.clone();
        let counter = Arc::clone(&counters[rank]);
        let handle = thread::spawn(move || -> Result<Option<drover::BatchSummary>> {
            let channel = Arc::new(endpoint);
            let pool = Arc::new(ThreadPool::new(4));
            let processor = BatchProcessor::new(channel, pool);
            let producer = move |scheduler: &KeyScheduler| -> Result<()> {
                for key in &keys {
                    if let Some(delay) = key_delay {
                        thread::sleep(delay);
                    }
                    scheduler.schedule_key(key.clone());
                }
                Ok(())
            };
            let process = move |key: &str| -> Result<String> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{key}:done"))
            };
            processor.process_keys(producer, &process, || Ok(sink))?;
            processor.wait();
            if rank == 0 {
                Ok(Some(processor.summary()))
            } else {
                Ok(None)
            }
        });
        handles.push(handle);
    }
    for handle in handles {
        if let Some(s) = handle.join().unwrap().unwrap() {
            summary = Some(s);
        }
    }
    RunOutcome {
        sink,
        summary: summary.unwrap(),
        processed_per_rank: counters.iter().map(|c| c.load(Ordering::SeqCst)).collect(),
    }
}

#[test]
fn results_are_exactly_once() {
    let keys: Vec<String> = (0..50).map(|i| format!("key-{i}")).collect();
    let outcome = run_cluster(4, keys.clone(), None);

    let expected: HashSet<String> = keys.iter().map(|k| format!("{k}:done")).collect();
    let got = outcome.sink.snapshot();
    assert_eq!(got.len(), keys.len(), "no loss, no duplication");
    assert_eq!(got.iter().cloned().collect::<HashSet<_>>(), expected);

    assert_eq!(outcome.summary.keys_scheduled, 50);
    assert_eq!(outcome.summary.keys_dispatched, 50);
    assert_eq!(outcome.summary.results_received, 50);
    assert_eq!(outcome.summary.results_failed, 0);
}

#[test]
fn zero_keys_sends_one_exit_per_worker_and_no_work() {
    let outcome = run_cluster(3, Vec::new(), None);
    assert!(outcome.sink.is_empty());
    assert_eq!(outcome.summary.keys_dispatched, 0);
    assert_eq!(outcome.summary.exits_sent, 2);
    // The master never ran the processor, and no worker saw a key.
    assert!(outcome.processed_per_rank.iter().all(|&n| n == 0));
}

#[test]
fn three_keys_two_workers_permutation() {
    let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let outcome = run_cluster(3, keys, None);

    let mut got = outcome.sink.snapshot();
    got.sort();
    assert_eq!(got, vec!["a:done", "b:done", "c:done"]);
    assert_eq!(outcome.summary.exits_sent, 2);
}

#[test]
fn worker_processed_counts_sum_to_total() {
    let keys: Vec<String> = (0..40).map(|i| format!("k{i}")).collect();
    let outcome = run_cluster(5, keys, None);
    assert_eq!(outcome.processed_per_rank[0], 0);
    let total: u64 = outcome.processed_per_rank.iter().sum();
    assert_eq!(total, 40);
}

#[test]
fn ready_racing_slow_producer_is_still_served() {
    // Workers go READY immediately while the producer trickles keys in, so
    // READY repeatedly races the queue's empty->non-empty transition. Every
    // READY must still be answered with WORK or EXIT and the run must
    // complete.
    let keys: Vec<String> = (0..10).map(|i| format!("slow-{i}")).collect();
    let outcome = run_cluster(3, keys, Some(Duration::from_millis(15)));
    assert_eq!(outcome.sink.len(), 10);
    assert_eq!(outcome.summary.keys_dispatched, 10);
    assert_eq!(outcome.summary.exits_sent, 2);
}

#[test]
fn failed_keys_are_isolated_and_accounted() {
    let world_size = 3;
    let endpoints = MemChannel::cluster(world_size);
    let sink = MemorySink::new();

    let mut handles = Vec::new();
    let mut summary = None;
    for (rank, endpoint) in endpoints.into_iter().enumerate() {
        let sink = sink.clone();
        let handle = thread::spawn(move || -> Result<Option<drover::BatchSummary>> {
            let channel = Arc::new(endpoint);
            let pool = Arc::new(ThreadPool::new(2));
            let processor = BatchProcessor::new(channel, pool);
            let producer = |scheduler: &KeyScheduler| -> Result<()> {
                for key in ["good-1", "bad", "good-2"] {
                    scheduler.schedule_key(key);
                }
                Ok(())
            };
            let process = |key: &str| -> Result<String> {
                if key == "bad" {
                    anyhow::bail!("unprocessable key");
                }
                Ok(format!("{key}:ok"))
            };
            processor.process_keys(producer, &process, || Ok(sink))?;
            processor.wait();
            if rank == 0 {
                Ok(Some(processor.summary()))
            } else {
                Ok(None)
            }
        });
        handles.push(handle);
    }
    for handle in handles {
        if let Some(s) = handle.join().unwrap().unwrap() {
            summary = Some(s);
        }
    }
    let summary = summary.unwrap();

    let mut got = sink.snapshot();
    got.sort();
    assert_eq!(got, vec!["good-1:ok", "good-2:ok"]);
    assert_eq!(summary.keys_dispatched, 3);
    assert_eq!(summary.results_received, 2);
    assert_eq!(summary.results_failed, 1);
    assert_eq!(summary.exits_sent, 2);
}

/// In-process transport where every send to one rank fails, standing in for
/// a worker whose connection dropped.
struct DeadPeerChannel {
    inner: MemChannel,
    dead_rank: usize,
}

impl RankChannel for DeadPeerChannel {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        if dest == self.dead_rank {
            anyhow::bail!("connection reset by peer");
        }
        self.inner.send(dest, tag, payload)
    }

    fn probe(&self, source: Option<usize>, tag: Option<Tag>) -> Result<Envelope> {
        self.inner.probe(source, tag)
    }

    fn probe_timeout(&self, source: Option<usize>, tag: Option<Tag>, timeout: Duration) -> Result<Option<Envelope>> {
        self.inner.probe_timeout(source, tag, timeout)
    }

    fn recv(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.inner.recv(envelope)
    }
}

#[test]
fn unreachable_worker_is_written_off_and_run_still_drains() {
    init_tracing();
    let mut endpoints = MemChannel::cluster(3).into_iter();
    let master_endpoint = endpoints.next().unwrap();
    let worker_endpoint = endpoints.next().unwrap();
    let silent_endpoint = endpoints.next().unwrap();
    let sink = MemorySink::new();

    // Rank 2 announces itself once and then goes dark; the master's replies
    // to it all fail. Its consumed READY must not wedge the run.
    silent_endpoint.send(0, Tag::Ready, &[]).unwrap();

    let master = {
        let sink = sink.clone();
        thread::spawn(move || -> Result<drover::BatchSummary> {
            let channel = Arc::new(DeadPeerChannel { inner: master_endpoint, dead_rank: 2 });
            let pool = Arc::new(ThreadPool::new(2));
            let processor = BatchProcessor::new(channel, pool);
            let producer = |scheduler: &KeyScheduler| -> Result<()> {
                for i in 0..5 {
                    scheduler.schedule_key(format!("key-{i}"));
                }
                Ok(())
            };
            let process = |_key: &str| -> Result<String> { unreachable!("rank 0 never processes keys") };
            processor.process_keys(producer, &process, || Ok(sink))?;
            processor.wait();
            Ok(processor.summary())
        })
    };
    let worker = thread::spawn(move || -> Result<()> {
        let channel = Arc::new(worker_endpoint);
        let pool = Arc::new(ThreadPool::new(2));
        let processor = BatchProcessor::new(channel, pool);
        let producer = |_scheduler: &KeyScheduler| -> Result<()> { Ok(()) };
        let process = |key: &str| -> Result<String> { Ok(format!("{key}:done")) };
        processor.process_keys(producer, &process, || Ok(MemorySink::new()))
    });

    let summary = master.join().unwrap().unwrap();
    worker.join().unwrap().unwrap();

    // Every key ends up processed by the live worker, dispatched exactly
    // once each, and the dead rank counts as released.
    let mut got = sink.snapshot();
    got.sort();
    let expected: Vec<String> = (0..5).map(|i| format!("key-{i}:done")).collect();
    assert_eq!(got, expected);
    assert_eq!(summary.keys_dispatched, 5);
    assert_eq!(summary.results_received, 5);
    assert_eq!(summary.results_failed, 0);
    assert_eq!(summary.exits_sent, 2);
}

#[test]
fn single_rank_group_is_rejected() {
    let endpoints = MemChannel::cluster(1);
    let channel = Arc::new(endpoints.into_iter().next().unwrap());
    let pool = Arc::new(ThreadPool::new(1));
    let processor = BatchProcessor::new(channel, pool);
    let producer = |_scheduler: &KeyScheduler| -> Result<()> { Ok(()) };
    let process = |_key: &str| -> Result<String> { Ok(String::new()) };
    let err = processor
        .process_keys(producer, &process, || Ok(MemorySink::new()))
        .unwrap_err();
    assert!(err.to_string().contains("at least two ranks"));
}
