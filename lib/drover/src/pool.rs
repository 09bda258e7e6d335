//! Fixed-size worker pool with a single dispatcher thread and a completion
//! barrier.
//!
//! `schedule` never blocks the caller; `wait` blocks until every task
//! scheduled so far (including tasks scheduled transitively by running
//! tasks) has finished. The dispatcher matches each task to exactly one idle
//! worker: workers hand their id back through a bounded token channel when
//! they finish, and the dispatcher takes one token per task.

use crate::constants::ENV_POOL_THREADS;
use crossbeam_channel as channel;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerCommand {
    Run(Task),
    Shutdown,
}

/// Count of tasks queued or running, with a condvar for the `wait` barrier.
struct Pending {
    count: Mutex<u64>,
    drained: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

pub struct ThreadPool {
    task_tx: Option<channel::Sender<Task>>,
    slots: Vec<channel::Sender<WorkerCommand>>,
    pending: Arc<Pending>,
    dispatcher: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `num_threads` workers plus one dispatcher thread, all idle.
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "pool needs at least one worker thread");

        let (task_tx, task_rx) = channel::unbounded::<Task>();
        let (idle_tx, idle_rx) = channel::bounded::<usize>(num_threads);
        let pending = Arc::new(Pending { count: Mutex::new(0), drained: Condvar::new() });

        let mut slots = Vec::with_capacity(num_threads);
        let mut workers = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            let (slot_tx, slot_rx) = channel::bounded::<WorkerCommand>(1);
            let idle_tx = idle_tx.clone();
            let pending = Arc::clone(&pending);
            workers.push(thread::spawn(move || worker_loop(id, slot_rx, idle_tx, pending)));
            slots.push(slot_tx);
        }
        // Every worker starts out idle.
        for id in 0..num_threads {
            idle_tx.send(id).expect("seeding idle worker tokens");
        }

        let dispatcher_slots = slots.clone();
        let dispatcher = thread::spawn(move || dispatcher_loop(task_rx, idle_rx, dispatcher_slots));

        Self { task_tx: Some(task_tx), slots, pending, dispatcher: Some(dispatcher), workers }
    }

    /// Pool sized from `DROVER_POOL_THREADS`, falling back to the CPU count.
    pub fn from_env() -> Self {
        let threads = std::env::var(ENV_POOL_THREADS)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or_else(num_cpus::get)
            .max(1);
        Self::new(threads)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Enqueue a task for execution. Never blocks.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.increment();
        let sent = match &self.task_tx {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        };
        if !sent {
            // Dispatcher is gone; only reachable mid-teardown.
            self.pending.decrement();
            error!("task scheduled on a shut-down pool, dropped");
        }
    }

    /// Block until every task scheduled before this call, and every task
    /// those tasks scheduled while running, has finished.
    pub fn wait(&self) {
        self.pending.wait_drained();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.wait();
        // Disconnect the task channel so the dispatcher's recv fails and it
        // exits, then release each worker from its slot.
        self.task_tx.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.join() {
                error!("joining pool dispatcher: {:?}", e);
            }
        }
        for slot in &self.slots {
            let _ = slot.send(WorkerCommand::Shutdown);
        }
        for (id, handle) in self.workers.drain(..).enumerate() {
            if let Err(e) = handle.join() {
                error!(worker = id, "joining pool worker: {:?}", e);
            }
        }
    }
}

fn dispatcher_loop(
    task_rx: channel::Receiver<Task>,
    idle_rx: channel::Receiver<usize>,
    slots: Vec<channel::Sender<WorkerCommand>>,
) {
    // One task, one idle token, one assignment.
    while let Ok(task) = task_rx.recv() {
        let worker = match idle_rx.recv() {
            Ok(id) => id,
            Err(_) => break,
        };
        if slots[worker].send(WorkerCommand::Run(task)).is_err() {
            break;
        }
    }
    debug!("pool dispatcher exiting");
}

fn worker_loop(
    id: usize,
    slot_rx: channel::Receiver<WorkerCommand>,
    idle_tx: channel::Sender<usize>,
    pending: Arc<Pending>,
) {
    while let Ok(command) = slot_rx.recv() {
        match command {
            WorkerCommand::Run(task) => {
                if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    error!(worker = id, "pool task panicked: {:?}", cause);
                }
                pending.decrement();
                if idle_tx.send(id).is_err() {
                    break;
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn wait_observes_side_effects() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn single_worker_runs_serially() {
        let pool = ThreadPool::new(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let completed = Arc::clone(&completed);
            pool.schedule(move || {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(completed.load(Ordering::SeqCst), 100);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_leaves_pool_alive() {
        let pool = ThreadPool::new(2);
        pool.schedule(|| panic!("task blew up"));
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            pool.schedule(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // Pool still dispatches after the panic.
        {
            let ran = Arc::clone(&ran);
            pool.schedule(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_covers_transitively_scheduled_tasks() {
        let pool = Arc::new(ThreadPool::new(2));
        let flag = Arc::new(AtomicUsize::new(0));
        {
            let inner_pool = Arc::clone(&pool);
            let flag = Arc::clone(&flag);
            pool.schedule(move || {
                thread::sleep(Duration::from_millis(10));
                let flag = Arc::clone(&flag);
                inner_pool.schedule(move || {
                    flag.store(1, Ordering::SeqCst);
                });
            });
        }
        pool.wait();
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }
}
