//! Abstraction over the message-passing substrate between ranks, plus two
//! implementations: an in-process mesh for tests and single-host runs, and a
//! TCP star topology for real process groups.
//!
//! A probe reports the metadata of a matching queued message without
//! consuming it, so two tasks can wait on the same endpoint for different
//! tags (the master's result loop and dispatch loop do exactly that).

use crate::cluster::ClusterEnv;
use crate::constants::{DEFAULT_CONNECT_RETRY_MS, DEFAULT_CONNECT_TIMEOUT_MS, ENV_CONNECT_TIMEOUT_MS};
use crate::message::{encode_frame, read_frame, Envelope, Tag, MASTER_RANK};
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Tagged point-to-point messaging between the processes of a rank group.
pub trait RankChannel: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Send `payload` to `dest` under `tag`.
    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Block until a message matching the filters is queued and return its
    /// metadata without consuming it. `None` filters match anything.
    fn probe(&self, source: Option<usize>, tag: Option<Tag>) -> Result<Envelope>;

    /// As `probe`, but give up after `timeout` and return `Ok(None)`.
    fn probe_timeout(&self, source: Option<usize>, tag: Option<Tag>, timeout: Duration) -> Result<Option<Envelope>>;

    /// Consume the message described by a previously probed envelope and
    /// return its payload. Errors if the payload size does not match.
    fn recv(&self, envelope: &Envelope) -> Result<Vec<u8>>;
}

struct InboxMessage {
    source: usize,
    tag: Tag,
    payload: Vec<u8>,
}

/// Queue of undelivered messages for one endpoint. Senders (peer endpoints
/// or reader threads) push; probes scan without removing; recv removes.
struct Inbox {
    queue: Mutex<VecDeque<InboxMessage>>,
    available: Condvar,
}

impl Inbox {
    fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), available: Condvar::new() }
    }

    fn push(&self, message: InboxMessage) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(message);
        // Multiple probers may be filtering on different tags.
        self.available.notify_all();
    }

    fn find(queue: &VecDeque<InboxMessage>, source: Option<usize>, tag: Option<Tag>) -> Option<Envelope> {
        queue
            .iter()
            .find(|m| source.map_or(true, |s| m.source == s) && tag.map_or(true, |t| m.tag == t))
            .map(|m| Envelope { source: m.source, tag: m.tag, len: m.payload.len() })
    }

    fn probe(&self, source: Option<usize>, tag: Option<Tag>) -> Envelope {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(envelope) = Self::find(&queue, source, tag) {
                return envelope;
            }
            queue = self.available.wait(queue).unwrap();
        }
    }

    fn probe_timeout(&self, source: Option<usize>, tag: Option<Tag>, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(envelope) = Self::find(&queue, source, tag) {
                return Some(envelope);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self.available.wait_timeout(queue, remaining).unwrap();
            queue = guard;
            if result.timed_out() {
                return Self::find(&queue, source, tag);
            }
        }
    }

    fn take(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let mut queue = self.queue.lock().unwrap();
        let position = queue
            .iter()
            .position(|m| m.source == envelope.source && m.tag == envelope.tag)
            .with_context(|| format!("no queued message from rank {} with tag {:?}", envelope.source, envelope.tag))?;
        let message = queue.remove(position).unwrap();
        if message.payload.len() != envelope.len {
            bail!(
                "payload size mismatch from rank {}: expected {} bytes, got {}",
                envelope.source,
                envelope.len,
                message.payload.len()
            );
        }
        Ok(message.payload)
    }
}

// ============== In-process transport ==============

/// One endpoint of an in-process rank group. All endpoints share each
/// other's inboxes; `send` is a direct push into the destination's queue.
pub struct MemChannel {
    rank: usize,
    inboxes: Vec<Arc<Inbox>>,
}

impl MemChannel {
    /// Build a fully-wired group of `world_size` endpoints, index = rank.
    pub fn cluster(world_size: usize) -> Vec<MemChannel> {
        let inboxes: Vec<Arc<Inbox>> = (0..world_size).map(|_| Arc::new(Inbox::new())).collect();
        (0..world_size)
            .map(|rank| MemChannel { rank, inboxes: inboxes.clone() })
            .collect()
    }
}

impl RankChannel for MemChannel {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.inboxes.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        let inbox = self.inboxes.get(dest).with_context(|| format!("no such rank {dest}"))?;
        inbox.push(InboxMessage { source: self.rank, tag, payload: payload.to_vec() });
        Ok(())
    }

    fn probe(&self, source: Option<usize>, tag: Option<Tag>) -> Result<Envelope> {
        Ok(self.inboxes[self.rank].probe(source, tag))
    }

    fn probe_timeout(&self, source: Option<usize>, tag: Option<Tag>, timeout: Duration) -> Result<Option<Envelope>> {
        Ok(self.inboxes[self.rank].probe_timeout(source, tag, timeout))
    }

    fn recv(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.inboxes[self.rank].take(envelope)
    }
}

// ============== TCP transport ==============

/// Star topology over TCP: the master accepts one connection per worker;
/// workers hold a single connection to the master. One reader thread per
/// connection decodes frames into the local inbox.
pub struct TcpChannel {
    rank: usize,
    world_size: usize,
    inbox: Arc<Inbox>,
    peers: HashMap<usize, Mutex<TcpStream>>,
    readers: Vec<thread::JoinHandle<()>>,
}

impl TcpChannel {
    /// Construct the endpoint this process should be, per the cluster env.
    /// Any failure here is fatal for the run.
    pub fn from_env(env: &ClusterEnv) -> Result<TcpChannel> {
        if env.rank == MASTER_RANK {
            Self::master(&env.master_addr, env.world_size)
        } else {
            Self::worker(&env.master_addr, env.rank, env.world_size)
        }
    }

    /// Bind `addr` and accept `world_size - 1` worker connections, each
    /// opening with a 4-byte little-endian rank handshake.
    pub fn master(addr: &str, world_size: usize) -> Result<TcpChannel> {
        let listener = TcpListener::bind(addr).with_context(|| format!("binding master address {addr}"))?;
        info!(addr, world_size, "master waiting for worker connections");

        let inbox = Arc::new(Inbox::new());
        let mut peers = HashMap::new();
        let mut readers = Vec::new();
        for _ in 0..world_size.saturating_sub(1) {
            let (mut stream, peer_addr) = listener.accept().context("accepting worker connection")?;
            let mut handshake = [0u8; 4];
            stream
                .read_exact(&mut handshake)
                .with_context(|| format!("reading rank handshake from {peer_addr}"))?;
            let rank = u32::from_le_bytes(handshake) as usize;
            if rank == MASTER_RANK || rank >= world_size {
                bail!("peer {peer_addr} claimed invalid rank {rank} (world size {world_size})");
            }
            if peers.contains_key(&rank) {
                bail!("peer {peer_addr} claimed rank {rank}, already connected");
            }
            stream.set_nodelay(true).ok();
            let reader_stream = stream.try_clone().context("cloning worker stream")?;
            readers.push(spawn_reader(rank, reader_stream, Arc::clone(&inbox)));
            debug!(rank, %peer_addr, "worker connected");
            peers.insert(rank, Mutex::new(stream));
        }
        info!(workers = peers.len(), "all workers connected");
        Ok(TcpChannel { rank: MASTER_RANK, world_size, inbox, peers, readers })
    }

    /// Connect to the master, retrying while it comes up, and identify
    /// ourselves with the rank handshake.
    pub fn worker(addr: &str, rank: usize, world_size: usize) -> Result<TcpChannel> {
        if rank == MASTER_RANK || rank >= world_size {
            bail!("invalid worker rank {rank} for world size {world_size}");
        }
        let timeout = std::env::var(ENV_CONNECT_TIMEOUT_MS)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        let deadline = Instant::now() + Duration::from_millis(timeout);
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(addr, "master not reachable yet ({e}), retrying");
                    thread::sleep(Duration::from_millis(DEFAULT_CONNECT_RETRY_MS));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("connecting to master at {addr} (rank {rank})"));
                }
            }
        };
        stream.set_nodelay(true).ok();
        stream
            .write_all(&(rank as u32).to_le_bytes())
            .context("sending rank handshake")?;

        let inbox = Arc::new(Inbox::new());
        let reader_stream = stream.try_clone().context("cloning master stream")?;
        let readers = vec![spawn_reader(MASTER_RANK, reader_stream, Arc::clone(&inbox))];
        let mut peers = HashMap::new();
        peers.insert(MASTER_RANK, Mutex::new(stream));
        info!(rank, addr, "connected to master");
        Ok(TcpChannel { rank, world_size, inbox, peers, readers })
    }
}

impl RankChannel for TcpChannel {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        let stream = self
            .peers
            .get(&dest)
            .with_context(|| format!("no connection to rank {dest} from rank {}", self.rank))?;
        let frame = encode_frame(tag, payload);
        let mut stream = stream.lock().unwrap();
        stream
            .write_all(&frame)
            .with_context(|| format!("sending {:?} to rank {dest}", tag))
    }

    fn probe(&self, source: Option<usize>, tag: Option<Tag>) -> Result<Envelope> {
        Ok(self.inbox.probe(source, tag))
    }

    fn probe_timeout(&self, source: Option<usize>, tag: Option<Tag>, timeout: Duration) -> Result<Option<Envelope>> {
        Ok(self.inbox.probe_timeout(source, tag, timeout))
    }

    fn recv(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.inbox.take(envelope)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        for stream in self.peers.values() {
            let _ = stream.lock().unwrap().shutdown(Shutdown::Both);
        }
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_reader(source: usize, stream: TcpStream, inbox: Arc<Inbox>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        loop {
            match read_frame(&mut reader) {
                Ok((tag, payload)) => inbox.push(InboxMessage { source, tag, payload }),
                Err(e) => {
                    // Framing is lost after a bad header, so the connection
                    // is dropped rather than resynchronized.
                    if is_eof(&e) {
                        debug!(source, "peer connection closed");
                    } else {
                        error!(source, "dropping connection after frame error: {e:#}");
                    }
                    break;
                }
            }
        }
    })
}

fn is_eof(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<std::io::Error>()
        .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}
