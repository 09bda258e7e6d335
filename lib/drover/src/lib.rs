pub mod api;
pub mod channel;
pub mod cluster;
pub mod constants;
pub mod message;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod sink;
pub mod stats;

pub use api::{KeyProcessor, KeyProducer, KeyScheduler, OutputSink};
pub use channel::{MemChannel, RankChannel, TcpChannel};
pub use cluster::ClusterEnv;
pub use message::{Envelope, Tag, MASTER_RANK};
pub use pool::ThreadPool;
pub use processor::BatchProcessor;
pub use sink::{FileSink, MemorySink};
pub use stats::{BatchSummary, WorkerSummary};
