//! At-least-once processing on top of an append-only log with consumer
//! groups: a publisher appends entries, a group consumer reads and
//! acknowledges them, and a reclaimer takes over entries left pending by
//! consumers that stopped acknowledging.

pub mod group_consume;
pub mod log;
pub mod produce;
pub mod service;
pub mod utils;

pub use group_consume::{Delivery, EntryProcessor, GroupConsumer, LoggingProcessor, Reclaimer};
pub use log::{Entry, EntryId, FaultyLog, LogClient, LogError, LogOperation, MemoryLog, RedisLog};
pub use produce::Publisher;
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ClaimConfig, RunSummary, Shutdown,
    StopSignal, Supervisor,
};
pub use utils::CompletionCounter;
