//! Change-data-capture pipeline core: transaction assembly, a bounded
//! ring-buffer event log with ack/rollback, and durable consumer-position
//! tracking.
//!
//! One producer task feeds parsed replication-log entries through a
//! [`TransactionAssembler`] into the [`EventLog`]; any number of consumers
//! pull contiguous batches out, confirming them strictly in order through
//! the [`ConsumerRegistry`]. Delivery is at-least-once with a bounded
//! redelivery window: a crashed consumer resumes from its last confirmed
//! cursor.

mod event;
mod meta;
mod service;
mod store;

pub use event::{
    ClientIdentity, EntryKind, EntryPosition, Event, EventHeader, EventType, LogPosition,
    PositionRange,
};
pub use meta::{
    ClientData, ConsumerRegistry, DestinationSnapshot, FailbackPositionManager, FileMetaStore,
    MemoryPositionManager, MetaPositionManager, PositionManager,
};
pub use service::{
    recovery_backoff, resume_position, setup_local_tracing, setup_tracing, AppError, AppResult,
    AssemblerConfig, Batch, BatchMode, LogSink, MetaConfig, PipelineConfig, PipelineService,
    Shutdown, StoreConfig, NO_BATCH_ID,
};
pub use store::{EventLog, FetchedBatch, TransactionAssembler, TransactionSink};
