//! Buffering core: the transaction assembler that turns raw parsed entries
//! into atomically-flushed transactions, and the bounded ring-buffer event
//! log that holds them until consumers acknowledge.

mod assembler;
mod event_log;

pub use assembler::{TransactionAssembler, TransactionSink};
pub use event_log::{EventLog, FetchedBatch};

/// Initial value of every ring sequence counter, meaning "nothing yet".
pub(crate) const INIT_SEQUENCE: i64 = -1;
