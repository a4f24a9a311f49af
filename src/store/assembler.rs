use tracing::trace;

use crate::event::{EntryKind, Event};
use crate::{AppError, AppResult};

use super::INIT_SEQUENCE;

/// Downstream of the assembler: receives one complete transaction per call,
/// in flush order, on the producer task. Returning `Ok(false)` or an error
/// rejects the batch; the assembler then keeps its counters unchanged so the
/// caller can `reset` and replay.
pub trait TransactionSink: Send + Sync {
    async fn sink(&self, events: Vec<Event>) -> AppResult<bool>;
}

/// Single-producer staging ring that groups raw parsed entries into complete
/// transactions before they reach the event log.
///
/// Two counters, both starting at -1: `put_seq` is the last written slot,
/// `flush_seq` the last slot delivered downstream. The window
/// `(flush_seq, put_seq]` is the transaction currently being assembled.
/// Exactly one parser task drives this type, so no interior locking.
pub struct TransactionAssembler<S: TransactionSink> {
    entries: Vec<Option<Event>>,
    index_mask: i64,
    buffer_size: usize,
    put_seq: i64,
    flush_seq: i64,
    sink: S,
}

impl<S: TransactionSink> TransactionAssembler<S> {
    pub fn new(buffer_size: usize, sink: S) -> Self {
        assert!(
            buffer_size.is_power_of_two(),
            "assembler buffer size must be a power of two"
        );
        Self {
            entries: vec![None; buffer_size],
            index_mask: buffer_size as i64 - 1,
            buffer_size,
            put_seq: INIT_SEQUENCE,
            flush_seq: INIT_SEQUENCE,
            sink,
        }
    }

    /// Feed one parsed entry. Transaction boundaries decide when the staged
    /// window is handed downstream:
    /// - a begin first flushes whatever is pending, so two transactions are
    ///   never mixed in one delivery;
    /// - an end or heartbeat closes the window immediately;
    /// - row data is staged, except DDL which is flushed on the spot so it
    ///   never travels together with surrounding DML.
    pub async fn add(&mut self, event: Event) -> AppResult<()> {
        match event.kind {
            EntryKind::TransactionBegin => {
                self.flush().await?;
                self.put(event).await?;
            }
            EntryKind::TransactionEnd | EntryKind::Heartbeat => {
                self.put(event).await?;
                self.flush().await?;
            }
            EntryKind::RowData => {
                let is_ddl = event.is_ddl();
                self.put(event).await?;
                if is_ddl {
                    self.flush().await?;
                }
            }
        }
        Ok(())
    }

    /// Delivers the staged window `(flush_seq, put_seq]` downstream as one
    /// ordered transaction. The sink runs synchronously on this task, so a
    /// slow event log directly backpressures the parser.
    pub async fn flush(&mut self) -> AppResult<()> {
        let start = self.flush_seq + 1;
        let end = self.put_seq;
        if start > end {
            return Ok(());
        }

        let mut events = Vec::with_capacity((end - start + 1) as usize);
        for seq in start..=end {
            let event = self.entries[self.index_of(seq)]
                .as_ref()
                .ok_or_else(|| {
                    AppError::IllegalState(format!("assembler slot {} is empty", seq))
                })?
                .clone();
            events.push(event);
        }

        trace!("flushing {} staged events through sink", events.len());
        if !self.sink.sink(events).await? {
            return Err(AppError::SinkFailure(
                "transaction sink rejected flush".to_string(),
            ));
        }
        self.flush_seq = end;
        Ok(())
    }

    /// Discards all staged state after an upstream restart. The backing
    /// array is left as-is; stale slots are overwritten on the next put.
    pub fn reset(&mut self) {
        self.put_seq = INIT_SEQUENCE;
        self.flush_seq = INIT_SEQUENCE;
    }

    async fn put(&mut self, event: Event) -> AppResult<()> {
        if self.check_free_slot(self.put_seq + 1) {
            let next = self.put_seq + 1;
            let index = self.index_of(next);
            self.entries[index] = Some(event);
            self.put_seq = next;
            Ok(())
        } else {
            // a full ring means a transaction larger than the ring: flush the
            // partial window and continue staging
            self.flush().await?;
            let next = self.put_seq + 1;
            let index = self.index_of(next);
            self.entries[index] = Some(event);
            self.put_seq = next;
            Ok(())
        }
    }

    fn check_free_slot(&self, seq: i64) -> bool {
        seq - self.buffer_size as i64 <= self.flush_seq
    }

    fn index_of(&self, seq: i64) -> usize {
        (seq & self.index_mask) as usize
    }
}
