use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::event::{EntryPosition, Event, PositionRange};
use crate::service::{BatchMode, StoreConfig};
use crate::{AppError, AppResult};

use super::INIT_SEQUENCE;

/// Result of one `get`: a contiguous slice of the log plus its window
/// description. `range` is `None` exactly when `events` is empty.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub events: Vec<Event>,
    pub range: Option<PositionRange>,
}

impl FetchedBatch {
    fn empty() -> Self {
        Self {
            events: Vec::new(),
            range: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Counters and slots guarded by the one coarse mutex. Plain integers under
/// a lock rather than atomics: put/get are already rate-limited by
/// transaction granularity, so contention is not the bottleneck here.
struct LogState {
    entries: Vec<Option<Event>>,
    /// last written slot
    put_seq: i64,
    /// last slot handed to a consumer
    get_seq: i64,
    /// last slot released by an ack
    ack_seq: i64,
    /// accumulated payload bytes, same roles as the sequence counters
    put_mem: u64,
    get_mem: u64,
    ack_mem: u64,
}

/// The bounded concurrent event store: single source of truth for buffered,
/// not-yet-acknowledged change events.
///
/// Invariant at all times: `ack_seq <= get_seq <= put_seq`. Waiting is done
/// on two notify handles standing in for the classic notFull/notEmpty
/// condition variables; the lock is never held across an await point.
pub struct EventLog {
    buffer_size: usize,
    index_mask: i64,
    buffer_mem_unit: usize,
    batch_mode: BatchMode,
    ddl_isolation: bool,
    gtid_mode: bool,
    state: Mutex<LogState>,
    not_full: Notify,
    not_empty: Notify,
}

impl EventLog {
    pub fn new(config: &StoreConfig) -> Self {
        assert!(
            config.buffer_size.is_power_of_two(),
            "event log buffer size must be a power of two"
        );
        Self {
            buffer_size: config.buffer_size,
            index_mask: config.buffer_size as i64 - 1,
            buffer_mem_unit: config.buffer_mem_unit,
            batch_mode: config.batch_mode,
            ddl_isolation: config.ddl_isolation,
            gtid_mode: config.gtid_mode,
            state: Mutex::new(LogState {
                entries: vec![None; config.buffer_size],
                put_seq: INIT_SEQUENCE,
                get_seq: INIT_SEQUENCE,
                ack_seq: INIT_SEQUENCE,
                put_mem: 0,
                get_mem: 0,
                ack_mem: 0,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    // ---------------------------- put ----------------------------

    /// Appends one flushed transaction, blocking while the ring (or, in
    /// memory mode, the byte quota) is exhausted.
    pub async fn put(&self, events: Vec<Event>) {
        let mut pending = events;
        if pending.is_empty() {
            return;
        }
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.put_if_free(&mut pending) {
                return;
            }
            notified.await;
        }
    }

    /// Non-blocking put; `false` means the caller keeps its events.
    pub fn try_put(&self, events: Vec<Event>) -> bool {
        let mut pending = events;
        if pending.is_empty() {
            return true;
        }
        self.put_if_free(&mut pending)
    }

    /// Blocking put bounded by `timeout`; `false` on expiry, with the log
    /// untouched (no partial writes).
    pub async fn put_timeout(&self, events: Vec<Event>, timeout: Duration) -> bool {
        let mut pending = events;
        if pending.is_empty() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.put_if_free(&mut pending) {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.put_if_free(&mut pending);
            }
        }
    }

    fn put_if_free(&self, pending: &mut Vec<Event>) -> bool {
        let mut state = self.state.lock();
        if !self.check_free_slots(&state, pending.len()) {
            return false;
        }
        let events = std::mem::take(pending);
        let base = state.put_seq;
        for (i, event) in events.into_iter().enumerate() {
            state.put_mem += event.raw_len as u64;
            let index = self.index_of(base + 1 + i as i64);
            state.entries[index] = Some(event);
            state.put_seq = base + 1 + i as i64;
        }
        trace!("put advanced to seq {}", state.put_seq);
        drop(state);
        self.not_empty.notify_waiters();
        true
    }

    /// Free-slot rule: the write may not lap the slowest of the read and ack
    /// cursors, and in memory mode the unacked bytes must stay under
    /// `buffer_size * buffer_mem_unit`.
    fn check_free_slots(&self, state: &LogState, count: usize) -> bool {
        let wrap_point = state.put_seq + count as i64 - self.buffer_size as i64;
        if wrap_point > state.get_seq.min(state.ack_seq) {
            return false;
        }
        if self.batch_mode.is_mem_size() {
            let occupied = state.put_mem - state.ack_mem;
            if occupied >= (self.buffer_size * self.buffer_mem_unit) as u64 {
                return false;
            }
        }
        true
    }

    // ---------------------------- get ----------------------------

    /// Blocks until a full batch (by entry count, or by byte quota in memory
    /// mode) is available, then returns it.
    pub async fn get(&self, start: Option<&EntryPosition>, batch_size: usize) -> FetchedBatch {
        let batch_size = batch_size.max(1);
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if self.check_readable(&state, start, batch_size) {
                    return self.do_get(&mut state, start, batch_size);
                }
            }
            notified.await;
        }
    }

    /// Returns whatever is buffered right now, possibly nothing.
    pub fn try_get(&self, start: Option<&EntryPosition>, batch_size: usize) -> FetchedBatch {
        let batch_size = batch_size.max(1);
        let mut state = self.state.lock();
        self.do_get(&mut state, start, batch_size)
    }

    /// Waits up to `timeout` for a full batch; on expiry returns whatever is
    /// available, possibly empty.
    pub async fn get_timeout(
        &self,
        start: Option<&EntryPosition>,
        batch_size: usize,
        timeout: Duration,
    ) -> FetchedBatch {
        let batch_size = batch_size.max(1);
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if self.check_readable(&state, start, batch_size) {
                    return self.do_get(&mut state, start, batch_size);
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state.lock();
                return self.do_get(&mut state, start, batch_size);
            }
        }
    }

    fn check_readable(
        &self,
        state: &LogState,
        start: Option<&EntryPosition>,
        batch_size: usize,
    ) -> bool {
        let current = state.get_seq;
        let max_able = state.put_seq;
        let mut next = current;
        if !start.map(|p| p.included).unwrap_or(false) {
            next += 1;
        }
        next = next.max(0);
        if current >= max_able {
            return false;
        }
        match self.batch_mode {
            BatchMode::ItemSize => next + batch_size as i64 - 1 <= max_able,
            BatchMode::MemSize => {
                let required = (batch_size * self.buffer_mem_unit) as u64;
                state.put_mem - state.get_mem >= required
            }
        }
    }

    fn do_get(
        &self,
        state: &mut LogState,
        start: Option<&EntryPosition>,
        batch_size: usize,
    ) -> FetchedBatch {
        let current = state.get_seq;
        let max_able = state.put_seq;
        let mut next = current;
        if !start.map(|p| p.included).unwrap_or(false) {
            next += 1;
        }
        next = next.max(0);
        if next > max_able {
            return FetchedBatch::empty();
        }

        let mut events: Vec<Event> = Vec::new();
        let mut batch_mem: u64 = 0;
        let mut consumed_mem: u64 = 0;
        let mem_quota = (batch_size * self.buffer_mem_unit) as u64;
        let mut end_seq = next - 1;

        let mut seq = next;
        while seq <= max_able {
            let event = match state.entries[self.index_of(seq)].as_ref() {
                Some(event) => event.clone(),
                None => break, // freed slot, nothing further to read
            };

            if self.ddl_isolation && event.is_ddl() {
                if events.is_empty() {
                    // a schema change travels as a batch of its own
                    events.push(event);
                    end_seq = seq;
                }
                // otherwise cut the batch just before it; the DDL surfaces
                // alone on the next call
                break;
            }

            batch_mem += event.raw_len as u64;
            // a replayed slot (an included start) was already charged against
            // the quota when it was first delivered
            if seq > current {
                consumed_mem += event.raw_len as u64;
            }
            events.push(event);
            end_seq = seq;

            let full = match self.batch_mode {
                BatchMode::ItemSize => events.len() >= batch_size,
                BatchMode::MemSize => batch_mem >= mem_quota,
            };
            if full {
                break;
            }
            seq += 1;
        }

        if events.is_empty() {
            return FetchedBatch::empty();
        }

        // compare-and-set of the read cursor; interference yields an empty
        // batch for the caller to retry rather than an internal loop
        if state.get_seq != current {
            warn!(
                "get cursor moved concurrently (expected {}, found {})",
                current, state.get_seq
            );
            return FetchedBatch::empty();
        }
        state.get_seq = end_seq;
        if self.batch_mode.is_mem_size() {
            state.get_mem += consumed_mem;
        }

        let start_pos = EntryPosition::from_event(&events[0], false);
        let end_pos = EntryPosition::from_event(&events[events.len() - 1], false);
        let ack_pos = events
            .iter()
            .rev()
            .find(|e| e.ack_boundary(self.gtid_mode))
            .map(|e| EntryPosition::from_event(e, false));

        FetchedBatch {
            range: Some(PositionRange {
                start: start_pos,
                ack: ack_pos,
                end: end_pos,
                end_seq,
            }),
            events,
        }
    }

    // ---------------------------- ack ----------------------------

    /// Releases every slot up to `position`, matched by journal name and
    /// offset. Errors when the position is not inside the outstanding window
    /// (a stale or duplicate ack).
    pub fn ack(&self, position: &EntryPosition) -> AppResult<()> {
        self.ack_inner(position, None)
    }

    /// Like `ack` but matched by the exact ring sequence recorded in the
    /// delivered `PositionRange`, immune to journal-name reuse.
    pub fn ack_with_seq(&self, position: &EntryPosition, seq: i64) -> AppResult<()> {
        self.ack_inner(position, Some(seq))
    }

    fn ack_inner(&self, position: &EntryPosition, explicit_seq: Option<i64>) -> AppResult<()> {
        let mut state = self.state.lock();
        let start = state.ack_seq;
        let end = state.get_seq;

        let mut freed_mem: u64 = 0;
        let mut matched: Option<i64> = None;
        for seq in (start + 1)..=end {
            let event = state.entries[self.index_of(seq)].as_ref().ok_or_else(|| {
                AppError::IllegalState(format!("event log slot {} is empty during ack", seq))
            })?;
            freed_mem += event.raw_len as u64;
            let hit = match explicit_seq {
                Some(explicit) => seq == explicit,
                None => EntryPosition::from_event(event, false) == *position,
            };
            if hit {
                matched = Some(seq);
                break;
            }
        }

        let matched = matched.ok_or_else(|| {
            AppError::StaleAck(format!(
                "no event found at {} within ({}, {}]",
                position, start, end
            ))
        })?;

        state.ack_seq = matched;
        state.ack_mem += freed_mem;
        if self.batch_mode.is_mem_size() {
            // release payload memory; headers stay for position reporting
            for seq in (start + 1)..=matched {
                let index = self.index_of(seq);
                if let Some(event) = state.entries[index].as_mut() {
                    event.payload = Bytes::new();
                }
            }
        }
        debug!("ack advanced to seq {} at {}", matched, position);
        drop(state);
        self.not_full.notify_waiters();
        Ok(())
    }

    /// Rewinds the read cursor to the last acknowledged slot, so the next
    /// `get` redelivers everything unconfirmed.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        state.get_seq = state.ack_seq;
        state.get_mem = state.ack_mem;
        debug!("rolled back read cursor to seq {}", state.ack_seq);
        drop(state);
        self.not_empty.notify_waiters();
    }

    // ------------------------- positions -------------------------

    /// The coordinate a fresh subscriber should resume from: just after the
    /// last ack, or the oldest buffered entry when nothing was acked yet.
    pub fn first_position(&self) -> Option<EntryPosition> {
        let state = self.state.lock();
        let first = state.ack_seq;
        let latest = state.put_seq;
        if first == INIT_SEQUENCE && latest == INIT_SEQUENCE {
            None
        } else if first == latest {
            // fully acked; resume after this position, no redelivery
            let event = state.entries[self.index_of(first)].as_ref()?;
            Some(EntryPosition::from_event(event, false))
        } else if first > INIT_SEQUENCE {
            // partially acked; first unacked entry must be redelivered
            let event = state.entries[self.index_of(first + 1)].as_ref()?;
            Some(EntryPosition::from_event(event, true))
        } else {
            // nothing acked yet
            let event = state.entries[self.index_of(0)].as_ref()?;
            Some(EntryPosition::from_event(event, true))
        }
    }

    /// The most recently written coordinate, for bootstrap and debugging.
    pub fn latest_position(&self) -> Option<EntryPosition> {
        let state = self.state.lock();
        if state.put_seq == INIT_SEQUENCE {
            return None;
        }
        let event = state.entries[self.index_of(state.put_seq)].as_ref()?;
        Some(EntryPosition::from_event(event, false))
    }

    /// Drops every buffered event and resets all cursors; used on stop.
    pub fn clean_all(&self) {
        let mut state = self.state.lock();
        state.entries = vec![None; self.buffer_size];
        state.put_seq = INIT_SEQUENCE;
        state.get_seq = INIT_SEQUENCE;
        state.ack_seq = INIT_SEQUENCE;
        state.put_mem = 0;
        state.get_mem = 0;
        state.ack_mem = 0;
        drop(state);
        self.not_full.notify_waiters();
    }

    fn index_of(&self, seq: i64) -> usize {
        (seq & self.index_mask) as usize
    }
}
