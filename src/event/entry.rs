use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Classification of one change-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    TransactionBegin,
    RowData,
    TransactionEnd,
    Heartbeat,
}

/// The row-level operation carried by a `RowData` entry. Control entries
/// (begin/end/heartbeat) carry `EventType::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Erase,
    Query,
    Truncate,
    Rename,
    Cindex,
    Dindex,
    None,
}

impl EventType {
    pub fn is_dml(&self) -> bool {
        matches!(self, EventType::Insert | EventType::Update | EventType::Delete)
    }
}

/// Source coordinates of one parsed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub journal_name: String,
    pub offset: i64,
    /// Statement execution time at the source, millis since epoch.
    pub execute_time: i64,
    pub server_id: i64,
    pub gtid: Option<String>,
}

/// One change-log record as it flows through the assembler and the event log.
/// Immutable once constructed; the payload is shared, so clones are cheap.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EntryKind,
    pub header: EventHeader,
    pub event_type: EventType,
    pub payload: Bytes,
    pub raw_len: usize,
}

impl Event {
    pub fn new(
        kind: EntryKind,
        header: EventHeader,
        event_type: EventType,
        payload: Bytes,
    ) -> Self {
        let raw_len = payload.len();
        Self {
            kind,
            header,
            event_type,
            payload,
            raw_len,
        }
    }

    /// A `RowData` entry whose type is not plain DML is schema-changing and
    /// must never be batched together with row events.
    pub fn is_ddl(&self) -> bool {
        self.kind == EntryKind::RowData && !self.event_type.is_dml()
    }

    /// Whether an ack may legally land on this entry. Transaction boundaries,
    /// heartbeats and isolated DDL are always safe; a bare transaction begin
    /// is acceptable only when gtid tracking is off, since a gtid cursor must
    /// cover whole transactions.
    pub fn ack_boundary(&self, gtid_mode: bool) -> bool {
        match self.kind {
            EntryKind::TransactionEnd | EntryKind::Heartbeat => true,
            EntryKind::TransactionBegin => !gtid_mode,
            EntryKind::RowData => self.is_ddl(),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}[{}:{}]",
            self.kind, self.header.journal_name, self.header.offset
        )
    }
}
