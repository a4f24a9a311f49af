use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::Event;

/// A coordinate inside the source replication log.
///
/// `included` marks whether the entry at this coordinate itself should be
/// (re)delivered when resuming from it, or only everything after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPosition {
    pub journal_name: String,
    pub offset: i64,
    pub timestamp: i64,
    pub server_id: i64,
    pub gtid: Option<String>,
    pub included: bool,
}

impl EntryPosition {
    pub fn new(journal_name: impl Into<String>, offset: i64) -> Self {
        Self {
            journal_name: journal_name.into(),
            offset,
            timestamp: 0,
            server_id: 0,
            gtid: None,
            included: false,
        }
    }

    pub fn from_event(event: &Event, included: bool) -> Self {
        Self {
            journal_name: event.header.journal_name.clone(),
            offset: event.header.offset,
            timestamp: event.header.execute_time,
            server_id: event.header.server_id,
            gtid: event.header.gtid.clone(),
            included,
        }
    }

    pub fn with_included(mut self, included: bool) -> Self {
        self.included = included;
        self
    }
}

/// Positions identify the same slot when journal and offset agree; metadata
/// like timestamp or the included flag never participates.
impl PartialEq for EntryPosition {
    fn eq(&self, other: &Self) -> bool {
        self.journal_name == other.journal_name && self.offset == other.offset
    }
}

impl Eq for EntryPosition {}

impl PartialOrd for EntryPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.journal_name
            .cmp(&other.journal_name)
            .then(self.offset.cmp(&other.offset))
    }
}

impl Display for EntryPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.journal_name, self.offset)
    }
}

/// An `EntryPosition` qualified by the source instance it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub identity: String,
    pub position: EntryPosition,
}

impl LogPosition {
    pub fn new(identity: impl Into<String>, position: EntryPosition) -> Self {
        Self {
            identity: identity.into(),
            position,
        }
    }
}

impl Display for LogPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.identity, self.position)
    }
}

/// The window description handed out by one `get`: delivery boundaries plus
/// the latest transaction-safe ack coordinate inside the window.
///
/// `ack` is `None` when the window contains no safe boundary (a batch cut in
/// the middle of a large transaction); acking such a window falls back to the
/// window end, identified precisely by `end_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRange {
    pub start: EntryPosition,
    pub ack: Option<EntryPosition>,
    pub end: EntryPosition,
    /// Internal ring sequence of `end`, used for exact slot release on ack.
    pub end_seq: i64,
}

impl PositionRange {
    /// The position an ack of this whole window should land on.
    pub fn ack_position(&self) -> &EntryPosition {
        self.ack.as_ref().unwrap_or(&self.end)
    }
}
