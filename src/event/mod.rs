//! Data model shared by the assembler, the event log and the registry:
//! parsed change events, source-log positions and consumer identities.

mod client;
mod entry;
mod position;

pub use client::ClientIdentity;
pub use entry::{EntryKind, Event, EventHeader, EventType};
pub use position::{EntryPosition, LogPosition, PositionRange};
