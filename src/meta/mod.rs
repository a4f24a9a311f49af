//! Consumer-side durable state: subscriptions, outstanding batch windows,
//! confirmed cursors and the per-destination resume position.

mod file_store;
mod position_manager;
mod registry;

pub use file_store::FileMetaStore;
pub use position_manager::{
    FailbackPositionManager, MemoryPositionManager, MetaPositionManager, PositionManager,
};
pub use registry::{ClientData, ConsumerRegistry, DestinationSnapshot};
