use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::event::{ClientIdentity, LogPosition, PositionRange};
use crate::{AppError, AppResult};

use super::file_store::FileMetaStore;

/// Snapshot of one destination as written to its cursor file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DestinationSnapshot {
    pub destination: String,
    pub client_data_list: Vec<ClientData>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClientData {
    pub client_identity: ClientIdentity,
    pub cursor: Option<LogPosition>,
}

/// Per-client delivery bookkeeping: the monotonic batch id generator, the
/// outstanding (un-acked) delivery windows and the confirmed cursor.
#[derive(Debug, Default)]
struct ClientMeta {
    next_batch_id: i64,
    batches: BTreeMap<i64, PositionRange>,
    cursor: Option<LogPosition>,
}

impl ClientMeta {
    fn new() -> Self {
        Self {
            next_batch_id: 1,
            batches: BTreeMap::new(),
            cursor: None,
        }
    }
}

/// Subscription state, outstanding batch windows and confirmed cursors, per
/// consumer identity. The core is purely in-memory; durability is an
/// injected file store rather than a subclass, so the memory-only and
/// file-backed flavors share one type.
///
/// Locking is two-level: a per-destination mutex over the subscriber list
/// and a per-identity mutex over batch state, so independent clients never
/// contend.
pub struct ConsumerRegistry {
    destinations: DashMap<String, Arc<Mutex<Vec<ClientIdentity>>>>,
    clients: DashMap<ClientIdentity, Arc<Mutex<ClientMeta>>>,
    store: Option<Arc<FileMetaStore>>,
}

impl ConsumerRegistry {
    /// Memory-only registry; state is lost on restart.
    pub fn memory() -> Self {
        Self {
            destinations: DashMap::new(),
            clients: DashMap::new(),
            store: None,
        }
    }

    /// Registry persisted through `store`. Destinations are loaded lazily on
    /// first access; the periodic flush task is started separately via
    /// `FileMetaStore::start_flush_task`.
    pub fn file_backed(store: Arc<FileMetaStore>) -> Self {
        Self {
            destinations: DashMap::new(),
            clients: DashMap::new(),
            store: Some(store),
        }
    }

    // ------------------------ subscriptions ------------------------

    /// Idempotent: resubscribing removes the previous entry first, so the
    /// latest filter wins and the client moves to the back of the list.
    pub async fn subscribe(&self, identity: ClientIdentity) {
        self.ensure_loaded(&identity.destination).await;
        let list = self.destination_list(&identity.destination);
        {
            let mut list = list.lock();
            list.retain(|existing| existing != &identity);
            list.push(identity.clone());
        }
        self.clients
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ClientMeta::new())));
        debug!("subscribed {}", identity);
        // subscriptions are rare; flush them out of band instead of waiting
        // for the next tick
        self.flush_now(&identity.destination).await;
    }

    pub async fn unsubscribe(&self, identity: &ClientIdentity) {
        self.ensure_loaded(&identity.destination).await;
        let list = self.destination_list(&identity.destination);
        list.lock().retain(|existing| existing != identity);
        // drop the batch table and cursor too, so churning client ids do not
        // accumulate dead entries
        self.clients.remove(identity);
        debug!("unsubscribed {}", identity);
        self.flush_now(&identity.destination).await;
    }

    pub async fn has_subscribe(&self, identity: &ClientIdentity) -> bool {
        self.ensure_loaded(&identity.destination).await;
        self.destinations
            .get(&identity.destination)
            .map(|list| list.lock().contains(identity))
            .unwrap_or(false)
    }

    pub async fn list_subscribers(&self, destination: &str) -> Vec<ClientIdentity> {
        self.ensure_loaded(destination).await;
        self.destinations
            .get(destination)
            .map(|list| list.lock().clone())
            .unwrap_or_default()
    }

    // --------------------------- batches ---------------------------

    /// Records a delivered window under the next batch id and returns it.
    pub fn add_batch(&self, identity: &ClientIdentity, range: PositionRange) -> i64 {
        let meta = self.client_meta(identity);
        let mut meta = meta.lock();
        let batch_id = meta.next_batch_id;
        meta.next_batch_id += 1;
        meta.batches.insert(batch_id, range);
        batch_id
    }

    /// Records a window under a caller-supplied id (batch replay after a
    /// reconnect). The generator is advanced past it so later auto-assigned
    /// ids stay unique.
    pub fn add_batch_with_id(&self, identity: &ClientIdentity, range: PositionRange, batch_id: i64) {
        let meta = self.client_meta(identity);
        let mut meta = meta.lock();
        meta.batches.insert(batch_id, range);
        if batch_id >= meta.next_batch_id {
            meta.next_batch_id = batch_id + 1;
        }
    }

    /// Removes and returns the window for `batch_id`, which must be the
    /// oldest outstanding one. Acking any other id means client and server
    /// have diverged, which is fatal to the session rather than recoverable.
    pub fn remove_batch(
        &self,
        identity: &ClientIdentity,
        batch_id: i64,
    ) -> AppResult<PositionRange> {
        let meta = self.client_meta(identity);
        let mut meta = meta.lock();
        let min_id = *meta.batches.keys().next().ok_or_else(|| {
            AppError::OrderingViolation(format!(
                "client {} has no outstanding batch, cannot ack {}",
                identity, batch_id
            ))
        })?;
        if batch_id != min_id {
            return Err(AppError::OrderingViolation(format!(
                "client {} acked batch {} but the oldest outstanding is {}",
                identity, batch_id, min_id
            )));
        }
        meta.batches.remove(&batch_id).ok_or_else(|| {
            AppError::IllegalState(format!("batch {} vanished during remove", batch_id))
        })
    }

    pub fn get_batch(&self, identity: &ClientIdentity, batch_id: i64) -> Option<PositionRange> {
        let meta = self.client_meta(identity);
        let meta = meta.lock();
        meta.batches.get(&batch_id).cloned()
    }

    /// Outstanding windows in id order.
    pub fn list_batches(&self, identity: &ClientIdentity) -> Vec<(i64, PositionRange)> {
        let meta = self.client_meta(identity);
        let meta = meta.lock();
        meta.batches
            .iter()
            .map(|(id, range)| (*id, range.clone()))
            .collect()
    }

    /// Drops every outstanding window, e.g. on rollback or reconnect.
    pub fn clear_batches(&self, identity: &ClientIdentity) {
        let meta = self.client_meta(identity);
        meta.lock().batches.clear();
    }

    // --------------------------- cursors ---------------------------

    pub async fn get_cursor(&self, identity: &ClientIdentity) -> Option<LogPosition> {
        self.ensure_loaded(&identity.destination).await;
        let meta = self.client_meta(identity);
        let cursor = meta.lock().cursor.clone();
        cursor
    }

    pub fn update_cursor(&self, identity: &ClientIdentity, position: LogPosition) {
        let meta = self.client_meta(identity);
        meta.lock().cursor = Some(position);
        if let Some(store) = &self.store {
            store.mark_dirty(&identity.destination);
        }
    }

    /// Serializable view of one destination, fed to the file store.
    pub fn snapshot(&self, destination: &str) -> DestinationSnapshot {
        let subscribers = self
            .destinations
            .get(destination)
            .map(|list| list.lock().clone())
            .unwrap_or_default();
        let client_data_list = subscribers
            .into_iter()
            .map(|identity| {
                let cursor = self
                    .clients
                    .get(&identity)
                    .and_then(|meta| meta.lock().cursor.clone());
                ClientData {
                    client_identity: identity,
                    cursor,
                }
            })
            .collect();
        DestinationSnapshot {
            destination: destination.to_string(),
            client_data_list,
        }
    }

    // -------------------------- internals --------------------------

    fn destination_list(&self, destination: &str) -> Arc<Mutex<Vec<ClientIdentity>>> {
        self.destinations
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .value()
            .clone()
    }

    fn client_meta(&self, identity: &ClientIdentity) -> Arc<Mutex<ClientMeta>> {
        self.clients
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ClientMeta::new())))
            .value()
            .clone()
    }

    /// First access to a destination replays its cursor file, if any; after
    /// that everything is served from memory.
    async fn ensure_loaded(&self, destination: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if !store.needs_load(destination) {
            return;
        }
        match store.load(destination).await {
            Ok(Some(snapshot)) => {
                let list = self.destination_list(destination);
                let mut list = list.lock();
                for data in snapshot.client_data_list {
                    list.retain(|existing| existing != &data.client_identity);
                    list.push(data.client_identity.clone());
                    let meta = self
                        .clients
                        .entry(data.client_identity)
                        .or_insert_with(|| Arc::new(Mutex::new(ClientMeta::new())))
                        .value()
                        .clone();
                    meta.lock().cursor = data.cursor;
                }
                debug!("loaded cursor file for destination {}", destination);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("failed to load cursor file for {}: {}", destination, e);
            }
        }
    }

    async fn flush_now(&self, destination: &str) {
        if let Some(store) = &self.store {
            let snapshot = self.snapshot(destination);
            if let Err(e) = store.flush(&snapshot).await {
                // leave it dirty; the periodic task retries next tick
                warn!("immediate cursor flush failed for {}: {}", destination, e);
                store.mark_dirty(destination);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::EntryPosition;

    use super::*;

    fn range(start: i64, end: i64) -> PositionRange {
        PositionRange {
            start: EntryPosition::new("binlog.000001", start),
            ack: Some(EntryPosition::new("binlog.000001", end)),
            end: EntryPosition::new("binlog.000001", end),
            end_seq: end,
        }
    }

    #[tokio::test]
    async fn test_subscribe_idempotent_last_wins() {
        let registry = ConsumerRegistry::memory();
        let plain = ClientIdentity::new("example", 1001);
        let filtered = ClientIdentity::new("example", 1001).with_filter("db\\..*");

        registry.subscribe(plain.clone()).await;
        registry.subscribe(filtered.clone()).await;

        let subscribers = registry.list_subscribers("example").await;
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].filter.as_deref(), Some("db\\..*"));
        assert!(registry.has_subscribe(&plain).await);

        registry.unsubscribe(&plain).await;
        assert!(!registry.has_subscribe(&plain).await);
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_client_state() {
        let registry = ConsumerRegistry::memory();
        let identity = ClientIdentity::new("example", 1001);
        registry.subscribe(identity.clone()).await;
        registry.add_batch(&identity, range(4, 8));
        registry.update_cursor(
            &identity,
            LogPosition::new("10.0.0.1:3306", EntryPosition::new("binlog.000001", 8)),
        );

        registry.unsubscribe(&identity).await;
        assert!(registry.list_batches(&identity).is_empty());
        assert!(registry.get_cursor(&identity).await.is_none());

        // a resubscribe starts over with a fresh id sequence
        registry.subscribe(identity.clone()).await;
        assert_eq!(registry.add_batch(&identity, range(12, 16)), 1);
    }

    #[tokio::test]
    async fn test_batch_ids_monotonic_per_client() {
        let registry = ConsumerRegistry::memory();
        let a = ClientIdentity::new("example", 1001);
        let b = ClientIdentity::new("example", 1002);

        assert_eq!(registry.add_batch(&a, range(4, 8)), 1);
        assert_eq!(registry.add_batch(&a, range(12, 16)), 2);
        // ids are per identity, not global
        assert_eq!(registry.add_batch(&b, range(4, 8)), 1);
    }

    #[tokio::test]
    async fn test_remove_batch_enforces_minimum_id() {
        let registry = ConsumerRegistry::memory();
        let identity = ClientIdentity::new("example", 1001);

        let b1 = registry.add_batch(&identity, range(4, 8));
        let b2 = registry.add_batch(&identity, range(12, 16));

        let out_of_order = registry.remove_batch(&identity, b2);
        assert!(matches!(out_of_order, Err(AppError::OrderingViolation(_))));

        let removed = registry.remove_batch(&identity, b1).unwrap();
        assert_eq!(removed.end.offset, 8);
        let removed = registry.remove_batch(&identity, b2).unwrap();
        assert_eq!(removed.end.offset, 16);

        let empty = registry.remove_batch(&identity, 3);
        assert!(matches!(empty, Err(AppError::OrderingViolation(_))));
    }

    #[tokio::test]
    async fn test_explicit_batch_id_advances_generator() {
        let registry = ConsumerRegistry::memory();
        let identity = ClientIdentity::new("example", 1001);

        registry.add_batch_with_id(&identity, range(4, 8), 7);
        assert_eq!(registry.add_batch(&identity, range(12, 16)), 8);
        assert_eq!(registry.list_batches(&identity).len(), 2);
    }

    #[tokio::test]
    async fn test_clear_batches() {
        let registry = ConsumerRegistry::memory();
        let identity = ClientIdentity::new("example", 1001);
        registry.add_batch(&identity, range(4, 8));
        registry.add_batch(&identity, range(12, 16));
        registry.clear_batches(&identity);
        assert!(registry.list_batches(&identity).is_empty());
        // generator keeps counting after a clear
        assert_eq!(registry.add_batch(&identity, range(20, 24)), 3);
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let registry = ConsumerRegistry::memory();
        let identity = ClientIdentity::new("example", 1001);
        assert!(registry.get_cursor(&identity).await.is_none());

        let position = LogPosition::new("10.0.0.1:3306", EntryPosition::new("binlog.000001", 8));
        registry.update_cursor(&identity, position.clone());
        assert_eq!(registry.get_cursor(&identity).await, Some(position));
    }
}
