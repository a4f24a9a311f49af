use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::event::LogPosition;
use crate::AppResult;

use super::registry::ConsumerRegistry;

/// Tracks the last durably-processed source coordinate per destination,
/// independent of consumer acknowledgment. Implementations differ only in
/// where that coordinate lives.
pub trait PositionManager: Send + Sync {
    async fn fetch(&self, destination: &str) -> AppResult<Option<LogPosition>>;
    async fn persist(&self, destination: &str, position: LogPosition) -> AppResult<()>;
}

/// Plain in-memory map, no durability. Used standalone in tests and as the
/// fast primary inside a failback pair.
#[derive(Default)]
pub struct MemoryPositionManager {
    positions: DashMap<String, LogPosition>,
}

impl MemoryPositionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionManager for MemoryPositionManager {
    async fn fetch(&self, destination: &str) -> AppResult<Option<LogPosition>> {
        Ok(self.positions.get(destination).map(|p| p.clone()))
    }

    async fn persist(&self, destination: &str, position: LogPosition) -> AppResult<()> {
        self.positions.insert(destination.to_string(), position);
        Ok(())
    }
}

/// Derives the destination position live from the consumer registry: the
/// minimum cursor among currently subscribed clients, i.e. the oldest point
/// any consumer still needs. Holds no state of its own, so persisting is a
/// log-only no-op.
pub struct MetaPositionManager {
    registry: Arc<ConsumerRegistry>,
}

impl MetaPositionManager {
    pub fn new(registry: Arc<ConsumerRegistry>) -> Self {
        Self { registry }
    }
}

impl PositionManager for MetaPositionManager {
    async fn fetch(&self, destination: &str) -> AppResult<Option<LogPosition>> {
        let mut min: Option<LogPosition> = None;
        for identity in self.registry.list_subscribers(destination).await {
            if let Some(cursor) = self.registry.get_cursor(&identity).await {
                min = match min {
                    Some(current) if current.position <= cursor.position => Some(current),
                    _ => Some(cursor),
                };
            }
        }
        Ok(min)
    }

    async fn persist(&self, destination: &str, position: LogPosition) -> AppResult<()> {
        debug!(
            "meta position manager ignores persist of {} for {}",
            position, destination
        );
        Ok(())
    }
}

/// Primary/secondary composition: reads prefer the primary and fall back
/// when it has nothing; writes go to the primary, with the secondary as a
/// best-effort backstop when the primary write fails.
pub struct FailbackPositionManager<P, S>
where
    P: PositionManager,
    S: PositionManager,
{
    primary: P,
    secondary: S,
}

impl<P, S> FailbackPositionManager<P, S>
where
    P: PositionManager,
    S: PositionManager,
{
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P, S> PositionManager for FailbackPositionManager<P, S>
where
    P: PositionManager,
    S: PositionManager,
{
    async fn fetch(&self, destination: &str) -> AppResult<Option<LogPosition>> {
        match self.primary.fetch(destination).await? {
            Some(position) => Ok(Some(position)),
            None => self.secondary.fetch(destination).await,
        }
    }

    async fn persist(&self, destination: &str, position: LogPosition) -> AppResult<()> {
        match self.primary.persist(destination, position.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "primary position persist failed for {}, falling back: {}",
                    destination, e
                );
                self.secondary.persist(destination, position).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::{ClientIdentity, EntryPosition};
    use crate::AppError;

    use super::*;

    fn cursor(offset: i64) -> LogPosition {
        LogPosition::new("10.0.0.1:3306", EntryPosition::new("binlog.000001", offset))
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let manager = MemoryPositionManager::new();
        assert!(manager.fetch("example").await.unwrap().is_none());
        manager.persist("example", cursor(100)).await.unwrap();
        assert_eq!(manager.fetch("example").await.unwrap(), Some(cursor(100)));
    }

    #[tokio::test]
    async fn test_meta_manager_takes_minimum_cursor() {
        let registry = Arc::new(ConsumerRegistry::memory());
        let slow = ClientIdentity::new("example", 1001);
        let fast = ClientIdentity::new("example", 1002);
        registry.subscribe(slow.clone()).await;
        registry.subscribe(fast.clone()).await;
        registry.update_cursor(&slow, cursor(100));
        registry.update_cursor(&fast, cursor(900));

        let manager = MetaPositionManager::new(registry.clone());
        assert_eq!(manager.fetch("example").await.unwrap(), Some(cursor(100)));

        // once the slow consumer leaves, the minimum advances
        registry.unsubscribe(&slow).await;
        assert_eq!(manager.fetch("example").await.unwrap(), Some(cursor(900)));

        assert!(manager.fetch("other").await.unwrap().is_none());
    }

    /// Always errors on persist and never holds anything.
    struct BrokenPositionManager;

    impl PositionManager for BrokenPositionManager {
        async fn fetch(&self, _destination: &str) -> AppResult<Option<LogPosition>> {
            Ok(None)
        }

        async fn persist(&self, _destination: &str, _position: LogPosition) -> AppResult<()> {
            Err(AppError::IllegalState("primary store down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failback_fetch_prefers_primary() {
        let primary = MemoryPositionManager::new();
        let secondary = MemoryPositionManager::new();
        secondary.persist("example", cursor(50)).await.unwrap();
        primary.persist("example", cursor(100)).await.unwrap();

        let manager = FailbackPositionManager::new(primary, secondary);
        assert_eq!(manager.fetch("example").await.unwrap(), Some(cursor(100)));
    }

    #[tokio::test]
    async fn test_failback_falls_back_when_primary_empty() {
        let primary = MemoryPositionManager::new();
        let secondary = MemoryPositionManager::new();
        secondary.persist("example", cursor(50)).await.unwrap();

        let manager = FailbackPositionManager::new(primary, secondary);
        assert_eq!(manager.fetch("example").await.unwrap(), Some(cursor(50)));
    }

    #[tokio::test]
    async fn test_failback_persist_uses_secondary_on_error() {
        let secondary = MemoryPositionManager::new();
        let manager = FailbackPositionManager::new(BrokenPositionManager, secondary);
        manager.persist("example", cursor(75)).await.unwrap();
        assert_eq!(
            manager.secondary.fetch("example").await.unwrap(),
            Some(cursor(75))
        );
    }
}
