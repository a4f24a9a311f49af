use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::time::{interval, Duration};
use tracing::{error, info, trace};

use crate::service::Shutdown;
use crate::AppResult;

use super::registry::{ConsumerRegistry, DestinationSnapshot};

const META_FILE_SUFFIX: &str = "meta";

/// Durable backing for the consumer registry: one JSON document per
/// destination, fully rewritten on each flush. Absence of a file is simply
/// "no prior state".
///
/// The store never sits on the hot path: cursor updates only mark the
/// destination dirty, and the background task started by `start_flush_task`
/// does the actual writes.
pub struct FileMetaStore {
    base_dir: PathBuf,
    flush_interval: Duration,
    dirty: DashSet<String>,
    loaded: DashSet<String>,
}

impl FileMetaStore {
    pub fn new(base_dir: impl AsRef<Path>, flush_interval: Duration) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            flush_interval,
            dirty: DashSet::new(),
            loaded: DashSet::new(),
        }
    }

    pub fn mark_dirty(&self, destination: &str) {
        self.dirty.insert(destination.to_string());
    }

    /// True until the first `load` for this destination has completed.
    pub fn needs_load(&self, destination: &str) -> bool {
        !self.loaded.contains(destination)
    }

    /// Reads the destination's cursor file. A missing file is not an error;
    /// an unreadable or corrupt one is, and leaves the destination pending
    /// so a later access retries instead of silently starting fresh.
    pub async fn load(&self, destination: &str) -> AppResult<Option<DestinationSnapshot>> {
        let path = self.file_of(destination);
        let open_file = OpenOptions::new().read(true).open(&path).await;
        let mut file = match open_file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.loaded.insert(destination.to_string());
                trace!("no cursor file at {:?}, starting fresh", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut content = String::new();
        file.read_to_string(&mut content).await?;
        let snapshot: DestinationSnapshot = serde_json::from_str(&content)?;
        self.loaded.insert(destination.to_string());
        Ok(Some(snapshot))
    }

    /// Overwrites the destination's file with the full snapshot.
    pub async fn flush(&self, snapshot: &DestinationSnapshot) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.file_of(&snapshot.destination);
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(serde_json::to_string_pretty(snapshot)?.as_bytes())
            .await?;
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        self.dirty.remove(&snapshot.destination);
        trace!("flushed cursor file for {}", snapshot.destination);
        Ok(())
    }

    /// Spawns the periodic flush loop: every tick, each dirty destination is
    /// snapshotted from the registry and rewritten. An I/O failure leaves
    /// the destination dirty and is retried next tick, never propagated.
    pub fn start_flush_task(
        self: Arc<Self>,
        registry: Arc<ConsumerRegistry>,
        mut shutdown: Shutdown,
    ) {
        tokio::spawn(async move {
            let mut tick = interval(self.flush_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        self.flush_dirty(&registry).await;
                    }
                    _ = shutdown.recv() => {
                        // final sweep so a clean stop loses nothing
                        self.flush_dirty(&registry).await;
                        info!("meta flush task stopped");
                        break;
                    }
                }
            }
        });
    }

    async fn flush_dirty(&self, registry: &ConsumerRegistry) {
        let pending: Vec<String> = self.dirty.iter().map(|d| d.key().clone()).collect();
        for destination in pending {
            let snapshot = registry.snapshot(&destination);
            if let Err(e) = self.flush(&snapshot).await {
                error!("cursor flush failed for {}: {}", destination, e);
            }
        }
    }

    fn file_of(&self, destination: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", destination, META_FILE_SUFFIX))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    use crate::event::{ClientIdentity, EntryPosition, LogPosition};

    use super::*;

    fn cursor(offset: i64) -> LogPosition {
        LogPosition::new("10.0.0.1:3306", EntryPosition::new("binlog.000001", offset))
    }

    #[tokio::test]
    async fn test_missing_file_is_no_prior_state() {
        let dir = TempDir::new().unwrap();
        let store = FileMetaStore::new(dir.path(), Duration::from_millis(100));
        assert!(store.needs_load("example"));
        let snapshot = store.load("example").await.unwrap();
        assert!(snapshot.is_none());
        assert!(!store.needs_load("example"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileMetaStore::new(dir.path(), Duration::from_millis(100));
        tokio::fs::write(dir.path().join("example.meta"), b"not json")
            .await
            .unwrap();
        assert!(store.load("example").await.is_err());
    }

    #[tokio::test]
    async fn test_unreadable_file_is_an_error_and_stays_pending() {
        let dir = TempDir::new().unwrap();
        let store = FileMetaStore::new(dir.path(), Duration::from_millis(100));
        // a directory squatting on the meta path is unreadable, not absent
        tokio::fs::create_dir(dir.path().join("example.meta"))
            .await
            .unwrap();
        assert!(store.load("example").await.is_err());
        // not marked loaded: a later access retries instead of assuming
        // there was no prior state
        assert!(store.needs_load("example"));
    }

    #[tokio::test]
    async fn test_flush_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMetaStore::new(dir.path(), Duration::from_millis(100)));
        let registry = ConsumerRegistry::file_backed(store.clone());

        let identity = ClientIdentity::new("example", 1001).with_filter(".*");
        registry.subscribe(identity.clone()).await;
        registry.update_cursor(&identity, cursor(2048));
        store.flush(&registry.snapshot("example")).await.unwrap();

        // a second registry over the same directory sees the state lazily
        let restored_store =
            Arc::new(FileMetaStore::new(dir.path(), Duration::from_millis(100)));
        let reloaded = ConsumerRegistry::file_backed(restored_store);
        assert!(reloaded.has_subscribe(&identity).await);
        assert_eq!(reloaded.get_cursor(&identity).await, Some(cursor(2048)));
    }

    #[tokio::test]
    async fn test_periodic_flush_persists_dirty_cursor() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMetaStore::new(dir.path(), Duration::from_millis(20)));
        let registry = Arc::new(ConsumerRegistry::file_backed(store.clone()));

        let (notify_shutdown, _) = broadcast::channel(1);
        store
            .clone()
            .start_flush_task(registry.clone(), Shutdown::new(notify_shutdown.subscribe()));

        let identity = ClientIdentity::new("example", 1001);
        registry.subscribe(identity.clone()).await;
        registry.update_cursor(&identity, cursor(4096));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = notify_shutdown.send(());

        let fresh_store = Arc::new(FileMetaStore::new(dir.path(), Duration::from_millis(100)));
        let fresh = ConsumerRegistry::file_backed(fresh_store);
        assert_eq!(fresh.get_cursor(&identity).await, Some(cursor(4096)));
    }
}
