use std::sync::Arc;

use rand::Rng;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::event::{ClientIdentity, EntryKind, EntryPosition, Event, LogPosition};
use crate::meta::ConsumerRegistry;
use crate::store::{EventLog, TransactionSink};
use crate::{AppError, AppResult};

/// Sentinel batch id meaning "no data, nothing to ack".
pub const NO_BATCH_ID: i64 = -1;

/// One delivered slice of the event log, identified by its registry batch
/// id until acknowledged.
#[derive(Debug)]
pub struct Batch {
    pub batch_id: i64,
    pub events: Vec<Event>,
}

impl Batch {
    fn empty() -> Self {
        Self {
            batch_id: NO_BATCH_ID,
            events: Vec::new(),
        }
    }
}

/// Transport-agnostic consumer surface over the event log and the registry.
/// Wire framing, auth and session handling live elsewhere; every protocol
/// rule (subscription checks, batch ordering, the ack/rollback contract) is
/// enforced here.
pub struct PipelineService {
    /// Source instance address recorded in persisted cursors.
    source_identity: String,
    event_log: Arc<EventLog>,
    registry: Arc<ConsumerRegistry>,
}

impl PipelineService {
    pub fn new(
        source_identity: impl Into<String>,
        event_log: Arc<EventLog>,
        registry: Arc<ConsumerRegistry>,
    ) -> Self {
        Self {
            source_identity: source_identity.into(),
            event_log,
            registry,
        }
    }

    pub async fn subscribe(&self, identity: ClientIdentity) {
        self.registry.subscribe(identity).await;
    }

    pub async fn unsubscribe(&self, identity: &ClientIdentity) {
        self.registry.unsubscribe(identity).await;
    }

    /// Fetch-and-forget: delivers a batch and immediately confirms it, for
    /// consumers that do not need the replay window.
    pub async fn get(
        &self,
        identity: &ClientIdentity,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> AppResult<Batch> {
        let batch = self.get_without_ack(identity, batch_size, timeout).await?;
        if batch.batch_id != NO_BATCH_ID {
            self.ack(identity, batch.batch_id)?;
        }
        Ok(batch)
    }

    /// Delivers the next contiguous batch and records it as an outstanding
    /// window. With a timeout the call waits up to that long for a full
    /// batch, then returns whatever is buffered; without one it returns
    /// immediately. An empty fetch is `NO_BATCH_ID` and is not recorded.
    pub async fn get_without_ack(
        &self,
        identity: &ClientIdentity,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> AppResult<Batch> {
        self.check_subscribed(identity).await?;

        // the log's own read cursor drives successive windows; the durable
        // cursor only steers the upstream parser after a restart
        let fetched = match timeout {
            Some(timeout) => self.event_log.get_timeout(None, batch_size, timeout).await,
            None => self.event_log.try_get(None, batch_size),
        };

        let Some(range) = fetched.range else {
            return Ok(Batch::empty());
        };
        let batch_id = self.registry.add_batch(identity, range);
        debug!(
            "delivered batch {} of {} events to {}",
            batch_id,
            fetched.events.len(),
            identity
        );
        Ok(Batch {
            batch_id,
            events: fetched.events,
        })
    }

    /// Confirms the oldest outstanding batch. Ring slots are released up to
    /// the window end; the durable cursor only advances to the last
    /// transaction-safe position inside the window, so a crash never leaves
    /// it mid-transaction.
    pub fn ack(&self, identity: &ClientIdentity, batch_id: i64) -> AppResult<()> {
        if batch_id == NO_BATCH_ID {
            return Ok(());
        }
        let range = self.registry.remove_batch(identity, batch_id)?;
        self.event_log.ack_with_seq(&range.end, range.end_seq)?;
        if let Some(ack_position) = range.ack {
            self.registry.update_cursor(
                identity,
                LogPosition::new(self.source_identity.clone(), ack_position),
            );
        }
        Ok(())
    }

    /// Discards every outstanding window for this client and rewinds the
    /// log's read cursor, so the next get replays everything unconfirmed.
    pub fn rollback(&self, identity: &ClientIdentity) {
        self.registry.clear_batches(identity);
        self.event_log.rollback();
        info!("rolled back all outstanding batches for {}", identity);
    }

    /// Rollback addressed at a single batch, which must be the oldest
    /// outstanding one. The log replays from the last ack, so any newer
    /// outstanding windows are dropped along with it.
    pub fn rollback_batch(&self, identity: &ClientIdentity, batch_id: i64) -> AppResult<()> {
        let outstanding = self.registry.list_batches(identity);
        match outstanding.first() {
            Some((min_id, _)) if *min_id == batch_id => {
                self.registry.clear_batches(identity);
                self.event_log.rollback();
                info!("rolled back batch {} for {}", batch_id, identity);
                Ok(())
            }
            Some((min_id, _)) => Err(AppError::OrderingViolation(format!(
                "client {} rolled back batch {} but the oldest outstanding is {}",
                identity, batch_id, min_id
            ))),
            None => Err(AppError::OrderingViolation(format!(
                "client {} has no outstanding batch, cannot roll back {}",
                identity, batch_id
            ))),
        }
    }

    async fn check_subscribed(&self, identity: &ClientIdentity) -> AppResult<()> {
        if self.registry.has_subscribe(identity).await {
            Ok(())
        } else {
            Err(AppError::NoSubscription(identity.to_string()))
        }
    }
}

/// Ingestion side of the pipeline: forwards each flushed transaction into
/// the event log. The put blocks when the ring is full, so backpressure
/// travels through the assembler straight to the parser.
pub struct LogSink {
    event_log: Arc<EventLog>,
    /// Drop begin/end pairs that carry no row data.
    filter_empty_transactions: bool,
}

impl LogSink {
    pub fn new(event_log: Arc<EventLog>) -> Self {
        Self {
            event_log,
            filter_empty_transactions: true,
        }
    }

    pub fn with_empty_transaction_filter(mut self, enabled: bool) -> Self {
        self.filter_empty_transactions = enabled;
        self
    }

    fn is_empty_transaction(events: &[Event]) -> bool {
        !events.is_empty()
            && events.iter().all(|e| {
                matches!(
                    e.kind,
                    EntryKind::TransactionBegin | EntryKind::TransactionEnd
                )
            })
    }
}

impl TransactionSink for LogSink {
    async fn sink(&self, events: Vec<Event>) -> AppResult<bool> {
        if events.is_empty() {
            return Ok(true);
        }
        if self.filter_empty_transactions && Self::is_empty_transaction(&events) {
            return Ok(true);
        }
        self.event_log.put(events).await;
        Ok(true)
    }
}

/// Delay before re-attaching to the source after a downstream failure:
/// exponential in the attempt count with +/-50% jitter, so a fleet of
/// restarting pipelines does not reconnect in lockstep.
pub fn recovery_backoff(base: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(1u32 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0.5_f64..1.5_f64);
    scaled.mul_f64(jitter)
}

/// Convenience for resuming after a sink failure: the replay coordinate is
/// the last durable cursor when one exists, else the oldest buffered entry.
pub async fn resume_position(
    service: &PipelineService,
    identity: &ClientIdentity,
) -> Option<EntryPosition> {
    match service.registry.get_cursor(identity).await {
        Some(cursor) => Some(cursor.position),
        None => service.event_log.first_position(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::event::{EventHeader, EventType};
    use crate::service::StoreConfig;
    use crate::store::TransactionAssembler;

    use super::*;

    fn event(kind: EntryKind, event_type: EventType, offset: i64) -> Event {
        Event::new(
            kind,
            EventHeader {
                journal_name: "binlog.000001".to_string(),
                offset,
                execute_time: offset,
                server_id: 1,
                gtid: None,
            },
            event_type,
            Bytes::from_static(b"payload"),
        )
    }

    fn transaction(first_offset: i64) -> Vec<Event> {
        vec![
            event(EntryKind::TransactionBegin, EventType::None, first_offset),
            event(EntryKind::RowData, EventType::Insert, first_offset + 4),
            event(EntryKind::TransactionEnd, EventType::None, first_offset + 8),
        ]
    }

    fn service() -> PipelineService {
        let config = StoreConfig {
            buffer_size: 64,
            ..Default::default()
        };
        PipelineService::new(
            "10.0.0.1:3306",
            Arc::new(EventLog::new(&config)),
            Arc::new(ConsumerRegistry::memory()),
        )
    }

    #[tokio::test]
    async fn test_get_requires_subscription() {
        let service = service();
        let identity = ClientIdentity::new("example", 1001);
        let result = service.get_without_ack(&identity, 10, None).await;
        assert!(matches!(result, Err(AppError::NoSubscription(_))));
    }

    #[tokio::test]
    async fn test_empty_fetch_returns_sentinel() {
        let service = service();
        let identity = ClientIdentity::new("example", 1001);
        service.subscribe(identity.clone()).await;

        let batch = service.get_without_ack(&identity, 10, None).await.unwrap();
        assert_eq!(batch.batch_id, NO_BATCH_ID);
        assert!(batch.events.is_empty());
        // the sentinel is ackable as a no-op
        service.ack(&identity, NO_BATCH_ID).unwrap();
    }

    #[tokio::test]
    async fn test_ack_must_follow_batch_order() {
        let service = service();
        let identity = ClientIdentity::new("example", 1001);
        service.subscribe(identity.clone()).await;

        service.event_log.put(transaction(0)).await;
        service.event_log.put(transaction(100)).await;

        let b1 = service.get_without_ack(&identity, 3, None).await.unwrap();
        let b2 = service.get_without_ack(&identity, 3, None).await.unwrap();
        assert!(b1.batch_id < b2.batch_id);

        let result = service.ack(&identity, b2.batch_id);
        assert!(matches!(result, Err(AppError::OrderingViolation(_))));

        service.ack(&identity, b1.batch_id).unwrap();
        service.ack(&identity, b2.batch_id).unwrap();
    }

    #[tokio::test]
    async fn test_ack_advances_durable_cursor_to_safe_boundary() {
        let service = service();
        let identity = ClientIdentity::new("example", 1001);
        service.subscribe(identity.clone()).await;

        service.event_log.put(transaction(0)).await;
        let batch = service.get_without_ack(&identity, 3, None).await.unwrap();
        assert_eq!(batch.events.len(), 3);
        service.ack(&identity, batch.batch_id).unwrap();

        let cursor = service.registry.get_cursor(&identity).await.unwrap();
        // transaction end at offset 8 is the safe boundary
        assert_eq!(cursor.position.offset, 8);
        assert_eq!(cursor.identity, "10.0.0.1:3306");
    }

    #[tokio::test]
    async fn test_rollback_replays_delivered_batch() {
        let service = service();
        let identity = ClientIdentity::new("example", 1001);
        service.subscribe(identity.clone()).await;

        service.event_log.put(transaction(0)).await;
        let first = service.get_without_ack(&identity, 3, None).await.unwrap();
        let offsets: Vec<i64> = first.events.iter().map(|e| e.header.offset).collect();

        service.rollback(&identity);
        let replayed = service.get_without_ack(&identity, 3, None).await.unwrap();
        let replayed_offsets: Vec<i64> =
            replayed.events.iter().map(|e| e.header.offset).collect();
        assert_eq!(offsets, replayed_offsets);
        // the replayed window gets a fresh id
        assert!(replayed.batch_id > first.batch_id);
    }

    #[tokio::test]
    async fn test_rollback_batch_checks_oldest() {
        let service = service();
        let identity = ClientIdentity::new("example", 1001);
        service.subscribe(identity.clone()).await;

        service.event_log.put(transaction(0)).await;
        service.event_log.put(transaction(100)).await;
        let b1 = service.get_without_ack(&identity, 3, None).await.unwrap();
        let b2 = service.get_without_ack(&identity, 3, None).await.unwrap();

        assert!(service.rollback_batch(&identity, b2.batch_id).is_err());
        service.rollback_batch(&identity, b1.batch_id).unwrap();
        assert!(service.registry.list_batches(&identity).is_empty());
    }

    #[tokio::test]
    async fn test_get_is_fetch_and_forget() {
        let service = service();
        let identity = ClientIdentity::new("example", 1001);
        service.subscribe(identity.clone()).await;

        service.event_log.put(transaction(0)).await;
        let batch = service.get(&identity, 3, None).await.unwrap();
        assert_eq!(batch.events.len(), 3);
        // already confirmed: nothing outstanding
        assert!(service.registry.list_batches(&identity).is_empty());
    }

    #[tokio::test]
    async fn test_assembler_to_consumer_flow() {
        let config = StoreConfig {
            buffer_size: 64,
            ..Default::default()
        };
        let event_log = Arc::new(EventLog::new(&config));
        let registry = Arc::new(ConsumerRegistry::memory());
        let service =
            PipelineService::new("10.0.0.1:3306", event_log.clone(), registry.clone());
        let mut assembler = TransactionAssembler::new(16, LogSink::new(event_log));

        for e in transaction(0) {
            assembler.add(e).await.unwrap();
        }
        // an empty transaction is filtered out before the log
        assembler
            .add(event(EntryKind::TransactionBegin, EventType::None, 100))
            .await
            .unwrap();
        assembler
            .add(event(EntryKind::TransactionEnd, EventType::None, 104))
            .await
            .unwrap();

        let identity = ClientIdentity::new("example", 1001);
        service.subscribe(identity.clone()).await;
        let batch = service.get_without_ack(&identity, 10, None).await.unwrap();
        let offsets: Vec<i64> = batch.events.iter().map(|e| e.header.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        service.ack(&identity, batch.batch_id).unwrap();
    }

    #[test]
    fn test_recovery_backoff_bounded_jitter() {
        let base = Duration::from_millis(100);
        for attempt in 0..8 {
            let delay = recovery_backoff(base, attempt);
            let scale = 1u64 << attempt.min(6);
            assert!(delay >= Duration::from_millis(50 * scale));
            assert!(delay <= Duration::from_millis(150 * scale));
        }
    }
}
