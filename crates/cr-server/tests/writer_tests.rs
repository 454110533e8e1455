//! Durable writer behavior against real and fake stores

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

use cr_common::{ChatMessage, MessageType};
use cr_server::{BatchOutcome, DurableWriter, MessageStore, PersistedRecord, SqliteMessageStore, StoreError, WriterConfig};

/// Keeps every batch in memory
#[derive(Default)]
struct MemoryStore {
    batches: Mutex<Vec<Vec<Uuid>>>,
}

impl MemoryStore {
    fn rows(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_batch(&self, records: &[PersistedRecord]) -> Result<BatchOutcome, StoreError> {
        self.batches.lock().push(records.iter().map(|r| r.message_id).collect());
        Ok(BatchOutcome {
            inserted: records.len() as u64,
            duplicates: 0,
        })
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn insert_batch(&self, _records: &[PersistedRecord]) -> Result<BatchOutcome, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Blocks each insert until a permit is released
struct GatedStore {
    gate: Semaphore,
    inner: MemoryStore,
}

#[async_trait]
impl MessageStore for GatedStore {
    async fn insert_batch(&self, records: &[PersistedRecord]) -> Result<BatchOutcome, StoreError> {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.inner.insert_batch(records).await
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn config() -> WriterConfig {
    WriterConfig {
        workers: 2,
        batch_size: 100,
        flush_interval: Duration::from_millis(50),
        buffer_size: 100,
        enqueue_timeout: Duration::from_millis(50),
        idle_poll: Duration::from_millis(5),
        shutdown_grace: Duration::from_secs(5),
    }
}

fn payload(room_id: &str) -> String {
    ChatMessage::new("314", "carol", "store me", room_id, MessageType::Text)
        .to_json()
        .unwrap()
}

async fn sqlite_store() -> Arc<SqliteMessageStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteMessageStore::new(pool);
    store.init_schema().await.unwrap();
    Arc::new(store)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_same_payload_twice_stores_one_row() {
    let store = sqlite_store().await;
    let writer = DurableWriter::start(store.clone(), config());

    let raw = payload("room1");
    assert!(writer.enqueue(raw.clone()).await);
    assert!(writer.enqueue(raw).await);
    writer.shutdown().await;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);

    let stats = writer.stats();
    assert_eq!(stats.written, 1);
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test]
async fn test_partial_batch_flushed_within_interval() {
    let store = Arc::new(MemoryStore::default());
    let writer = DurableWriter::start(
        store.clone(),
        WriterConfig {
            workers: 1,
            batch_size: 1000,
            flush_interval: Duration::from_millis(500),
            ..config()
        },
    );

    // Let the worker's interval start before the entry arrives
    tokio::time::sleep(Duration::from_millis(100)).await;
    let enqueued_at = Instant::now();
    assert!(writer.enqueue(payload("room2")).await);

    wait_until(|| store.rows() == 1).await;
    assert!(enqueued_at.elapsed() <= Duration::from_millis(500) + Duration::from_millis(150));

    writer.shutdown().await;
}

#[tokio::test]
async fn test_full_batch_flushes_without_waiting() {
    let store = Arc::new(MemoryStore::default());
    let writer = DurableWriter::start(
        store.clone(),
        WriterConfig {
            workers: 1,
            batch_size: 3,
            flush_interval: Duration::from_secs(60),
            ..config()
        },
    );

    for _ in 0..3 {
        assert!(writer.enqueue(payload("room3")).await);
    }
    wait_until(|| store.rows() == 3).await;
    assert_eq!(store.batches.lock().len(), 1);

    writer.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_residual_batch() {
    let store = Arc::new(MemoryStore::default());
    let writer = DurableWriter::start(
        store.clone(),
        WriterConfig {
            flush_interval: Duration::from_secs(60),
            ..config()
        },
    );

    for _ in 0..5 {
        assert!(writer.enqueue(payload("room4")).await);
    }
    wait_until(|| writer.buffer_depth() == 0).await;
    assert_eq!(store.rows(), 0);

    writer.shutdown().await;
    assert_eq!(store.rows(), 5);
    assert_eq!(writer.stats().written, 5);
    assert!(!writer.is_running());
}

#[tokio::test]
async fn test_failed_batch_is_counted_not_retried() {
    let writer = DurableWriter::start(
        Arc::new(FailingStore),
        WriterConfig {
            workers: 1,
            ..config()
        },
    );

    for _ in 0..4 {
        assert!(writer.enqueue(payload("room5")).await);
    }
    writer.shutdown().await;

    let stats = writer.stats();
    assert_eq!(stats.written, 0);
    assert_eq!(stats.failed_rows, 4);
    assert!(stats.failed_batches >= 1);
}

#[tokio::test]
async fn test_unparseable_payloads_dropped() {
    let store = Arc::new(MemoryStore::default());
    let writer = DurableWriter::start(store.clone(), config());

    assert!(writer.enqueue("not json".to_string()).await);
    let invalid = ChatMessage::new("0", "carol", "bad id", "room6", MessageType::Text);
    assert!(writer.enqueue(invalid.to_json().unwrap()).await);
    assert!(writer.enqueue(payload("room6")).await);
    writer.shutdown().await;

    let stats = writer.stats();
    assert_eq!(stats.parse_failures, 2);
    assert_eq!(stats.written, 1);
    assert_eq!(store.rows(), 1);
}

#[tokio::test]
async fn test_full_buffer_rejects_after_bounded_wait() {
    let store = Arc::new(GatedStore {
        gate: Semaphore::new(0),
        inner: MemoryStore::default(),
    });
    let writer = DurableWriter::start(
        store.clone(),
        WriterConfig {
            workers: 1,
            batch_size: 1,
            buffer_size: 1,
            ..config()
        },
    );

    // The worker takes the first entry and blocks in its flush
    assert!(writer.enqueue(payload("room8")).await);
    wait_until(|| writer.buffer_depth() == 0).await;

    assert!(writer.enqueue(payload("room8")).await);
    let started = Instant::now();
    assert!(!writer.enqueue(payload("room8")).await);
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(writer.stats().rejected, 1);

    store.gate.add_permits(10);
    writer.shutdown().await;
    assert_eq!(store.inner.rows(), 2);
}

#[tokio::test]
async fn test_enqueue_after_shutdown_rejected() {
    let writer = DurableWriter::start(Arc::new(MemoryStore::default()), config());
    writer.shutdown().await;

    assert!(!writer.enqueue(payload("room9")).await);
    assert_eq!(writer.stats().rejected, 1);
}
