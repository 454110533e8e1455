//! Message persistence
//!
//! A batch is inserted inside one transaction, one `INSERT ... ON CONFLICT
//! (message_id) DO NOTHING` per record. Already-stored ids are skipped and
//! counted as duplicates; any statement failure rolls the whole batch back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use cr_common::{ChatMessage, MessageType};

use crate::error::{RecordError, Result, StoreError};

/// Validated row for the `messages` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub message_id: Uuid,
    pub room_id: String,
    pub user_id: i32,
    pub username: String,
    pub message: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub server_id: Option<String>,
    pub client_ip: Option<String>,
}

impl PersistedRecord {
    /// Parse a raw broadcast payload into a row.
    pub fn parse(raw: &str) -> std::result::Result<Self, RecordError> {
        let message = ChatMessage::parse_validated(raw)?;
        Self::try_from(message)
    }
}

impl TryFrom<ChatMessage> for PersistedRecord {
    type Error = RecordError;

    fn try_from(message: ChatMessage) -> std::result::Result<Self, RecordError> {
        let user_id = message
            .user_id
            .parse()
            .map_err(|_| RecordError::UserId(message.user_id.clone()))?;

        Ok(Self {
            message_id: message.message_id,
            room_id: message.room_id,
            user_id,
            username: message.username,
            message: message.message,
            message_type: message.message_type,
            timestamp: message.timestamp,
            server_id: message.server_id,
            client_ip: message.client_ip,
        })
    }
}

/// Rows affected by one committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert all records atomically, skipping ids that already exist.
    async fn insert_batch(&self, records: &[PersistedRecord]) -> Result<BatchOutcome>;

    /// Create the messages table if it is missing.
    async fn init_schema(&self) -> Result<()>;
}

/// Open a store for `postgres://` or `sqlite:` urls.
pub async fn connect_store(
    url: &str,
    max_connections: u32,
    min_connections: u32,
) -> Result<Arc<dyn MessageStore>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        info!(max_connections, "Connected to PostgreSQL message store");
        Ok(Arc::new(PostgresMessageStore::new(pool)))
    } else if url.starts_with("sqlite:") {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        info!("Connected to SQLite message store");
        Ok(Arc::new(SqliteMessageStore::new(pool)))
    } else {
        Err(StoreError::UnsupportedUrl(url.to_string()))
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn insert_batch(&self, records: &[PersistedRecord]) -> Result<BatchOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();

        for record in records {
            let result = sqlx::query(
                "INSERT INTO messages \
                 (message_id, room_id, user_id, username, message, message_type, timestamp, server_id, client_ip) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (message_id) DO NOTHING",
            )
            .bind(record.message_id)
            .bind(&record.room_id)
            .bind(record.user_id)
            .bind(&record.username)
            .bind(&record.message)
            .bind(record.message_type.as_str())
            .bind(record.timestamp.naive_utc())
            .bind(&record.server_id)
            .bind(&record.client_ip)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => outcome.inserted += 1,
                Ok(_) => outcome.duplicates += 1,
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        debug!(inserted = outcome.inserted, duplicates = outcome.duplicates, "Committed batch");
        Ok(outcome)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id UUID PRIMARY KEY,
                room_id VARCHAR(50) NOT NULL,
                user_id INTEGER NOT NULL,
                username VARCHAR(20) NOT NULL,
                message TEXT NOT NULL,
                message_type VARCHAR(10) NOT NULL,
                timestamp TIMESTAMP NOT NULL,
                server_id TEXT,
                client_ip VARCHAR(45),
                created_at TIMESTAMP NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_room_time ON messages (room_id, timestamp)")
            .execute(&self.pool)
            .await?;

        info!("PostgreSQL message schema ready");
        Ok(())
    }
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert_batch(&self, records: &[PersistedRecord]) -> Result<BatchOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();

        for record in records {
            let result = sqlx::query(
                "INSERT INTO messages \
                 (message_id, room_id, user_id, username, message, message_type, timestamp, server_id, client_ip) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (message_id) DO NOTHING",
            )
            .bind(record.message_id.to_string())
            .bind(&record.room_id)
            .bind(record.user_id)
            .bind(&record.username)
            .bind(&record.message)
            .bind(record.message_type.as_str())
            .bind(record.timestamp)
            .bind(&record.server_id)
            .bind(&record.client_ip)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => outcome.inserted += 1,
                Ok(_) => outcome.duplicates += 1,
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                message TEXT NOT NULL,
                message_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                server_id TEXT,
                client_ip TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_room_time ON messages (room_id, timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_common::ValidationError;
    use sqlx::Row;

    async fn sqlite_store() -> SqliteMessageStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteMessageStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn record(room: &str) -> PersistedRecord {
        let message = ChatMessage::new("12", "dave", "persist me", room, MessageType::Text);
        PersistedRecord::try_from(message).unwrap()
    }

    #[test]
    fn test_parse_record() {
        let mut message = ChatMessage::new("900", "erin", "hi", "room4", MessageType::Join);
        message.server_id = Some("node-b".to_string());
        let record = PersistedRecord::parse(&message.to_json().unwrap()).unwrap();

        assert_eq!(record.user_id, 900);
        assert_eq!(record.message_id, message.message_id);
        assert_eq!(record.server_id.as_deref(), Some("node-b"));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(PersistedRecord::parse("{").is_err());

        let message = ChatMessage::new("0", "erin", "hi", "room4", MessageType::Text);
        assert!(matches!(
            PersistedRecord::parse(&message.to_json().unwrap()),
            Err(RecordError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_rejects_room_wider_than_column() {
        let room = "x".repeat(60);
        let message = ChatMessage::new("31", "erin", "hi", &room, MessageType::Text);
        assert!(matches!(
            PersistedRecord::parse(&message.to_json().unwrap()),
            Err(RecordError::Invalid(ValidationError::InvalidRoomId(_)))
        ));
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = sqlite_store().await;
        let first = record("room1");
        let second = record("room1");

        let outcome = store.insert_batch(&[first.clone(), second.clone()]).await.unwrap();
        assert_eq!(outcome, BatchOutcome { inserted: 2, duplicates: 0 });

        let outcome = store.insert_batch(&[first.clone()]).await.unwrap();
        assert_eq!(outcome, BatchOutcome { inserted: 0, duplicates: 1 });

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_is_skipped() {
        let store = sqlite_store().await;
        let r = record("room2");

        let outcome = store.insert_batch(&[r.clone(), r.clone()]).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn test_failed_statement_rolls_back_batch() {
        let store = sqlite_store().await;
        sqlx::query("CREATE TRIGGER reject_room9 BEFORE INSERT ON messages WHEN NEW.room_id = 'room9' BEGIN SELECT RAISE(ABORT, 'room9 rejected'); END")
            .execute(store.pool())
            .await
            .unwrap();

        let result = store.insert_batch(&[record("room1"), record("room9")]).await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_stored_columns() {
        let store = sqlite_store().await;
        let r = record("room3");
        store.insert_batch(&[r.clone()]).await.unwrap();

        let row = sqlx::query("SELECT room_id, user_id, message_type, created_at FROM messages WHERE message_id = ?")
            .bind(r.message_id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();

        assert_eq!(row.get::<String, _>("room_id"), "room3");
        assert_eq!(row.get::<i64, _>("user_id"), 12);
        assert_eq!(row.get::<String, _>("message_type"), "TEXT");
        assert!(!row.get::<String, _>("created_at").is_empty());
    }

    #[tokio::test]
    async fn test_init_schema_twice() {
        let store = sqlite_store().await;
        store.init_schema().await.unwrap();
    }
}
