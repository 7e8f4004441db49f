//! Durable score store
//!
//! Every consumed score event becomes one row. There is no deduplication:
//! a record redelivered after a crash between save and commit is saved
//! twice.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::info;
use types::score::ScoreEvent;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn save(&self, event: &ScoreEvent) -> Result<(), StoreError>;
}

/// In-process store, used by the single-process backend and tests.
#[derive(Debug, Default)]
pub struct MemoryScoreStore {
    rows: Mutex<Vec<ScoreEvent>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ScoreEvent> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn save(&self, event: &ScoreEvent) -> Result<(), StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("row buffer poisoned".to_string()))?;
        rows.push(event.clone());
        Ok(())
    }
}

/// PostgreSQL store writing to `game_scores`.
#[derive(Clone)]
pub struct PgScoreStore {
    pool: Pool<Postgres>,
    op_timeout: Duration,
}

impl PgScoreStore {
    pub fn new(pool: Pool<Postgres>, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(op_timeout)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected score store");
        Ok(Self::new(pool, op_timeout))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[async_trait]
impl ScoreStore for PgScoreStore {
    async fn save(&self, event: &ScoreEvent) -> Result<(), StoreError> {
        let insert = sqlx::query(
            "INSERT INTO game_scores (user_id, score, created_at) VALUES ($1, $2, $3)",
        )
        .bind(event.user_id.value())
        .bind(event.score)
        .bind(event.created_at)
        .execute(&self.pool);

        match tokio::time::timeout(self.op_timeout, insert).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(StoreError::Timeout(self.op_timeout.as_millis() as u64)),
        }
    }
}
