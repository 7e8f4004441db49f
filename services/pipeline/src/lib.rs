//! Stream processors of the real-time leaderboard
//!
//! ```text
//! client / generator ─► ScoreIngestion ─► [scoring]
//!                                            │
//!                      ┌─────────────────────┴──────────────────┐
//!                      ▼                                        ▼
//!            persistence (ScoreStore)           ranking-update (RankingCache)
//!                                                               │
//!                                                      [ranking-changed]
//!                                                               ▼
//!                                             snapshot-builder (top 10 + nicknames)
//!                                                               │
//!                                                         [leaderboard]
//! ```
//!
//! Every processor is a [`consumer::ConsumerRunner`] around a
//! [`consumer::RecordHandler`]; positions are committed only after the
//! handler succeeded.

pub mod cache;
pub mod consumer;
pub mod generator;
pub mod health;
pub mod ingestion;
pub mod persistence;
pub mod processors;
pub mod ranking_update;
pub mod retry;
pub mod shutdown;
pub mod snapshot_builder;
pub mod store;

pub use cache::{
    CacheError, MemoryNicknameCache, MemoryRankingCache, NicknameCache, RankingCache,
    RedisNicknameCache, RedisRankingCache,
};
pub use consumer::{ConsumerError, ConsumerRunner, HandleError, RecordHandler, RunnerConfig};
pub use generator::{GeneratorConfig, LoadGenerator};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry};
pub use ingestion::{IngestionError, ScoreIngestion};
pub use processors::{spawn_processors, spawn_runner, Backends, ConsumerGroups, ProcessorSettings};
pub use retry::{RetryError, RetryPolicy};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use snapshot_builder::{SnapshotBuilder, SnapshotError};
pub use store::{MemoryScoreStore, PgScoreStore, ScoreStore, StoreError};
