//! Event log contract
//!
//! The pipeline stages talk to each other only through an ordered,
//! partitioned, replayable log with consumer-group semantics. This crate
//! defines that contract and ships two backends:
//!
//! - [`MemoryLog`]: in-process log used for single-process runs and tests
//! - [`RedisStreamLog`]: one Redis stream per partition, consumer groups via
//!   `XREADGROUP`/`XACK`
//!
//! # Delivery
//!
//! ```text
//! Producer::send(topic, key) ──► partition = hash(key) % partitions
//!                                      │
//!              ┌───────────────────────┴───────────┐
//!          group "a"                            group "b"
//!   poll ─► handle ─► commit              poll ─► handle ─► commit
//! ```
//!
//! Every group sees every record. A record that is polled but never
//! committed is delivered again to the next subscriber of the same group,
//! so delivery is at-least-once.

pub mod error;
pub mod memory;
pub mod record;
pub mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use error::LogError;
pub use memory::MemoryLog;
pub use record::{partition_for, ConsumerSpec, PartitionLag, Position, Record};
pub use redis_streams::{RedisStreamConfig, RedisStreamLog};

/// Appends records to topics.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Append one record. Records sharing a key land on the same partition
    /// and keep their relative order.
    async fn send(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), LogError>;
}

/// A member of a consumer group reading one topic.
#[async_trait]
pub trait Consumer: Send {
    /// The topic/group this consumer was built for.
    fn spec(&self) -> &ConsumerSpec;

    /// Fetch the next record, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, LogError>;

    /// Mark `record` (and everything before it on its partition) as
    /// processed for this group.
    async fn commit(&mut self, record: &Record) -> Result<(), LogError>;

    /// Per-partition backlog for this group.
    async fn lag(&mut self) -> Result<Vec<PartitionLag>, LogError>;
}

/// Entry point: hands out producers and builds group consumers.
#[async_trait]
pub trait EventLog: Send + Sync {
    fn producer(&self) -> Arc<dyn Producer>;

    /// Join `spec.group` on `spec.topic`. Positions resume from the
    /// group's last commit.
    async fn subscribe(&self, spec: ConsumerSpec) -> Result<Box<dyn Consumer>, LogError>;
}
