//! Record and consumer descriptors shared by every backend.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Where a record sits inside its partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Position {
    /// Dense offset (in-memory log)
    Offset(u64),
    /// Redis stream entry id, e.g. `1708123456789-0`
    StreamId(String),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Offset(offset) => write!(f, "{}", offset),
            Position::StreamId(id) => write!(f, "{}", id),
        }
    }
}

/// A record read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub position: Position,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    /// Unix milliseconds when the record was appended
    pub timestamp_ms: i64,
}

/// Identifies one consumer-group member on one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub topic: String,
    pub group: String,
    /// Member name inside the group. Backends that track in-flight records
    /// per member (Redis) redeliver them to a member with the same name.
    pub member: String,
}

impl ConsumerSpec {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        let group = group.into();
        Self {
            topic: topic.into(),
            member: format!("{}-0", group),
            group,
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }
}

/// Backlog of one partition for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLag {
    pub partition: u32,
    pub lag: u64,
}

/// Pick the partition for a record.
///
/// Keyed records hash with FNV-1a so a key always maps to the same
/// partition across processes; keyless records are spread round-robin.
pub fn partition_for(key: Option<&str>, partitions: u32, round_robin: &AtomicU32) -> u32 {
    let partitions = partitions.max(1);
    match key {
        Some(key) => {
            let mut hash: u32 = 0x811c_9dc5;
            for byte in key.as_bytes() {
                hash ^= u32::from(*byte);
                hash = hash.wrapping_mul(0x0100_0193);
            }
            hash % partitions
        }
        None => round_robin.fetch_add(1, Ordering::Relaxed) % partitions,
    }
}
