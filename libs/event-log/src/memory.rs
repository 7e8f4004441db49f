//! In-process event log
//!
//! Each group has its own committed offset per partition; a new subscriber
//! resumes from the group's commits, so anything polled but not committed is
//! redelivered. A group is served by a single member that owns all
//! partitions.
//!
//! Records are released once every group subscribed to the topic has
//! committed past them. Offsets stay absolute: a partition remembers the
//! offset of its oldest retained record. A group subscribing after records
//! were released starts at the oldest retained one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::LogError;
use crate::record::{partition_for, ConsumerSpec, PartitionLag, Position, Record};
use crate::{Consumer, EventLog, Producer};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    timestamp_ms: i64,
}

#[derive(Debug, Default)]
struct Partition {
    /// Offset of `records[0]`
    base: u64,
    records: VecDeque<StoredRecord>,
}

impl Partition {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&StoredRecord> {
        let index = offset.checked_sub(self.base)?;
        self.records.get(index as usize)
    }

    /// Drop every record below `offset`.
    fn release_below(&mut self, offset: u64) -> usize {
        let count = offset.saturating_sub(self.base).min(self.records.len() as u64);
        self.records.drain(..count as usize);
        self.base += count;
        count as usize
    }
}

#[derive(Debug)]
struct TopicState {
    partitions: Vec<Partition>,
    /// group -> next offset to deliver, per partition
    committed: HashMap<String, Vec<u64>>,
}

impl TopicState {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Partition::default()).collect(),
            committed: HashMap::new(),
        }
    }

    /// Where a group without commits starts: the oldest retained records.
    fn earliest(&self) -> Vec<u64> {
        self.partitions.iter().map(|p| p.base).collect()
    }

    /// Release records every group has committed past on `partition`.
    fn compact(&mut self, partition: usize) -> usize {
        let floor = self
            .committed
            .values()
            .filter_map(|offsets| offsets.get(partition))
            .min()
            .copied();
        match (floor, self.partitions.get_mut(partition)) {
            (Some(floor), Some(records)) => records.release_below(floor),
            _ => 0,
        }
    }
}

struct Inner {
    partitions: u32,
    topics: Mutex<HashMap<String, TopicState>>,
    appended: Notify,
    round_robin: AtomicU32,
    closed: AtomicBool,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicState>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory [`EventLog`]. Cloning shares the same log.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                topics: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                round_robin: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Reject all further appends.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
    }

    /// Number of records of `topic` still retained, across all partitions.
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .topics()
            .get(topic)
            .map(|t| t.partitions.iter().map(|p| p.records.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Every retained record of `topic`, partition by partition, in offset
    /// order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let topics = self.inner.topics();
        let Some(state) = topics.get(topic) else {
            return Vec::new();
        };

        state
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.records.iter().zip(records.base..).map(move |(stored, offset)| {
                    to_record(topic, partition as u32, offset, stored)
                })
            })
            .collect()
    }

    /// Committed offsets of `group` on `topic`, one entry per partition.
    pub fn committed(&self, topic: &str, group: &str) -> Vec<u64> {
        self.inner
            .topics()
            .get(topic)
            .and_then(|t| t.committed.get(group).cloned())
            .unwrap_or_else(|| vec![0; self.inner.partitions as usize])
    }
}

fn to_record(topic: &str, partition: u32, offset: u64, stored: &StoredRecord) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        position: Position::Offset(offset),
        key: stored.key.clone(),
        payload: stored.payload.clone(),
        timestamp_ms: stored.timestamp_ms,
    }
}

#[async_trait]
impl Producer for MemoryLog {
    async fn send(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), LogError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed);
        }

        let partition = partition_for(key, self.inner.partitions, &self.inner.round_robin);
        {
            let mut topics = self.inner.topics();
            let state = topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicState::new(self.inner.partitions));
            state.partitions[partition as usize].records.push_back(StoredRecord {
                key: key.map(str::to_string),
                payload: payload.to_vec(),
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            });
        }

        self.inner.appended.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    fn producer(&self) -> Arc<dyn Producer> {
        Arc::new(self.clone())
    }

    async fn subscribe(&self, spec: ConsumerSpec) -> Result<Box<dyn Consumer>, LogError> {
        let positions = {
            let mut topics = self.inner.topics();
            let state = topics
                .entry(spec.topic.clone())
                .or_insert_with(|| TopicState::new(self.inner.partitions));
            let earliest = state.earliest();
            state
                .committed
                .entry(spec.group.clone())
                .or_insert(earliest)
                .clone()
        };

        debug!(
            topic = %spec.topic,
            group = %spec.group,
            member = %spec.member,
            ?positions,
            "Memory consumer subscribed"
        );

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            spec,
            positions,
            next_partition: 0,
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    spec: ConsumerSpec,
    /// Next offset to fetch, per partition
    positions: Vec<u64>,
    next_partition: usize,
}

impl MemoryConsumer {
    fn try_fetch(&mut self) -> Option<Record> {
        let topics = self.inner.topics();
        let state = topics.get(&self.spec.topic)?;
        let count = state.partitions.len();

        for step in 0..count {
            let partition = (self.next_partition + step) % count;
            // Never wait on records that were already released.
            let offset = self.positions[partition].max(state.partitions[partition].base);
            if let Some(stored) = state.partitions[partition].get(offset) {
                self.positions[partition] = offset + 1;
                self.next_partition = (partition + 1) % count;
                return Some(to_record(&self.spec.topic, partition as u32, offset, stored));
            }
        }
        None
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, LogError> {
        let deadline = Instant::now() + timeout;
        let inner = self.inner.clone();

        loop {
            let notified = inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.try_fetch() {
                return Ok(Some(record));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<(), LogError> {
        let Position::Offset(offset) = record.position else {
            return Err(LogError::Rejected(format!(
                "memory log cannot commit position {}",
                record.position
            )));
        };

        let mut topics = self.inner.topics();
        let state = topics
            .get_mut(&self.spec.topic)
            .ok_or_else(|| LogError::Rejected(format!("unknown topic {}", self.spec.topic)))?;
        let earliest = state.earliest();
        let committed = state
            .committed
            .entry(self.spec.group.clone())
            .or_insert(earliest);

        let slot = committed
            .get_mut(record.partition as usize)
            .ok_or_else(|| LogError::Rejected(format!("unknown partition {}", record.partition)))?;
        *slot = (*slot).max(offset + 1);

        let released = state.compact(record.partition as usize);
        if released > 0 {
            debug!(
                topic = %self.spec.topic,
                partition = record.partition,
                released,
                "Released committed records"
            );
        }
        Ok(())
    }

    async fn lag(&mut self) -> Result<Vec<PartitionLag>, LogError> {
        let topics = self.inner.topics();
        let Some(state) = topics.get(&self.spec.topic) else {
            return Ok(Vec::new());
        };
        let committed = state.committed.get(&self.spec.group);

        Ok(state
            .partitions
            .iter()
            .enumerate()
            .map(|(partition, records)| {
                let done = committed.and_then(|c| c.get(partition)).copied().unwrap_or(0);
                PartitionLag {
                    partition: partition as u32,
                    lag: records.end().saturating_sub(done),
                }
            })
            .collect())
    }
}
