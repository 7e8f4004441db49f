//! Redis Streams backend
//!
//! Each partition of a topic is its own stream, `{prefix}{topic}:{partition}`.
//! Groups are created with `XGROUP CREATE ... MKSTREAM` starting at `0`, so a
//! fresh group replays the retained stream. Commit is `XACK`.
//!
//! On subscribe a member first re-reads its own pending entries (delivered
//! earlier but never acknowledged) before asking for new ones, which gives
//! at-least-once delivery across restarts as long as the member name is
//! stable.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::error::LogError;
use crate::record::{partition_for, ConsumerSpec, PartitionLag, Position, Record};
use crate::{Consumer, EventLog, Producer};

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_TIMESTAMP: &str = "ts";

/// Configuration for the Redis Streams backend.
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Prefix for every stream key
    pub prefix: String,
    /// Partitions per topic
    pub partitions: u32,
    /// Upper bound for a single Redis round trip (excluding `BLOCK` time)
    pub op_timeout: Duration,
    /// Max entries fetched per `XREADGROUP`
    pub batch_size: usize,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            prefix: "leaderboard:".to_string(),
            partitions: 4,
            op_timeout: Duration::from_secs(2),
            batch_size: 100,
        }
    }
}

impl RedisStreamConfig {
    fn stream_key(&self, topic: &str, partition: u32) -> String {
        format!("{}{}:{}", self.prefix, topic, partition)
    }
}

/// [`EventLog`] over Redis Streams.
#[derive(Clone)]
pub struct RedisStreamLog {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: Arc<RedisStreamConfig>,
    round_robin: Arc<AtomicU32>,
}

impl RedisStreamLog {
    pub async fn connect(client: redis::Client, config: RedisStreamConfig) -> Result<Self, LogError> {
        let conn = with_timeout(config.op_timeout, client.get_multiplexed_async_connection()).await?;
        info!(
            prefix = %config.prefix,
            partitions = config.partitions,
            "Connected Redis stream log"
        );

        Ok(Self {
            client,
            conn,
            config: Arc::new(config),
            round_robin: Arc::new(AtomicU32::new(0)),
        })
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, LogError>
where
    F: std::future::Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(LogError::from),
        Err(_) => Err(LogError::Timeout(limit.as_millis() as u64)),
    }
}

#[async_trait]
impl Producer for RedisStreamLog {
    async fn send(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), LogError> {
        let partition = partition_for(key, self.config.partitions, &self.round_robin);
        let stream = self.config.stream_key(topic, partition);
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();

        let mut fields: Vec<(&str, Vec<u8>)> = vec![
            (FIELD_PAYLOAD, payload.to_vec()),
            (FIELD_TIMESTAMP, timestamp.into_bytes()),
        ];
        if let Some(key) = key {
            fields.push((FIELD_KEY, key.as_bytes().to_vec()));
        }

        let mut conn = self.conn.clone();
        let id: String = with_timeout(
            self.config.op_timeout,
            conn.xadd(&stream, "*", fields.as_slice()),
        )
        .await?;
        debug!(stream = %stream, id = %id, "Appended record");
        Ok(())
    }
}

#[async_trait]
impl EventLog for RedisStreamLog {
    fn producer(&self) -> Arc<dyn Producer> {
        Arc::new(self.clone())
    }

    async fn subscribe(&self, spec: ConsumerSpec) -> Result<Box<dyn Consumer>, LogError> {
        // Blocking reads get their own connection so they never stall the
        // shared producer connection.
        let mut conn = with_timeout(
            self.config.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await?;

        let streams: Vec<String> = (0..self.config.partitions)
            .map(|p| self.config.stream_key(&spec.topic, p))
            .collect();

        for stream in &streams {
            let created: redis::RedisResult<()> = tokio::time::timeout(
                self.config.op_timeout,
                conn.xgroup_create_mkstream(stream, &spec.group, "0"),
            )
            .await
            .map_err(|_| LogError::Timeout(self.config.op_timeout.as_millis() as u64))?;

            match created {
                Ok(()) => info!(stream = %stream, group = %spec.group, "Created consumer group"),
                Err(err) if err.code() == Some("BUSYGROUP") => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(Box::new(RedisStreamConsumer {
            cursors: vec!["0".to_string(); streams.len()],
            streams,
            conn,
            config: self.config.clone(),
            spec,
            replaying_pending: true,
            buffer: VecDeque::new(),
        }))
    }
}

struct RedisStreamConsumer {
    conn: MultiplexedConnection,
    config: Arc<RedisStreamConfig>,
    spec: ConsumerSpec,
    streams: Vec<String>,
    /// Read cursor per stream while replaying pending entries
    cursors: Vec<String>,
    replaying_pending: bool,
    buffer: VecDeque<Record>,
}

impl RedisStreamConsumer {
    fn partition_of(&self, stream: &str) -> Option<u32> {
        self.streams.iter().position(|s| s == stream).map(|p| p as u32)
    }

    fn absorb(&mut self, reply: StreamReadReply) -> usize {
        let mut absorbed = 0;
        for stream in reply.keys {
            let Some(partition) = self.partition_of(&stream.key) else {
                warn!(stream = %stream.key, "Reply for unknown stream ignored");
                continue;
            };

            for entry in stream.ids {
                if self.replaying_pending {
                    self.cursors[partition as usize] = entry.id.clone();
                }

                let payload: Vec<u8> = entry.get(FIELD_PAYLOAD).unwrap_or_default();
                let key: Option<String> = entry.get(FIELD_KEY);
                let timestamp_ms = entry
                    .get::<String>(FIELD_TIMESTAMP)
                    .and_then(|ts| ts.parse().ok())
                    .unwrap_or(0);

                self.buffer.push_back(Record {
                    topic: self.spec.topic.clone(),
                    partition,
                    position: Position::StreamId(entry.id),
                    key,
                    payload,
                    timestamp_ms,
                });
                absorbed += 1;
            }
        }
        absorbed
    }

    async fn read_pending(&mut self) -> Result<(), LogError> {
        let options = StreamReadOptions::default()
            .group(&self.spec.group, &self.spec.member)
            .count(self.config.batch_size);

        let reply: Option<StreamReadReply> = with_timeout(
            self.config.op_timeout,
            self.conn.xread_options(&self.streams, &self.cursors, &options),
        )
        .await?;

        let absorbed = reply.map(|r| self.absorb(r)).unwrap_or(0);
        if absorbed == 0 {
            debug!(
                topic = %self.spec.topic,
                group = %self.spec.group,
                "Pending replay finished"
            );
            self.replaying_pending = false;
        } else {
            info!(
                topic = %self.spec.topic,
                group = %self.spec.group,
                redelivered = absorbed,
                "Replaying unacknowledged records"
            );
        }
        Ok(())
    }

    async fn read_new(&mut self, timeout: Duration) -> Result<(), LogError> {
        let block_ms = timeout.as_millis().max(1) as usize;
        let options = StreamReadOptions::default()
            .group(&self.spec.group, &self.spec.member)
            .count(self.config.batch_size)
            .block(block_ms);
        let ids = vec![">"; self.streams.len()];

        let reply: Option<StreamReadReply> = with_timeout(
            timeout + self.config.op_timeout,
            self.conn.xread_options(&self.streams, &ids, &options),
        )
        .await?;

        if let Some(reply) = reply {
            self.absorb(reply);
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for RedisStreamConsumer {
    fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<Record>, LogError> {
        if let Some(record) = self.buffer.pop_front() {
            return Ok(Some(record));
        }

        if self.replaying_pending {
            self.read_pending().await?;
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
        }

        self.read_new(timeout).await?;
        Ok(self.buffer.pop_front())
    }

    async fn commit(&mut self, record: &Record) -> Result<(), LogError> {
        let Position::StreamId(id) = &record.position else {
            return Err(LogError::Rejected(format!(
                "redis stream log cannot commit position {}",
                record.position
            )));
        };
        let stream = self
            .streams
            .get(record.partition as usize)
            .ok_or_else(|| LogError::Rejected(format!("unknown partition {}", record.partition)))?
            .clone();

        let _acked: usize = with_timeout(
            self.config.op_timeout,
            self.conn.xack(&stream, &self.spec.group, &[id]),
        )
        .await?;
        Ok(())
    }

    /// Reports entries delivered to the group but not yet acknowledged.
    async fn lag(&mut self) -> Result<Vec<PartitionLag>, LogError> {
        let mut lags = Vec::with_capacity(self.streams.len());
        for (partition, stream) in self.streams.iter().enumerate() {
            let reply: StreamPendingReply = with_timeout(
                self.config.op_timeout,
                self.conn.xpending(stream, &self.spec.group),
            )
            .await?;
            lags.push(PartitionLag {
                partition: partition as u32,
                lag: reply.count() as u64,
            });
        }
        Ok(lags)
    }
}
