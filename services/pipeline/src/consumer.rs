//! Consumer runner
//!
//! Drives one consumer-group member: poll, hand the record to a
//! [`RecordHandler`], commit only after the handler succeeded. A handler
//! that exhausts its retries halts the runner without committing, so the
//! record is delivered again once the component is restarted.
//!
//! ```text
//! ┌──────┐   record   ┌─────────┐   Ok / Malformed   ┌────────┐
//! │ poll │ ─────────► │ handler │ ─────────────────► │ commit │
//! └──────┘            └─────────┘                    └────────┘
//!                          │ Exhausted
//!                          ▼
//!                        halt (no commit)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_log::{Consumer, ConsumerSpec, EventLog, LogError, Record};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use types::errors::InvalidEventError;

use crate::health::{ComponentStatus, HealthRegistry};
use crate::retry::{pause, RetryError, RetryPolicy};
use crate::shutdown::Shutdown;

/// Outcome of handling one record, other than success.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The payload can never be processed; skip it and move on.
    #[error("malformed record: {0}")]
    Malformed(#[from] InvalidEventError),

    /// A dependency kept failing past the retry budget.
    #[error("{operation} failed permanently: {reason}")]
    Exhausted {
        operation: &'static str,
        reason: String,
    },

    #[error("interrupted by shutdown")]
    Cancelled,
}

impl HandleError {
    pub fn from_retry<E: std::fmt::Display>(operation: &'static str, err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted { last, .. } => HandleError::Exhausted {
                operation,
                reason: last.to_string(),
            },
            RetryError::Cancelled => HandleError::Cancelled,
        }
    }
}

#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record, shutdown: &Shutdown) -> Result<(), HandleError>;
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to subscribe {component}: {source}")]
    Subscribe {
        component: String,
        #[source]
        source: LogError,
    },

    #[error("{component} halted: {reason}")]
    Halted { component: String, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Upper bound on one poll, so shutdown is noticed promptly
    pub poll_timeout: Duration,
    /// How often lag statistics are logged
    pub stats_interval: Duration,
    /// Applied to commits and to poll transport errors
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            stats_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ConsumerRunner {
    name: String,
    consumer: Box<dyn Consumer>,
    handler: Arc<dyn RecordHandler>,
    config: RunnerConfig,
    health: HealthRegistry,
    shutdown: Shutdown,
}

impl ConsumerRunner {
    /// Subscribe `spec` on `log` and wrap the consumer.
    pub async fn subscribe(
        name: impl Into<String>,
        log: &dyn EventLog,
        spec: ConsumerSpec,
        handler: Arc<dyn RecordHandler>,
        config: RunnerConfig,
        health: HealthRegistry,
        shutdown: Shutdown,
    ) -> Result<Self, ConsumerError> {
        let name = name.into();
        health.register(&name);
        let consumer = log
            .subscribe(spec)
            .await
            .map_err(|source| ConsumerError::Subscribe {
                component: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            consumer,
            handler,
            config,
            health,
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until shutdown (`Ok`) or until a record cannot be processed
    /// (`Err(Halted)`).
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        let spec = self.consumer.spec().clone();
        info!(
            component = %self.name,
            topic = %spec.topic,
            group = %spec.group,
            member = %spec.member,
            "Consumer started"
        );
        self.health.set_status(&self.name, ComponentStatus::Running);

        let mut last_stats = Instant::now();
        let mut poll_backoff = self.config.retry.backoff();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            if last_stats.elapsed() >= self.config.stats_interval {
                self.report_lag().await;
                last_stats = Instant::now();
            }

            let polled = tokio::select! {
                _ = self.shutdown.triggered() => break,
                polled = self.consumer.poll(self.config.poll_timeout) => polled,
            };

            let record = match polled {
                Ok(Some(record)) => {
                    poll_backoff.reset();
                    record
                }
                Ok(None) => continue,
                Err(err) => {
                    let delay = poll_backoff.next_delay();
                    error!(
                        component = %self.name,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Poll failed"
                    );
                    if !pause(delay, &self.shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.handler.handle(&record, &self.shutdown).await {
                Ok(()) => {
                    debug!(
                        component = %self.name,
                        partition = record.partition,
                        position = %record.position,
                        "Record processed"
                    );
                    self.health.record_processed(&self.name);
                }
                Err(HandleError::Malformed(err)) => {
                    warn!(
                        component = %self.name,
                        partition = record.partition,
                        position = %record.position,
                        error = %err,
                        "Skipping malformed record"
                    );
                    self.health.record_skipped(&self.name);
                }
                Err(HandleError::Cancelled) => break,
                Err(err @ HandleError::Exhausted { .. }) => {
                    return Err(self.halt(&record, err.to_string()));
                }
            }

            match self.commit(&record).await {
                Ok(()) => {}
                Err(RetryError::Cancelled) => break,
                Err(RetryError::Exhausted { last, .. }) => {
                    return Err(self.halt(&record, format!("commit failed: {}", last)));
                }
            }
        }

        info!(component = %self.name, "Consumer stopped");
        self.health.set_status(&self.name, ComponentStatus::Stopped);
        Ok(())
    }

    /// Commit with the runner's retry policy.
    async fn commit(&mut self, record: &Record) -> Result<(), RetryError<LogError>> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut backoff = self.config.retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.consumer.commit(record).await {
                Ok(()) => return Ok(()),
                Err(last) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        component = %self.name,
                        attempt,
                        error = %err,
                        "Commit failed, retrying"
                    );
                    if !pause(delay, &self.shutdown).await {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }
    }

    fn halt(&self, record: &Record, reason: String) -> ConsumerError {
        error!(
            component = %self.name,
            partition = record.partition,
            position = %record.position,
            reason = %reason,
            "Consumer halted, record left uncommitted"
        );
        self.health.set_status(
            &self.name,
            ComponentStatus::Halted {
                reason: reason.clone(),
            },
        );
        ConsumerError::Halted {
            component: self.name.clone(),
            reason,
        }
    }

    async fn report_lag(&mut self) {
        match self.consumer.lag().await {
            Ok(lags) => {
                let spec = self.consumer.spec();
                let mut total = 0;
                for lag in &lags {
                    total += lag.lag;
                    info!(
                        component = %self.name,
                        topic = %spec.topic,
                        group = %spec.group,
                        partition = lag.partition,
                        lag = lag.lag,
                        "Consumer lag"
                    );
                }
                self.health.record_lag(&self.name, total);
            }
            Err(err) => {
                warn!(component = %self.name, error = %err, "Failed to read consumer lag");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use event_log::{MemoryLog, Producer};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl RecordHandler for Recording {
        async fn handle(&self, record: &Record, _shutdown: &Shutdown) -> Result<(), HandleError> {
            if record.payload == b"bad" {
                return Err(HandleError::Malformed(InvalidEventError::NotUtf8));
            }
            if record.payload == b"fail" {
                return Err(HandleError::Exhausted {
                    operation: "save",
                    reason: "store down".to_string(),
                });
            }
            self.seen.lock().unwrap().push(record.payload.clone());
            Ok(())
        }
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            poll_timeout: Duration::from_millis(20),
            stats_interval: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 2,
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
            },
        }
    }

    async fn runner(
        log: &MemoryLog,
        handler: Arc<dyn RecordHandler>,
        health: &HealthRegistry,
        shutdown: Shutdown,
    ) -> ConsumerRunner {
        ConsumerRunner::subscribe(
            "test-consumer",
            log,
            ConsumerSpec::new("topic", "group"),
            handler,
            fast_config(),
            health.clone(),
            shutdown,
        )
        .await
        .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_processes_and_commits() {
        let log = MemoryLog::new(1);
        log.send("topic", None, b"a").await.unwrap();
        log.send("topic", None, b"b").await.unwrap();

        let handler = Arc::new(Recording::default());
        let health = HealthRegistry::new();
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(runner(&log, handler.clone(), &health, shutdown).await.run());

        wait_for(|| log.committed("topic", "group") == vec![2]).await;
        trigger.trigger();
        task.await.unwrap().unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        let component = health.get("test-consumer").unwrap();
        assert_eq!(component.processed, 2);
        assert_eq!(component.status, ComponentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_malformed_is_skipped_and_committed() {
        let log = MemoryLog::new(1);
        log.send("topic", None, b"bad").await.unwrap();
        log.send("topic", None, b"good").await.unwrap();

        let handler = Arc::new(Recording::default());
        let health = HealthRegistry::new();
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(runner(&log, handler.clone(), &health, shutdown).await.run());

        wait_for(|| log.committed("topic", "group") == vec![2]).await;
        trigger.trigger();
        task.await.unwrap().unwrap();

        assert_eq!(*handler.seen.lock().unwrap(), vec![b"good".to_vec()]);
        assert_eq!(health.get("test-consumer").unwrap().skipped, 1);
    }

    #[tokio::test]
    async fn test_exhausted_handler_halts_without_commit() {
        let log = MemoryLog::new(1);
        log.send("topic", None, b"ok").await.unwrap();
        log.send("topic", None, b"fail").await.unwrap();
        log.send("topic", None, b"never").await.unwrap();

        let handler = Arc::new(Recording::default());
        let health = HealthRegistry::new();
        let (_trigger, shutdown) = shutdown::channel();

        let result = runner(&log, handler.clone(), &health, shutdown).await.run().await;

        assert!(matches!(result, Err(ConsumerError::Halted { .. })));
        assert_eq!(log.committed("topic", "group"), vec![1]);
        assert_eq!(*handler.seen.lock().unwrap(), vec![b"ok".to_vec()]);
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn test_stops_promptly_when_idle() {
        let log = MemoryLog::new(1);
        let health = HealthRegistry::new();
        let (trigger, shutdown) = shutdown::channel();
        let mut config = fast_config();
        config.poll_timeout = Duration::from_secs(30);

        let runner = ConsumerRunner::subscribe(
            "idle",
            &log,
            ConsumerSpec::new("topic", "group"),
            Arc::new(Recording::default()),
            config,
            health.clone(),
            shutdown,
        )
        .await
        .unwrap();
        let task = tokio::spawn(runner.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("runner should stop during a long poll")
            .unwrap()
            .unwrap();
    }
}
