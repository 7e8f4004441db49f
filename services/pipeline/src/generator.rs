//! Synthetic load generator: a batch of random score events per tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ingestion::ScoreIngestion;
use crate::shutdown::Shutdown;

/// Shortest tick period; `interval` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub batch_size: usize,
    pub interval: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct LoadGenerator {
    ingestion: Arc<ScoreIngestion>,
    config: GeneratorConfig,
}

impl LoadGenerator {
    pub fn new(ingestion: Arc<ScoreIngestion>, config: GeneratorConfig) -> Self {
        Self { ingestion, config }
    }

    /// Publish one batch; returns how many events were appended.
    pub async fn tick(&self, shutdown: &Shutdown) -> usize {
        let mut published = 0;
        let mut failed = 0;

        for _ in 0..self.config.batch_size {
            if shutdown.is_triggered() {
                break;
            }
            match self.ingestion.submit(None).await {
                Ok(_) => published += 1,
                Err(err) => {
                    failed += 1;
                    debug!(error = %err, "Synthetic event not published");
                }
            }
        }

        if failed > 0 {
            warn!(published, failed, "Synthetic batch partially failed");
        } else {
            debug!(published, "Synthetic batch published");
        }
        published
    }

    pub async fn run(self, shutdown: Shutdown) {
        info!(
            batch_size = self.config.batch_size,
            interval_ms = self.config.interval.as_millis() as u64,
            "Load generator started"
        );

        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }
            self.tick(&shutdown).await;
        }

        info!("Load generator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use event_log::MemoryLog;
    use types::topics;

    #[tokio::test]
    async fn test_tick_publishes_full_batch() {
        let log = MemoryLog::new(2);
        let generator = LoadGenerator::new(
            Arc::new(ScoreIngestion::new(Arc::new(log.clone()))),
            GeneratorConfig {
                batch_size: 25,
                interval: Duration::from_millis(10),
            },
        );
        let (_trigger, shutdown) = shutdown::channel();

        assert_eq!(generator.tick(&shutdown).await, 25);
        assert_eq!(log.len(topics::SCORING), 25);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let log = MemoryLog::new(1);
        let generator = LoadGenerator::new(
            Arc::new(ScoreIngestion::new(Arc::new(log.clone()))),
            GeneratorConfig {
                batch_size: 3,
                interval: Duration::from_millis(5),
            },
        );
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(generator.run(shutdown));

        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("generator should stop")
            .unwrap();

        assert!(log.len(topics::SCORING) >= 3);
    }

    #[tokio::test]
    async fn test_zero_interval_runs_at_floor() {
        let log = MemoryLog::new(1);
        let generator = LoadGenerator::new(
            Arc::new(ScoreIngestion::new(Arc::new(log.clone()))),
            GeneratorConfig {
                batch_size: 2,
                interval: Duration::ZERO,
            },
        );
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(generator.run(shutdown));

        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("generator should stop")
            .unwrap();

        assert!(log.len(topics::SCORING) >= 2);
    }
}
