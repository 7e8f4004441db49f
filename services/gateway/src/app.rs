//! Process assembly: backends, processors, broadcaster and generator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use event_log::{ConsumerSpec, MemoryLog, RedisStreamConfig, RedisStreamLog};
use pipeline::{
    Backends, ConsumerError, ConsumerRunner, HealthRegistry, LoadGenerator, MemoryNicknameCache,
    MemoryRankingCache, MemoryScoreStore, PgScoreStore, RedisNicknameCache, RedisRankingCache,
    ScoreIngestion, ShutdownTrigger, spawn_processors, spawn_runner,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use types::topics;

use crate::broadcast::{self, LeaderboardBroadcaster};
use crate::config::{Backend, Config};
use crate::state::AppState;

const STREAM_BATCH: usize = 100;

/// Build the log, caches and store selected by `config.backend`.
pub async fn build_backends(config: &Config) -> anyhow::Result<Backends> {
    match config.backend {
        Backend::Memory => {
            info!(partitions = config.partitions, "Using in-memory backends");
            Ok(Backends {
                log: Arc::new(MemoryLog::new(config.partitions)),
                ranking: Arc::new(MemoryRankingCache::new()),
                nicknames: Arc::new(MemoryNicknameCache::new()),
                store: Arc::new(MemoryScoreStore::new()),
            })
        }
        Backend::External => {
            let client = redis::Client::open(config.redis_url.as_str())
                .context("invalid redis url")?;
            let log = RedisStreamLog::connect(
                client.clone(),
                RedisStreamConfig {
                    prefix: config.stream_prefix.clone(),
                    partitions: config.partitions,
                    op_timeout: config.op_timeout(),
                    batch_size: STREAM_BATCH,
                },
            )
            .await
            .context("connecting event log")?;

            let conn = client
                .get_multiplexed_async_connection()
                .await
                .context("connecting redis caches")?;
            let store = PgScoreStore::connect(
                &config.database_url,
                config.database_max_connections,
                config.op_timeout(),
            )
            .await
            .context("connecting score store")?;

            info!(partitions = config.partitions, "Using redis and postgres backends");
            Ok(Backends {
                log: Arc::new(log),
                ranking: Arc::new(RedisRankingCache::new(
                    conn.clone(),
                    config.ranking_key.clone(),
                    config.op_timeout(),
                )),
                nicknames: Arc::new(RedisNicknameCache::new(
                    conn,
                    config.nickname_prefix.clone(),
                    config.op_timeout(),
                )),
                store: Arc::new(store),
            })
        }
    }
}

/// Everything started by [`App::start`].
pub struct App {
    pub state: AppState,
    trigger: Arc<ShutdownTrigger>,
    runners: Vec<JoinHandle<Result<(), ConsumerError>>>,
    generator: Option<JoinHandle<()>>,
}

impl App {
    /// Start the processors, the broadcaster and, if enabled, the generator.
    pub async fn start(config: Config, backends: Backends, generator: bool) -> anyhow::Result<Self> {
        let (trigger, shutdown) = pipeline::shutdown::channel();
        let health = HealthRegistry::new();
        let ingestion = Arc::new(ScoreIngestion::new(backends.log.producer()));
        let config = Arc::new(config);
        let state = AppState::new(config.clone(), ingestion.clone(), health.clone(), shutdown.clone());

        let mut runners =
            spawn_processors(&backends, &config.processor_settings(), &health, &shutdown).await?;

        let broadcaster = ConsumerRunner::subscribe(
            broadcast::COMPONENT,
            backends.log.as_ref(),
            ConsumerSpec::new(topics::LEADERBOARD, &config.broadcast_group),
            Arc::new(LeaderboardBroadcaster::new(
                state.registry.clone(),
                state.latest.clone(),
            )),
            config.runner_config(),
            health,
            shutdown.clone(),
        )
        .await?;
        runners.push(spawn_runner(broadcaster));

        let generator = match config.generator() {
            Some(settings) if generator => {
                info!(
                    batch = settings.batch_size,
                    interval_ms = settings.interval.as_millis() as u64,
                    "Starting load generator"
                );
                let generator = LoadGenerator::new(ingestion, settings);
                Some(tokio::spawn(generator.run(shutdown)))
            }
            _ => None,
        };

        Ok(Self {
            state,
            trigger: Arc::new(trigger),
            runners,
            generator,
        })
    }

    /// Handle that stops every task started by this app.
    pub fn trigger(&self) -> Arc<ShutdownTrigger> {
        self.trigger.clone()
    }

    /// Signal shutdown and wait up to `grace` for the tasks to finish.
    pub async fn stop(self, grace: Duration) {
        self.trigger.trigger();

        let wait = async {
            for handle in self.runners {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {} // already logged by the runner task
                    Err(err) => warn!(error = %err, "Processor task panicked"),
                }
            }
            if let Some(generator) = self.generator {
                let _ = generator.await;
            }
        };

        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Tasks still running after shutdown grace period");
        } else {
            info!("Pipeline stopped");
        }
    }
}
