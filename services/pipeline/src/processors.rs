//! Wiring for the three stream processors.

use std::sync::Arc;

use event_log::{ConsumerSpec, EventLog};
use tokio::task::JoinHandle;
use tracing::error;
use types::topics;

use crate::cache::{NicknameCache, RankingCache};
use crate::consumer::{ConsumerError, ConsumerRunner, RecordHandler, RunnerConfig};
use crate::health::HealthRegistry;
use crate::persistence::{self, PersistenceHandler};
use crate::ranking_update::{self, RankingUpdateHandler};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::snapshot_builder::{self, SnapshotBuilder, SnapshotHandler};
use crate::store::ScoreStore;

/// Shared infrastructure handles.
#[derive(Clone)]
pub struct Backends {
    pub log: Arc<dyn EventLog>,
    pub ranking: Arc<dyn RankingCache>,
    pub nicknames: Arc<dyn NicknameCache>,
    pub store: Arc<dyn ScoreStore>,
}

#[derive(Debug, Clone)]
pub struct ConsumerGroups {
    pub persistence: String,
    pub ranking_update: String,
    pub snapshot_builder: String,
}

impl Default for ConsumerGroups {
    fn default() -> Self {
        Self {
            persistence: persistence::COMPONENT.to_string(),
            ranking_update: ranking_update::COMPONENT.to_string(),
            snapshot_builder: snapshot_builder::COMPONENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorSettings {
    pub groups: ConsumerGroups,
    pub runner: RunnerConfig,
    /// Applied to each store, cache and publish call inside a handler
    pub retry: RetryPolicy,
}

pub type ProcessorHandle = JoinHandle<Result<(), ConsumerError>>;

/// Subscribe and spawn persistence, ranking update and snapshot builder.
///
/// All three subscriptions are made before anything is spawned, so a
/// subscribe failure leaves nothing running.
pub async fn spawn_processors(
    backends: &Backends,
    settings: &ProcessorSettings,
    health: &HealthRegistry,
    shutdown: &Shutdown,
) -> Result<Vec<ProcessorHandle>, ConsumerError> {
    let producer = backends.log.producer();
    let builder = Arc::new(SnapshotBuilder::new(
        backends.ranking.clone(),
        backends.nicknames.clone(),
        producer.clone(),
    ));

    let persist: Arc<dyn RecordHandler> =
        Arc::new(PersistenceHandler::new(backends.store.clone(), settings.retry));
    let rank: Arc<dyn RecordHandler> = Arc::new(RankingUpdateHandler::new(
        backends.ranking.clone(),
        producer,
        settings.retry,
    ));
    let snapshot: Arc<dyn RecordHandler> = Arc::new(SnapshotHandler::new(builder, settings.retry));

    let plan = [
        (
            persistence::COMPONENT,
            ConsumerSpec::new(topics::SCORING, &settings.groups.persistence),
            persist,
        ),
        (
            ranking_update::COMPONENT,
            ConsumerSpec::new(topics::SCORING, &settings.groups.ranking_update),
            rank,
        ),
        (
            snapshot_builder::COMPONENT,
            ConsumerSpec::new(topics::RANKING_CHANGED, &settings.groups.snapshot_builder),
            snapshot,
        ),
    ];

    let mut runners = Vec::with_capacity(plan.len());
    for (name, spec, handler) in plan {
        let runner = ConsumerRunner::subscribe(
            name,
            backends.log.as_ref(),
            spec,
            handler,
            settings.runner,
            health.clone(),
            shutdown.clone(),
        )
        .await?;
        runners.push(runner);
    }

    Ok(runners.into_iter().map(spawn_runner).collect())
}

/// Spawn a runner, logging a halt when the task ends.
pub fn spawn_runner(runner: ConsumerRunner) -> ProcessorHandle {
    tokio::spawn(async move {
        let result = runner.run().await;
        if let Err(err) = &result {
            error!(error = %err, "Processor stopped with error");
        }
        result
    })
}
