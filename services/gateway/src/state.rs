use std::sync::Arc;

use pipeline::{HealthRegistry, ScoreIngestion, Shutdown};

use crate::broadcast::LatestSnapshot;
use crate::config::Config;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub latest: LatestSnapshot,
    pub ingestion: Arc<ScoreIngestion>,
    pub health: HealthRegistry,
    /// Lets connection tasks end when the process is stopping
    pub shutdown: Shutdown,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        ingestion: Arc<ScoreIngestion>,
        health: HealthRegistry,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.connection_buffer),
            latest: LatestSnapshot::new(),
            config,
            ingestion,
            health,
            shutdown,
        }
    }
}
