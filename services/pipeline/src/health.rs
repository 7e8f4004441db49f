//! Per-component liveness shared between the processors and `/health`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ComponentStatus {
    Starting,
    Running,
    /// Stopped after exhausting retries; needs an operator.
    Halted { reason: String },
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    pub processed: u64,
    pub skipped: u64,
    /// Total backlog at the last statistics tick
    pub lag: u64,
    pub updated_at_ms: i64,
}

impl ComponentHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ComponentStatus::Starting,
            processed: 0,
            skipped: 0,
            lag: 0,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<DashMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        self.components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::new(name));
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut ComponentHealth)) {
        let mut entry = self
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::new(name));
        f(&mut entry);
        entry.updated_at_ms = chrono::Utc::now().timestamp_millis();
    }

    pub fn set_status(&self, name: &str, status: ComponentStatus) {
        self.update(name, |c| c.status = status);
    }

    pub fn record_processed(&self, name: &str) {
        self.update(name, |c| c.processed += 1);
    }

    pub fn record_skipped(&self, name: &str) {
        self.update(name, |c| c.skipped += 1);
    }

    pub fn record_lag(&self, name: &str, lag: u64) {
        self.update(name, |c| c.lag = lag);
    }

    pub fn get(&self, name: &str) -> Option<ComponentHealth> {
        self.components.get(name).map(|c| c.clone())
    }

    /// All components, sorted by name.
    pub fn snapshot(&self) -> Vec<ComponentHealth> {
        let mut all: Vec<ComponentHealth> =
            self.components.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// False when any component has halted.
    pub fn is_healthy(&self) -> bool {
        !self
            .components
            .iter()
            .any(|c| matches!(c.status, ComponentStatus::Halted { .. }))
    }
}
