//! Leaderboard fan-out
//!
//! Consumes the `leaderboard` topic, keeps the latest snapshot for the pull
//! endpoint and new viewers, and pushes each snapshot verbatim to every
//! open connection.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Utf8Bytes;
use event_log::Record;
use pipeline::{HandleError, RecordHandler, Shutdown};
use tokio::sync::watch;
use tracing::debug;
use types::errors::InvalidEventError;
use types::leaderboard::LeaderboardSnapshot;

use crate::registry::ConnectionRegistry;

pub const COMPONENT: &str = "broadcast";

/// A snapshot together with the exact text it arrived as.
#[derive(Debug, Clone)]
pub struct PublishedSnapshot {
    pub snapshot: Arc<LeaderboardSnapshot>,
    pub payload: Utf8Bytes,
}

/// Latest leaderboard, shared by the broadcaster and the HTTP handlers.
#[derive(Debug, Clone)]
pub struct LatestSnapshot {
    tx: Arc<watch::Sender<Option<PublishedSnapshot>>>,
}

impl Default for LatestSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestSnapshot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn store(&self, published: PublishedSnapshot) {
        self.tx.send_replace(Some(published));
    }

    pub fn current(&self) -> Option<PublishedSnapshot> {
        self.tx.borrow().clone()
    }

    /// The latest snapshot, or the empty placeholder before the first one.
    pub fn snapshot(&self) -> Arc<LeaderboardSnapshot> {
        self.current()
            .map(|p| p.snapshot)
            .unwrap_or_else(|| Arc::new(LeaderboardSnapshot::empty()))
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PublishedSnapshot>> {
        self.tx.subscribe()
    }
}

pub struct LeaderboardBroadcaster {
    registry: ConnectionRegistry,
    latest: LatestSnapshot,
}

impl LeaderboardBroadcaster {
    pub fn new(registry: ConnectionRegistry, latest: LatestSnapshot) -> Self {
        Self { registry, latest }
    }
}

#[async_trait]
impl RecordHandler for LeaderboardBroadcaster {
    async fn handle(&self, record: &Record, _shutdown: &Shutdown) -> Result<(), HandleError> {
        let snapshot = LeaderboardSnapshot::from_slice(&record.payload)?;
        let text = String::from_utf8(record.payload.clone()).map_err(|_| InvalidEventError::NotUtf8)?;
        let payload = Utf8Bytes::from(text);

        self.latest.store(PublishedSnapshot {
            snapshot: Arc::new(snapshot),
            payload: payload.clone(),
        });

        let report = self.registry.broadcast(payload);
        debug!(
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Leaderboard broadcast"
        );
        Ok(())
    }
}
