//! Trend broadcaster - pushes a fresh snapshot after each ingestion cycle
//!
//! Publication is fire-and-forget: the broadcaster never blocks on
//! subscribers and never retries a failed publish.

use super::error::{PublishError, StoreError};
use super::query::{QueryEngine, TrendMap};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Publish hook implemented by the messaging collaborator
pub trait TrendPublisher: Send + Sync {
    fn publish(&self, channel: &str, payload: &TrendMap) -> Result<(), PublishError>;
}

/// One published snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TrendUpdate {
    pub channel: String,
    pub published_at: i64,
    pub trends: TrendMap,
}

/// In-process fan-out over a tokio broadcast channel
///
/// Slow subscribers lag and drop old snapshots rather than blocking the
/// publisher.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<TrendUpdate>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrendUpdate> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TrendPublisher for BroadcastPublisher {
    fn publish(&self, channel: &str, payload: &TrendMap) -> Result<(), PublishError> {
        let update = TrendUpdate {
            channel: channel.to_string(),
            published_at: chrono::Utc::now().timestamp(),
            trends: payload.clone(),
        };

        self.tx
            .send(update)
            .map(|_| ())
            .map_err(|_| PublishError::NoSubscribers(channel.to_string()))
    }
}

/// Broadcaster settings
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub channel: String,
    pub top_n: usize,
    pub hours: u32,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            channel: "/topic/trends".to_string(),
            top_n: 10,
            hours: 24,
        }
    }
}

pub struct TrendBroadcaster {
    query: Arc<QueryEngine>,
    publisher: Arc<dyn TrendPublisher>,
    settings: BroadcastSettings,
}

impl TrendBroadcaster {
    pub fn new(query: Arc<QueryEngine>, publisher: Arc<dyn TrendPublisher>, settings: BroadcastSettings) -> Self {
        Self {
            query,
            publisher,
            settings,
        }
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    /// Compute `hourly_trend(top_tags(N), hours)` and publish it once
    ///
    /// Returns the snapshot that was handed to the publisher. A publish
    /// failure is logged and swallowed; only a store failure while building
    /// the snapshot is returned.
    pub fn broadcast(&self) -> Result<TrendMap, StoreError> {
        let tags = self.query.top_tags(self.settings.top_n)?;
        let snapshot = self.query.hourly_trend(&tags, self.settings.hours)?;

        match self.publisher.publish(&self.settings.channel, &snapshot) {
            Ok(()) => log::info!(
                "📡 Published trends for {} tags to {}",
                snapshot.len(),
                self.settings.channel
            ),
            Err(e) => log::debug!("Trend snapshot not delivered: {}", e),
        }

        Ok(snapshot)
    }
}
