//! Progress events and the external campaign store boundary.
//!
//! The job engine never writes to external systems directly: it emits typed
//! events on a broadcast channel, and the `CampaignProgressUpdater` consumes
//! them to keep the externally-owned campaign records current. The control
//! plane subscribes to the same channel for live introspection. Dataflow
//! stays a DAG: jobs feed the channel, the channel feeds the updaters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::meta::BoxFuture;

use super::record::{JobId, JobState};

/// Events emitted by running jobs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProgressEvent {
    JobStarted {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        done: u64,
        failed: u64,
        total: u64,
    },
    JobFinished {
        job_id: JobId,
        state: JobState,
    },
    CampaignStarted {
        campaign_id: String,
        total_points: u64,
        /// Points already cached before this run.
        cached_points: u64,
    },
    PointCached {
        campaign_id: String,
        point_id: String,
    },
    CampaignFinished {
        campaign_id: String,
        error: Option<String>,
    },
}

/// A campaign's geographic point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CampaignPoint {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub cached: bool,
}

/// An externally-owned campaign: a set of points plus the parameter space to
/// warm for each of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub points: Vec<CampaignPoint>,
    pub layers: Vec<crate::keyspace::Layer>,
    pub periods: Vec<crate::keyspace::Period>,
    pub years: Vec<i32>,
    pub zooms: Vec<u8>,
    pub visparams: Vec<String>,
}

/// Progress fields the core maintains on a campaign record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub cached_points: u64,
    pub total_points: u64,
    pub cache_percentage: f64,
    pub last_point_cached_at: Option<DateTime<Utc>>,
    pub caching_in_progress: bool,
    pub caching_completed_at: Option<DateTime<Utc>>,
    pub caching_error: Option<String>,
}

/// Campaign store failures.
#[derive(Debug, Error)]
pub enum CampaignStoreError {
    #[error("campaign store unavailable: {0}")]
    Unavailable(String),

    #[error("campaign not found: {0}")]
    NotFound(String),
}

/// Read/write boundary to the externally-managed campaign collection.
///
/// The core reads campaigns and points and writes only the progress fields.
pub trait CampaignStore: Send + Sync {
    /// Loads a campaign with its points.
    fn campaign(&self, id: &str)
        -> BoxFuture<'_, Result<Option<Campaign>, CampaignStoreError>>;

    /// Looks up a point across campaigns.
    fn point(&self, id: &str) -> BoxFuture<'_, Result<Option<CampaignPoint>, CampaignStoreError>>;

    /// Finds the campaign owning a point, for deriving its warm parameters.
    fn campaign_for_point(
        &self,
        point_id: &str,
    ) -> BoxFuture<'_, Result<Option<Campaign>, CampaignStoreError>>;

    /// Flags a point as cached.
    fn mark_point_cached(
        &self,
        campaign_id: &str,
        point_id: &str,
    ) -> BoxFuture<'_, Result<(), CampaignStoreError>>;

    /// Replaces the campaign's progress fields.
    fn update_progress(
        &self,
        campaign_id: &str,
        progress: CampaignProgress,
    ) -> BoxFuture<'_, Result<(), CampaignStoreError>>;

    /// Reads the campaign's progress fields.
    fn progress(
        &self,
        campaign_id: &str,
    ) -> BoxFuture<'_, Result<Option<CampaignProgress>, CampaignStoreError>>;
}

/// In-memory campaign store for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryCampaignStore {
    campaigns: RwLock<HashMap<String, Campaign>>,
    progress: RwLock<HashMap<String, CampaignProgress>>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a campaign.
    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns
            .write()
            .insert(campaign.id.clone(), campaign);
    }
}

impl CampaignStore for InMemoryCampaignStore {
    fn campaign(
        &self,
        id: &str,
    ) -> BoxFuture<'_, Result<Option<Campaign>, CampaignStoreError>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.campaigns.read().get(&id).cloned()) })
    }

    fn point(&self, id: &str) -> BoxFuture<'_, Result<Option<CampaignPoint>, CampaignStoreError>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .campaigns
                .read()
                .values()
                .flat_map(|c| c.points.iter())
                .find(|p| p.id == id)
                .cloned())
        })
    }

    fn campaign_for_point(
        &self,
        point_id: &str,
    ) -> BoxFuture<'_, Result<Option<Campaign>, CampaignStoreError>> {
        let point_id = point_id.to_string();
        Box::pin(async move {
            Ok(self
                .campaigns
                .read()
                .values()
                .find(|c| c.points.iter().any(|p| p.id == point_id))
                .cloned())
        })
    }

    fn mark_point_cached(
        &self,
        campaign_id: &str,
        point_id: &str,
    ) -> BoxFuture<'_, Result<(), CampaignStoreError>> {
        let campaign_id = campaign_id.to_string();
        let point_id = point_id.to_string();
        Box::pin(async move {
            let mut campaigns = self.campaigns.write();
            let campaign = campaigns
                .get_mut(&campaign_id)
                .ok_or_else(|| CampaignStoreError::NotFound(campaign_id.clone()))?;
            if let Some(point) = campaign.points.iter_mut().find(|p| p.id == point_id) {
                point.cached = true;
            }
            Ok(())
        })
    }

    fn update_progress(
        &self,
        campaign_id: &str,
        progress: CampaignProgress,
    ) -> BoxFuture<'_, Result<(), CampaignStoreError>> {
        let campaign_id = campaign_id.to_string();
        Box::pin(async move {
            self.progress.write().insert(campaign_id, progress);
            Ok(())
        })
    }

    fn progress(
        &self,
        campaign_id: &str,
    ) -> BoxFuture<'_, Result<Option<CampaignProgress>, CampaignStoreError>> {
        let campaign_id = campaign_id.to_string();
        Box::pin(async move { Ok(self.progress.read().get(&campaign_id).cloned()) })
    }
}

/// Consumes progress events and mirrors them into the campaign store.
///
/// Runs as its own task so store latency never touches the job workers.
pub struct CampaignProgressUpdater {
    store: Arc<dyn CampaignStore>,
    /// Live counters per campaign while a warm run is in flight.
    tallies: HashMap<String, (u64, u64)>,
}

impl CampaignProgressUpdater {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self {
            store,
            tallies: HashMap::new(),
        }
    }

    /// Drains the channel until every sender is gone.
    pub async fn run(mut self, mut events: broadcast::Receiver<ProgressEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "campaign progress updater lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::CampaignStarted {
                campaign_id,
                total_points,
                cached_points,
            } => {
                let cached = cached_points;
                self.tallies
                    .insert(campaign_id.clone(), (cached, total_points));
                let update = CampaignProgress {
                    cached_points: cached,
                    total_points,
                    cache_percentage: percentage(cached, total_points),
                    last_point_cached_at: None,
                    caching_in_progress: true,
                    caching_completed_at: None,
                    caching_error: None,
                };
                self.write(&campaign_id, update).await;
            }
            ProgressEvent::PointCached {
                campaign_id,
                point_id,
            } => {
                if let Err(e) = self.store.mark_point_cached(&campaign_id, &point_id).await {
                    warn!(campaign = %campaign_id, point = %point_id, error = %e,
                          "failed to flag cached point");
                }
                let (cached, total) = {
                    let tally = self.tallies.entry(campaign_id.clone()).or_insert((0, 0));
                    tally.0 += 1;
                    *tally
                };
                let update = CampaignProgress {
                    cached_points: cached,
                    total_points: total,
                    cache_percentage: percentage(cached, total),
                    last_point_cached_at: Some(Utc::now()),
                    caching_in_progress: true,
                    caching_completed_at: None,
                    caching_error: None,
                };
                self.write(&campaign_id, update).await;
            }
            ProgressEvent::CampaignFinished { campaign_id, error } => {
                let (cached, total) = self
                    .tallies
                    .remove(&campaign_id)
                    .unwrap_or((0, 0));
                let update = CampaignProgress {
                    cached_points: cached,
                    total_points: total,
                    cache_percentage: percentage(cached, total),
                    last_point_cached_at: None,
                    caching_in_progress: false,
                    caching_completed_at: Some(Utc::now()),
                    caching_error: error,
                };
                // Preserve the last cached-at stamp across the final write.
                let previous = self.store.progress(&campaign_id).await.ok().flatten();
                let update = CampaignProgress {
                    last_point_cached_at: previous.and_then(|p| p.last_point_cached_at),
                    ..update
                };
                self.write(&campaign_id, update).await;
            }
            ProgressEvent::JobStarted { .. }
            | ProgressEvent::JobProgress { .. }
            | ProgressEvent::JobFinished { .. } => {}
        }
    }

    async fn write(&self, campaign_id: &str, progress: CampaignProgress) {
        if let Err(e) = self.store.update_progress(campaign_id, progress).await {
            warn!(campaign = %campaign_id, error = %e, "failed to update campaign progress");
        }
    }
}

fn percentage(cached: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        cached as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{Layer, Period};

    fn campaign(points: usize) -> Campaign {
        Campaign {
            id: "camp1".to_string(),
            points: (0..points)
                .map(|i| CampaignPoint {
                    id: format!("p{i}"),
                    lat: -15.0 - i as f64 * 0.1,
                    lon: -47.0,
                    cached: false,
                })
                .collect(),
            layers: vec![Layer::S2Harmonized],
            periods: vec![Period::Wet],
            years: vec![2023],
            zooms: vec![12],
            visparams: vec!["tvi-red".to_string()],
        }
    }

    #[tokio::test]
    async fn test_updater_tracks_campaign_lifecycle() {
        let store = Arc::new(InMemoryCampaignStore::new());
        store.insert_campaign(campaign(3));

        let (tx, rx) = broadcast::channel(64);
        let updater = CampaignProgressUpdater::new(Arc::clone(&store) as Arc<dyn CampaignStore>);
        let task = tokio::spawn(updater.run(rx));

        tx.send(ProgressEvent::CampaignStarted {
            campaign_id: "camp1".to_string(),
            total_points: 3,
            cached_points: 0,
        })
        .unwrap();
        for i in 0..3 {
            tx.send(ProgressEvent::PointCached {
                campaign_id: "camp1".to_string(),
                point_id: format!("p{i}"),
            })
            .unwrap();
        }
        tx.send(ProgressEvent::CampaignFinished {
            campaign_id: "camp1".to_string(),
            error: None,
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let progress = store.progress("camp1").await.unwrap().unwrap();
        assert_eq!(progress.cached_points, 3);
        assert_eq!(progress.total_points, 3);
        assert!((progress.cache_percentage - 100.0).abs() < f64::EPSILON);
        assert!(!progress.caching_in_progress);
        assert!(progress.caching_completed_at.is_some());
        assert!(progress.caching_error.is_none());

        // Every point is flagged.
        let stored = store.campaign("camp1").await.unwrap().unwrap();
        assert!(stored.points.iter().all(|p| p.cached));
    }

    #[tokio::test]
    async fn test_updater_records_error() {
        let store = Arc::new(InMemoryCampaignStore::new());
        store.insert_campaign(campaign(2));

        let (tx, rx) = broadcast::channel(16);
        let updater = CampaignProgressUpdater::new(Arc::clone(&store) as Arc<dyn CampaignStore>);
        let task = tokio::spawn(updater.run(rx));

        tx.send(ProgressEvent::CampaignStarted {
            campaign_id: "camp1".to_string(),
            total_points: 2,
            cached_points: 0,
        })
        .unwrap();
        tx.send(ProgressEvent::CampaignFinished {
            campaign_id: "camp1".to_string(),
            error: Some("upstream quota".to_string()),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let progress = store.progress("camp1").await.unwrap().unwrap();
        assert_eq!(progress.caching_error.as_deref(), Some("upstream quota"));
        assert!(!progress.caching_in_progress);
    }

    #[tokio::test]
    async fn test_in_memory_store_point_lookup() {
        let store = InMemoryCampaignStore::new();
        store.insert_campaign(campaign(2));
        assert!(store.point("p1").await.unwrap().is_some());
        assert!(store.point("p9").await.unwrap().is_none());
    }
}
