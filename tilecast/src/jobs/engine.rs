//! The warming worker pool.
//!
//! A fixed set of worker tasks consumes the priority queue and drives warm
//! tiles through the `TileEngine` with a per-job sliding window, so one fat
//! job cannot monopolise the pool and a long warm never starves the serving
//! hot path (the pool is separate from the request tasks entirely).
//!
//! Warm requests that find their tile already in the BlobStore consume no
//! upstream budget; re-running a completed campaign is therefore free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, TileEngine, WarmOutcome};
use crate::keyspace::{KeyError, TileRequest};

use super::kinds;
use super::progress::{Campaign, CampaignProgressUpdater, CampaignStore, ProgressEvent};
use super::queue::{JobQueue, Priority, QueueError, QueuedJob};
use super::record::{JobId, JobKind, JobRecord, JobState};

/// Completions between persisted progress updates.
const PROGRESS_EVERY: u64 = 25;

/// Backoff schedule between tile warm attempts.
const WARM_BACKOFF: Duration = Duration::from_millis(200);

/// Worker pool configuration.
#[derive(Clone, Debug)]
pub struct JobEngineConfig {
    /// Worker tasks per instance.
    pub pool_size: usize,
    /// Queue bound per priority class.
    pub queue_bound: usize,
    /// Tiles in flight per job.
    pub per_job_concurrency: usize,
    /// Attempts per tile before counting it failed.
    pub tile_attempts: u32,
    /// Hard cap on tiles a region warm may enumerate.
    pub region_max_tiles: usize,
    /// Lifetime of persisted job records.
    pub record_ttl: Duration,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            queue_bound: JobQueue::DEFAULT_BOUND,
            per_job_concurrency: 16,
            tile_attempts: 3,
            region_max_tiles: 100_000,
            record_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Submission failures.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    QueueFull(#[from] QueueError),

    #[error("campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("point not found: {0}")]
    PointNotFound(String),
}

/// The queue-backed job engine.
pub struct JobEngine {
    engine: Arc<TileEngine>,
    campaigns: Arc<dyn CampaignStore>,
    config: JobEngineConfig,
    queue: Mutex<JobQueue>,
    notify: Notify,
    events: broadcast::Sender<ProgressEvent>,
    shutdown: CancellationToken,
}

impl JobEngine {
    pub fn new(
        engine: Arc<TileEngine>,
        campaigns: Arc<dyn CampaignStore>,
        config: JobEngineConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            engine,
            campaigns,
            queue: Mutex::new(JobQueue::new(config.queue_bound)),
            config,
            notify: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the worker pool and the campaign progress updater.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.pool_size + 1);
        let updater = CampaignProgressUpdater::new(Arc::clone(&self.campaigns));
        handles.push(tokio::spawn(updater.run(self.events.subscribe())));
        for worker in 0..self.config.pool_size {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(engine.worker_loop(worker)));
        }
        info!(workers = self.config.pool_size, "job engine started");
        handles
    }

    /// Subscribes to the progress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Stops the workers after their current job.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// Validates and enqueues a job, returning its id.
    pub async fn submit(&self, kind: JobKind, priority: Priority) -> Result<JobId, SubmitError> {
        // Referenced externals are validated at submission so the caller
        // gets a 404 now instead of a failed job later.
        match &kind {
            JobKind::WarmCampaign { campaign_id, .. } => {
                if self
                    .campaigns
                    .campaign(campaign_id)
                    .await
                    .ok()
                    .flatten()
                    .is_none()
                {
                    return Err(SubmitError::CampaignNotFound(campaign_id.clone()));
                }
            }
            JobKind::WarmPoint { point_id, .. } if !point_id.is_empty() => {
                if self
                    .campaigns
                    .point(point_id)
                    .await
                    .ok()
                    .flatten()
                    .is_none()
                {
                    return Err(SubmitError::PointNotFound(point_id.clone()));
                }
            }
            _ => {}
        }

        let id = JobId::mint();
        let record = JobRecord::new(id.clone(), kind.clone());
        self.persist(&record).await;

        self.queue
            .lock()
            .push(QueuedJob::new(id.clone(), kind, priority))?;
        self.notify.notify_one();
        debug!(job = %id, "job enqueued");
        Ok(id)
    }

    /// Loads a job record by id.
    pub async fn record(&self, id: &JobId) -> Option<JobRecord> {
        let raw = self
            .engine
            .context()
            .meta
            .get(&id.meta_key())
            .await
            .ok()
            .flatten()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Cancels queued (never running) jobs, optionally for one class only.
    pub async fn purge(&self, priority: Option<Priority>) -> usize {
        let removed = self.queue.lock().drain(priority);
        for id in &removed {
            if let Some(mut record) = self.record(id).await {
                record.finish(JobState::Cancelled, None);
                self.persist(&record).await;
            }
        }
        removed.len()
    }

    /// Queue depth per priority class.
    pub fn queue_depths(&self) -> HashMap<Priority, usize> {
        self.queue.lock().depths()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let job = self.queue.lock().pop();
            match job {
                Some(job) => {
                    debug!(worker, job = %job.id, kind = job.kind.name(), "job picked up");
                    self.execute(job).await;
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
    }

    async fn execute(&self, job: QueuedJob) {
        let mut record = self
            .record(&job.id)
            .await
            .unwrap_or_else(|| JobRecord::new(job.id.clone(), job.kind.clone()));
        record.mark_running();
        self.persist(&record).await;
        self.emit(ProgressEvent::JobStarted {
            job_id: job.id.clone(),
        });

        match job.kind.clone() {
            JobKind::WarmPoint {
                lat,
                lon,
                layers,
                periods,
                years,
                zooms,
                visparams,
                ..
            } => {
                let registry = Arc::clone(&self.engine.context().registry);
                match kinds::point_requests(
                    lat, lon, &layers, &periods, &years, &zooms, &visparams, &registry,
                ) {
                    Ok(requests) => self.run_warm(&mut record, requests).await,
                    Err(e) => record.finish(JobState::Failed, Some(e.to_string())),
                }
            }
            JobKind::WarmRegion {
                bbox,
                layers,
                periods,
                years,
                zooms,
                visparams,
            } => {
                let registry = Arc::clone(&self.engine.context().registry);
                match kinds::region_requests(
                    &bbox,
                    &layers,
                    &periods,
                    &years,
                    &zooms,
                    &visparams,
                    &registry,
                    self.config.region_max_tiles,
                ) {
                    Ok(requests) => self.run_warm(&mut record, requests).await,
                    Err(e) => record.finish(JobState::Failed, Some(e.to_string())),
                }
            }
            JobKind::WarmCampaign {
                campaign_id,
                batch_size,
                force_refresh,
            } => {
                self.run_campaign(&mut record, &campaign_id, batch_size, force_refresh)
                    .await;
            }
            JobKind::Invalidate { layer, year } => {
                record.counters.total = 1;
                match self.engine.invalidate(layer, year).await {
                    Ok(report) => {
                        record.record_progress(1, 0);
                        record.finish(JobState::Success, None);
                        info!(
                            job = %record.id,
                            blobs = report.blobs_removed,
                            meta = report.meta_keys_removed,
                            "invalidation complete"
                        );
                    }
                    Err(e) => record.finish(JobState::Failed, Some(e.to_string())),
                }
            }
        }

        self.persist(&record).await;
        let metrics = &self.engine.context().metrics;
        match record.state {
            JobState::Success => metrics.job_completed(),
            JobState::Failed => metrics.job_failed(),
            _ => {}
        }
        self.emit(ProgressEvent::JobFinished {
            job_id: record.id.clone(),
            state: record.state,
        });
    }

    /// Warms a request list through the engine with a sliding window.
    async fn run_warm(&self, record: &mut JobRecord, requests: Vec<TileRequest>) {
        record.counters.total = requests.len() as u64;
        self.persist(record).await;

        let (done, failed, last_error) = self.warm_window(&record.id, &requests).await;
        record.record_progress(done, failed);

        // Partial failure is tolerated; a mostly-failed run is not.
        if record.counters.total > 0 && failed * 2 > record.counters.total {
            record.finish(
                JobState::Failed,
                last_error.or_else(|| Some("more than half of the tiles failed".to_string())),
            );
        } else {
            record.finish(JobState::Success, None);
        }
    }

    /// Sliding-window warm over a request list. Returns (done, failed, last
    /// error seen).
    async fn warm_window(
        &self,
        job_id: &JobId,
        requests: &[TileRequest],
    ) -> (u64, u64, Option<String>) {
        let total = requests.len() as u64;
        let mut done = 0u64;
        let mut failed = 0u64;
        let mut last_error = None;
        let mut inflight = FuturesUnordered::new();
        let mut next = 0usize;

        while next < requests.len() || !inflight.is_empty() {
            while next < requests.len() && inflight.len() < self.config.per_job_concurrency {
                if self.shutdown.is_cancelled() {
                    break;
                }
                let engine = Arc::clone(&self.engine);
                let request = requests[next].clone();
                let attempts = self.config.tile_attempts;
                inflight.push(async move { warm_one(engine, request, attempts).await });
                next += 1;
            }

            let Some(result) = inflight.next().await else {
                break;
            };
            match result {
                Ok(outcome) => {
                    done += 1;
                    if outcome == WarmOutcome::Fetched {
                        self.engine.context().metrics.tile_warmed();
                    }
                }
                Err(e) => {
                    failed += 1;
                    last_error = Some(e);
                }
            }

            if (done + failed) % PROGRESS_EVERY == 0 || done + failed == total {
                self.emit(ProgressEvent::JobProgress {
                    job_id: job_id.clone(),
                    done,
                    failed,
                    total,
                });
            }
        }
        (done, failed, last_error)
    }

    /// Processes a campaign: skip cached points, warm the rest in batches,
    /// and narrate progress over the event channel.
    async fn run_campaign(
        &self,
        record: &mut JobRecord,
        campaign_id: &str,
        batch_size: usize,
        force_refresh: bool,
    ) {
        let campaign = match self.campaigns.campaign(campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => {
                record.finish(
                    JobState::Failed,
                    Some(format!("campaign not found: {campaign_id}")),
                );
                return;
            }
            Err(e) => {
                record.finish(JobState::Failed, Some(e.to_string()));
                return;
            }
        };

        let pending: Vec<_> = campaign
            .points
            .iter()
            .filter(|p| force_refresh || !p.cached)
            .cloned()
            .collect();
        let pre_cached = (campaign.points.len() - pending.len()) as u64;

        record.counters.total = pending.len() as u64;
        self.persist(record).await;
        self.emit(ProgressEvent::CampaignStarted {
            campaign_id: campaign_id.to_string(),
            total_points: campaign.points.len() as u64,
            cached_points: pre_cached,
        });

        let mut done = 0u64;
        let mut failed = 0u64;
        let mut last_error: Option<String> = None;
        let batch_size = batch_size.max(1);

        for batch in pending.chunks(batch_size) {
            if self.shutdown.is_cancelled() {
                break;
            }
            for point in batch {
                match self.warm_point_of(&campaign, point.lat, point.lon).await {
                    Ok(()) => {
                        done += 1;
                        self.emit(ProgressEvent::PointCached {
                            campaign_id: campaign_id.to_string(),
                            point_id: point.id.clone(),
                        });
                    }
                    Err(e) => {
                        failed += 1;
                        last_error = Some(e);
                    }
                }
                record.record_progress(done, failed);
            }
            self.persist(record).await;
        }

        let campaign_error = if failed * 2 > record.counters.total.max(1) {
            last_error.clone()
        } else {
            None
        };
        self.emit(ProgressEvent::CampaignFinished {
            campaign_id: campaign_id.to_string(),
            error: campaign_error.clone(),
        });

        match campaign_error {
            Some(error) => record.finish(JobState::Failed, Some(error)),
            None => record.finish(JobState::Success, None),
        }
    }

    /// Warms every tile of one campaign point. The point counts as cached
    /// only when every tile landed.
    async fn warm_point_of(
        &self,
        campaign: &Campaign,
        lat: f64,
        lon: f64,
    ) -> Result<(), String> {
        let registry = Arc::clone(&self.engine.context().registry);
        let requests = kinds::point_requests(
            lat,
            lon,
            &campaign.layers,
            &campaign.periods,
            &campaign.years,
            &campaign.zooms,
            &campaign.visparams,
            &registry,
        )
        .map_err(|e| e.to_string())?;

        let (_, failed, last_error) = self
            .warm_window(&JobId::from_string(format!("point@{}", campaign.id)), &requests)
            .await;
        if failed > 0 {
            Err(last_error.unwrap_or_else(|| "point warm failed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn persist(&self, record: &JobRecord) {
        let payload = match serde_json::to_vec(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job = %record.id, error = %e, "job record serialisation failed");
                return;
            }
        };
        if let Err(e) = self
            .engine
            .context()
            .meta
            .set(&record.id.meta_key(), payload, self.config.record_ttl)
            .await
        {
            self.engine.context().metrics.degraded_meta_op();
            warn!(job = %record.id, error = %e, "job record persistence failed");
        }
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

/// One tile warm with bounded retries. Validation errors fail immediately;
/// anything else retries with spaced attempts.
async fn warm_one(
    engine: Arc<TileEngine>,
    request: TileRequest,
    attempts: u32,
) -> Result<WarmOutcome, String> {
    let mut last = String::new();
    for attempt in 0..attempts.max(1) {
        match engine.warm(&request).await {
            Ok(outcome) => return Ok(outcome),
            Err(EngineError::Key(e)) => return Err(key_error_message(e)),
            Err(e) => {
                last = e.to_string();
                if attempt + 1 < attempts {
                    tokio::time::sleep(WARM_BACKOFF * (attempt + 1)).await;
                }
            }
        }
    }
    Err(last)
}

fn key_error_message(e: KeyError) -> String {
    format!("invalid warm request: {e}")
}
