//! Job identities, payloads and persisted records.
//!
//! A `JobRecord` is the durable face of a job: persisted to the MetaStore
//! under `job:<id>` so any instance can answer a status query. State
//! transitions form a DAG; completed jobs are terminal.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coord::BoundingBox;
use crate::keyspace::{Layer, Period};

/// Monotonic component of job ids within one process.
static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique job identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Mints a fresh id: timestamp plus per-process sequence.
    pub fn mint() -> Self {
        let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("job-{}-{}", Utc::now().timestamp_millis(), seq))
    }

    /// Wraps an existing id string (status lookups).
    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// MetaStore key for the persisted record.
    pub fn meta_key(&self) -> String {
        format!("job:{}", self.0)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a job does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobKind {
    /// Warm the tiles containing one geographic point.
    WarmPoint {
        point_id: String,
        lat: f64,
        lon: f64,
        layers: Vec<Layer>,
        periods: Vec<Period>,
        years: Vec<i32>,
        zooms: Vec<u8>,
        visparams: Vec<String>,
    },
    /// Warm every point of an external campaign, batch by batch.
    WarmCampaign {
        campaign_id: String,
        batch_size: usize,
        force_refresh: bool,
    },
    /// Warm every tile of a bounding box at the given zooms.
    WarmRegion {
        bbox: BoundingBox,
        layers: Vec<Layer>,
        periods: Vec<Period>,
        years: Vec<i32>,
        zooms: Vec<u8>,
        visparams: Vec<String>,
    },
    /// Drop cached tiles and mosaic handles under a layer/year scope.
    Invalidate {
        layer: Option<Layer>,
        year: Option<i32>,
    },
}

impl JobKind {
    /// Short name for logs and queue introspection.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::WarmPoint { .. } => "warm-point",
            JobKind::WarmCampaign { .. } => "warm-campaign",
            JobKind::WarmRegion { .. } => "warm-region",
            JobKind::Invalidate { .. } => "invalidate",
        }
    }
}

/// Job lifecycle states. `Pending → Running → {Success, Failed, Cancelled}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Cancelled)
    }
}

/// Work counters for a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: u64,
    pub done: u64,
    pub failed: u64,
}

/// The persisted job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    pub counters: JobCounters,
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn new(id: JobId, kind: JobKind) -> Self {
        Self {
            id,
            kind,
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: 0.0,
            counters: JobCounters::default(),
            last_error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Moves to a terminal state and stamps the finish time.
    pub fn finish(&mut self, state: JobState, error: Option<String>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.finished_at = Some(Utc::now());
        self.last_error = error;
        if state == JobState::Success {
            self.progress = 1.0;
        }
    }

    /// Updates counters and the derived progress fraction.
    pub fn record_progress(&mut self, done: u64, failed: u64) {
        self.counters.done = done;
        self.counters.failed = failed;
        if self.counters.total > 0 {
            self.progress = (done + failed) as f64 / self.counters.total as f64;
        }
    }
}
