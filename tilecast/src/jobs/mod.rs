//! Asynchronous cache warming and maintenance.
//!
//! The job engine drives the same tile pipeline the HTTP hot path uses, off
//! line and at warm priority: point warms around campaign locations, region
//! warms over bounding boxes, and scoped invalidations. Work flows through a
//! bounded priority queue into a fixed worker pool; progress flows out over
//! a typed event channel that the control plane and the campaign progress
//! updater consume.
//!
//! # Job kinds
//!
//! - `warm-point` - tiles containing one location across a parameter space
//! - `warm-campaign` - every pending point of an external campaign
//! - `warm-region` - full tile coverage of a bounding box
//! - `invalidate` - scoped cache clear, as a job so it is introspectable

mod engine;
mod kinds;
mod progress;
mod queue;
mod record;

pub use engine::{JobEngine, JobEngineConfig, SubmitError};
pub use kinds::{point_requests, region_requests, POINT_ZOOMS};
pub use progress::{
    Campaign, CampaignPoint, CampaignProgress, CampaignProgressUpdater, CampaignStore,
    CampaignStoreError, InMemoryCampaignStore, ProgressEvent,
};
pub use queue::{JobQueue, Priority, QueueError, QueuedJob};
pub use record::{JobCounters, JobId, JobKind, JobRecord, JobState};
