//! Bounded priority queue for job scheduling.
//!
//! Jobs are ordered by priority class (higher first), then by enqueue order
//! (FIFO within a class). Each class carries its own bound; hitting it makes
//! `push` fail with `QueueFull` so submitters see back-pressure instead of
//! unbounded growth.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::{JobId, JobKind};

/// Sequence counter for FIFO ordering within a priority class.
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Scheduling priority classes, highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Maintenance,
    Low,
    Standard,
    High,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::High,
        Priority::Standard,
        Priority::Low,
        Priority::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Standard => "standard",
            Priority::Low => "low",
            Priority::Maintenance => "maintenance",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "standard" => Ok(Priority::Standard),
            "low" => Ok(Priority::Low),
            "maintenance" => Ok(Priority::Maintenance),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Queue admission failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue for priority {priority:?} is full ({bound} jobs)")]
    QueueFull { priority: Priority, bound: usize },
}

/// A job waiting to run.
#[derive(Debug)]
pub struct QueuedJob {
    pub id: JobId,
    pub kind: JobKind,
    pub priority: Priority,
    sequence: u64,
    pub enqueued_at: Instant,
}

impl QueuedJob {
    pub fn new(id: JobId, kind: JobKind, priority: Priority) -> Self {
        Self {
            id,
            kind,
            priority,
            sequence: next_sequence(),
            enqueued_at: Instant::now(),
        }
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then older sequence first.
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Priority queue with per-class bounds.
#[derive(Debug)]
pub struct JobQueue {
    heap: BinaryHeap<QueuedJob>,
    bound_per_class: usize,
}

impl JobQueue {
    /// Default bound per priority class.
    pub const DEFAULT_BOUND: usize = 1_000;

    pub fn new(bound_per_class: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            bound_per_class,
        }
    }

    /// Enqueues a job, or reports back-pressure for its class.
    pub fn push(&mut self, job: QueuedJob) -> Result<(), QueueError> {
        let in_class = self
            .heap
            .iter()
            .filter(|j| j.priority == job.priority)
            .count();
        if in_class >= self.bound_per_class {
            return Err(QueueError::QueueFull {
                priority: job.priority,
                bound: self.bound_per_class,
            });
        }
        self.heap.push(job);
        Ok(())
    }

    /// Removes and returns the highest-priority job.
    pub fn pop(&mut self) -> Option<QueuedJob> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops every queued job, optionally only one class. Returns the ids
    /// removed so their records can be marked cancelled.
    pub fn drain(&mut self, priority: Option<Priority>) -> Vec<JobId> {
        let (drop_list, keep): (Vec<_>, Vec<_>) = self
            .heap
            .drain()
            .partition(|j| priority.is_none_or(|p| j.priority == p));
        self.heap = BinaryHeap::from(keep);
        drop_list.into_iter().map(|j| j.id).collect()
    }

    /// Queue depth per priority class.
    pub fn depths(&self) -> HashMap<Priority, usize> {
        let mut counts = HashMap::new();
        for job in self.heap.iter() {
            *counts.entry(job.priority).or_insert(0) += 1;
        }
        counts
    }
}
