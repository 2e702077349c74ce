//! In-memory upstream for tests and local development.
//!
//! Deterministic: the template embeds the mosaic key and tile bytes derive
//! from the fetched URL, so identical requests always produce identical
//! bytes. Call counters let tests assert the single-flight invariants.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::keyspace::MosaicKey;

use super::{BoxFuture, UpstreamClient, UpstreamError};

/// Scripted fake of the Earth-imagery backend.
#[derive(Debug, Default)]
pub struct FakeUpstream {
    build_calls: AtomicU64,
    fetch_calls: AtomicU64,
    /// Errors returned by upcoming `build_mosaic` calls, consumed in order.
    scripted_build_errors: Mutex<VecDeque<UpstreamError>>,
    /// Errors returned by upcoming `fetch_tile` calls, consumed in order.
    scripted_fetch_errors: Mutex<VecDeque<UpstreamError>>,
    /// Artificial latency per build, to widen race windows in tests.
    build_delay: Mutex<Duration>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `build_mosaic` calls that reached the fake.
    pub fn build_calls(&self) -> u64 {
        self.build_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_tile` calls that reached the fake.
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Queues an error for the next build call.
    pub fn fail_next_build(&self, error: UpstreamError) {
        self.scripted_build_errors.lock().push_back(error);
    }

    /// Queues `n` copies of an error for upcoming fetch calls.
    pub fn fail_next_fetches(&self, error: UpstreamError, n: usize) {
        let mut q = self.scripted_fetch_errors.lock();
        for _ in 0..n {
            q.push_back(error.clone());
        }
    }

    /// Adds artificial latency to builds.
    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock() = delay;
    }

    /// The deterministic tile bytes for a URL, for test assertions.
    pub fn tile_bytes_for(url: &str) -> Vec<u8> {
        format!("\u{89}PNG:{url}").into_bytes()
    }
}

impl UpstreamClient for FakeUpstream {
    fn build_mosaic(
        &self,
        key: &MosaicKey,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<String, UpstreamError>> {
        let key = key.clone();
        Box::pin(async move {
            let delay = *self.build_delay.lock();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                }
            }
            self.build_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.scripted_build_errors.lock().pop_front() {
                return Err(err);
            }
            Ok(format!("fake://mosaic/{}/{{z}}/{{x}}/{{y}}", key.canonical()))
        })
    }

    fn fetch_tile(
        &self,
        url: &str,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Vec<u8>, UpstreamError>> {
        let url = url.to_string();
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.scripted_fetch_errors.lock().pop_front() {
                return Err(err);
            }
            Ok(Self::tile_bytes_for(&url))
        })
    }
}
