//! Adapter for the Earth-imagery compute backend.
//!
//! The backend builds a mosaic for a `(layer, period, year[, month],
//! visparam)` tuple and answers with a tile URL template; individual tiles
//! are then plain HTTP GETs against the filled-in template. Both operations
//! live behind the `UpstreamClient` trait so the engine and the job workers
//! can run against a fake in tests.
//!
//! `build_mosaic` must never be called directly by the engine; it only runs
//! inside the MosaicCache's single-flight election.

mod fake;
mod gee;

pub use fake::FakeUpstream;
pub use gee::GeeUpstreamClient;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::keyspace::{MosaicKey, Period};
pub use crate::meta::BoxFuture;

/// Failure taxonomy for upstream calls.
///
/// The retry policy is exhaustive over these variants: `Transient` is
/// retried, `Quota` feeds the circuit breaker, `Permanent` is cached briefly
/// and surfaced, `Cancelled` aborts silently.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("upstream quota exceeded: {0}")]
    Quota(String),

    #[error("permanent upstream failure: {0}")]
    Permanent(String),

    #[error("upstream call cancelled")]
    Cancelled,
}

impl UpstreamError {
    /// True for failures worth retrying on the same code path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

/// Client for the Earth-imagery compute backend.
pub trait UpstreamClient: Send + Sync {
    /// Builds (or reuses, upstream-side) a mosaic and returns its tile URL
    /// template. May take several seconds.
    fn build_mosaic(
        &self,
        key: &MosaicKey,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<String, UpstreamError>>;

    /// Fetches one tile's PNG bytes from a filled-in template URL.
    fn fetch_tile(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Vec<u8>, UpstreamError>>;
}

/// Substitutes XYZ coordinates into a `{x}`/`{y}`/`{z}` URL template.
pub fn fill_template(template: &str, z: u8, x: u32, y: u32) -> String {
    template
        .replace("{x}", &x.to_string())
        .replace("{y}", &y.to_string())
        .replace("{z}", &z.to_string())
}

/// Inclusive compositing date window for a mosaic key, as `YYYY-MM-DD`.
///
/// WET is January through April, DRY June through October; MONTH covers the
/// named calendar month.
pub fn date_window(key: &MosaicKey) -> (String, String) {
    let year = key.year;
    match key.period {
        Period::Wet => (format!("{year}-01-01"), format!("{year}-04-30")),
        Period::Dry => (format!("{year}-06-01"), format!("{year}-10-30")),
        Period::Month => {
            // Month presence is enforced at canonicalisation.
            let month = key.month.unwrap_or(1);
            let last = days_in_month(year, month);
            (
                format!("{year}-{month:02}-01"),
                format!("{year}-{month:02}-{last:02}"),
            )
        }
    }
}

fn days_in_month(year: i32, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}
