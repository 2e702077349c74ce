//! Tilecast - high-throughput raster tile serving for satellite imagery
//!
//! This library implements the tile-serving hot path for XYZ map tiles (256x256
//! PNG) rendered from satellite imagery mosaics (Sentinel-2, Landsat) built by a
//! remote Earth-imagery compute backend. Its job is to absorb very large
//! front-end request volumes while shielding the expensive upstream from
//! duplicated work.
//!
//! # Architecture
//!
//! ```text
//! HTTP (axum) ──► TileEngine ──► LocalCache (moka, in-process)
//!                     │     ──► BlobStore  (PNG objects, fs or S3-like)
//!                     │     ──► MosaicCache (single-flight URL templates)
//!                     │               └──► UpstreamClient (mosaic builds)
//!                     └──── Limiter (edge token bucket + upstream gate)
//!
//! JobEngine ──► warm-point / warm-campaign / warm-region ──► TileEngine
//! ```
//!
//! Coalescing happens at two levels: a per-process single-flight for tile
//! fetches, and a MetaStore `setnx` election that guarantees at most one
//! concurrent mosaic build per key across the whole fleet.

pub mod app;
pub mod blob;
pub mod cache;
pub mod coord;
pub mod engine;
pub mod http;
pub mod jobs;
pub mod keyspace;
pub mod limiter;
pub mod meta;
pub mod mosaic;
pub mod telemetry;
pub mod upstream;
pub mod visparam;
