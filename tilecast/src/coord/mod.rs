//! Geographic to XYZ tile coordinate conversion.
//!
//! Provides the Web Mercator math used by the warming jobs to turn points and
//! bounding boxes into tile coordinates at a given zoom level. The serving
//! path never needs these conversions; clients address tiles directly.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum latitude representable in Web Mercator.
pub const MAX_LAT: f64 = 85.051_128_78;

/// Minimum latitude representable in Web Mercator.
pub const MIN_LAT: f64 = -MAX_LAT;

/// Errors for out-of-range geographic input.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum CoordError {
    #[error("latitude {0} outside Web Mercator range")]
    InvalidLatitude(f64),

    #[error("longitude {0} outside -180..180")]
    InvalidLongitude(f64),
}

/// A tile position at a zoom level, in the XYZ/Slippy-Map convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

/// A geographic bounding box in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    /// Validates the box corners against Web Mercator limits.
    pub fn validate(&self) -> Result<(), CoordError> {
        for lat in [self.south, self.north] {
            if !(MIN_LAT..=MAX_LAT).contains(&lat) {
                return Err(CoordError::InvalidLatitude(lat));
            }
        }
        for lon in [self.west, self.east] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(CoordError::InvalidLongitude(lon));
            }
        }
        Ok(())
    }
}

/// Converts geographic coordinates to the tile containing them.
///
/// # Arguments
///
/// * `lat` - Latitude in degrees (clamped to the Web Mercator range)
/// * `lon` - Longitude in degrees (-180.0 to 180.0)
/// * `zoom` - Zoom level
#[inline]
pub fn to_tile_coords(lat: f64, lon: f64, zoom: u8) -> Result<TileCoord, CoordError> {
    if !(MIN_LAT..=MAX_LAT).contains(&lat) {
        return Err(CoordError::InvalidLatitude(lat));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(CoordError::InvalidLongitude(lon));
    }

    let n = 2.0_f64.powi(zoom as i32);
    let x = ((lon + 180.0) / 360.0 * n) as u32;
    let lat_rad = lat * PI / 180.0;
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n) as u32;

    // The poles and the antimeridian land exactly on the grid edge.
    let max = (n as u32).saturating_sub(1);
    Ok(TileCoord {
        x: x.min(max),
        y: y.min(max),
        z: zoom,
    })
}

/// Converts a tile back to the geographic coordinates of its northwest corner.
#[inline]
pub fn tile_to_lat_lon(tile: &TileCoord) -> (f64, f64) {
    let n = 2.0_f64.powi(tile.z as i32);
    let lon = tile.x as f64 / n * 360.0 - 180.0;
    let lat_rad = (PI * (1.0 - 2.0 * tile.y as f64 / n)).sinh().atan();
    (lat_rad * 180.0 / PI, lon)
}

/// Enumerates every tile intersecting a bounding box at one zoom level.
///
/// Tiles come out in row-major order (west to east, north to south), which
/// matches how web map clients request them.
pub fn tiles_in_bbox(bbox: &BoundingBox, zoom: u8) -> Result<Vec<TileCoord>, CoordError> {
    bbox.validate()?;

    let nw = to_tile_coords(bbox.north, bbox.west, zoom)?;
    let se = to_tile_coords(bbox.south, bbox.east, zoom)?;

    let mut tiles = Vec::with_capacity(
        ((se.x - nw.x + 1) as usize) * ((se.y - nw.y + 1) as usize),
    );
    for y in nw.y..=se.y {
        for x in nw.x..=se.x {
            tiles.push(TileCoord { x, y, z: zoom });
        }
    }
    Ok(tiles)
}
