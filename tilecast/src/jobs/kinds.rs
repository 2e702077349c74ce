//! Tile enumeration for the warming job kinds.
//!
//! Pure functions turning a geographic target (point or bounding box) plus a
//! parameter space (layers, periods, years, zooms, visparams) into the
//! concrete `TileRequest`s that drive the engine. Incompatible combinations
//! are skipped here rather than failing the whole job: a Landsat recipe
//! never pairs with a Sentinel layer and a year below a layer's range never
//! pairs with that layer.

use crate::coord::{self, BoundingBox, CoordError};
use crate::keyspace::{CompositeMode, Layer, Period, TileRequest, MAX_ZOOM, MIN_ZOOM};
use crate::visparam::VisParamRegistry;

/// Default zoom levels warmed around campaign points.
pub const POINT_ZOOMS: [u8; 3] = [12, 13, 14];

/// Enumerates the requests covering one point across a parameter space.
///
/// One tile per zoom level (the tile containing the point), crossed with
/// every valid (layer, period, year, visparam) combination. MONTH periods
/// are skipped: warming targets seasonal composites.
#[allow(clippy::too_many_arguments)]
pub fn point_requests(
    lat: f64,
    lon: f64,
    layers: &[Layer],
    periods: &[Period],
    years: &[i32],
    zooms: &[u8],
    visparams: &[String],
    registry: &VisParamRegistry,
) -> Result<Vec<TileRequest>, CoordError> {
    let mut requests = Vec::new();
    for &zoom in zooms {
        if !(MIN_ZOOM..=MAX_ZOOM).contains(&zoom) {
            continue;
        }
        let tile = coord::to_tile_coords(lat, lon, zoom)?;
        push_combinations(
            &mut requests,
            layers,
            periods,
            years,
            visparams,
            registry,
            &[tile],
        );
    }
    Ok(requests)
}

/// Enumerates the requests covering a bounding box across a parameter space.
#[allow(clippy::too_many_arguments)]
pub fn region_requests(
    bbox: &BoundingBox,
    layers: &[Layer],
    periods: &[Period],
    years: &[i32],
    zooms: &[u8],
    visparams: &[String],
    registry: &VisParamRegistry,
    max_tiles: usize,
) -> Result<Vec<TileRequest>, CoordError> {
    let mut requests = Vec::new();
    for &zoom in zooms {
        if !(MIN_ZOOM..=MAX_ZOOM).contains(&zoom) {
            continue;
        }
        let tiles = coord::tiles_in_bbox(bbox, zoom)?;
        push_combinations(
            &mut requests,
            layers,
            periods,
            years,
            visparams,
            registry,
            &tiles,
        );
        if requests.len() >= max_tiles {
            requests.truncate(max_tiles);
            break;
        }
    }
    Ok(requests)
}

fn push_combinations(
    out: &mut Vec<TileRequest>,
    layers: &[Layer],
    periods: &[Period],
    years: &[i32],
    visparams: &[String],
    registry: &VisParamRegistry,
    tiles: &[coord::TileCoord],
) {
    for &layer in layers {
        for visparam in visparams {
            if !registry.is_compatible(layer, visparam) {
                continue;
            }
            for &year in years {
                if year < layer.first_year() {
                    continue;
                }
                for &period in periods {
                    if period == Period::Month {
                        continue;
                    }
                    for tile in tiles {
                        out.push(TileRequest {
                            layer,
                            x: tile.x,
                            y: tile.y,
                            z: tile.z,
                            period,
                            year,
                            month: None,
                            visparam: visparam.clone(),
                            composite: CompositeMode::BestImage,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VisParamRegistry {
        VisParamRegistry::with_builtin_catalogue()
    }

    #[test]
    fn test_point_requests_one_tile_per_zoom() {
        let requests = point_requests(
            -15.79,
            -47.88,
            &[Layer::S2Harmonized],
            &[Period::Wet],
            &[2023],
            &POINT_ZOOMS,
            &["tvi-red".to_string()],
            &registry(),
        )
        .unwrap();
        assert_eq!(requests.len(), 3);
        let zooms: Vec<u8> = requests.iter().map(|r| r.z).collect();
        assert_eq!(zooms, vec![12, 13, 14]);
    }

    #[test]
    fn test_incompatible_visparams_skipped() {
        let requests = point_requests(
            -15.79,
            -47.88,
            &[Layer::S2Harmonized, Layer::Landsat],
            &[Period::Wet],
            &[2023],
            &[12],
            &["tvi-red".to_string(), "landsat-tvi-false".to_string()],
            &registry(),
        )
        .unwrap();
        // Each layer pairs with exactly its own recipe.
        assert_eq!(requests.len(), 2);
        for r in &requests {
            match r.layer {
                Layer::S2Harmonized => assert_eq!(r.visparam, "tvi-red"),
                Layer::Landsat => assert_eq!(r.visparam, "landsat-tvi-false"),
            }
        }
    }

    #[test]
    fn test_years_below_layer_floor_skipped() {
        let requests = point_requests(
            -15.79,
            -47.88,
            &[Layer::S2Harmonized],
            &[Period::Wet],
            &[2015, 2023],
            &[12],
            &["tvi-red".to_string()],
            &registry(),
        )
        .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].year, 2023);
    }

    #[test]
    fn test_month_period_skipped() {
        let requests = point_requests(
            -15.79,
            -47.88,
            &[Layer::S2Harmonized],
            &[Period::Wet, Period::Month],
            &[2023],
            &[12],
            &["tvi-red".to_string()],
            &registry(),
        )
        .unwrap();
        assert!(requests.iter().all(|r| r.period == Period::Wet));
    }

    #[test]
    fn test_out_of_range_zoom_skipped() {
        let requests = point_requests(
            -15.79,
            -47.88,
            &[Layer::S2Harmonized],
            &[Period::Wet],
            &[2023],
            &[3, 12, 20],
            &["tvi-red".to_string()],
            &registry(),
        )
        .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].z, 12);
    }

    #[test]
    fn test_region_requests_cover_bbox() {
        let bbox = BoundingBox {
            west: -46.7,
            south: -23.6,
            east: -46.5,
            north: -23.4,
        };
        let requests = region_requests(
            &bbox,
            &[Layer::S2Harmonized],
            &[Period::Wet],
            &[2023],
            &[10],
            &["tvi-red".to_string()],
            &registry(),
            10_000,
        )
        .unwrap();
        assert!(!requests.is_empty());
        // All tiles fall inside the zoom-10 grid.
        assert!(requests.iter().all(|r| r.z == 10 && r.x < 1024 && r.y < 1024));
    }

    #[test]
    fn test_region_requests_respect_max_tiles() {
        let bbox = BoundingBox {
            west: -50.0,
            south: -25.0,
            east: -40.0,
            north: -15.0,
        };
        let requests = region_requests(
            &bbox,
            &[Layer::S2Harmonized],
            &[Period::Wet, Period::Dry],
            &[2021, 2022, 2023],
            &[12, 13],
            &["tvi-red".to_string()],
            &registry(),
            500,
        )
        .unwrap();
        assert_eq!(requests.len(), 500);
    }

    #[test]
    fn test_region_requests_reject_bad_bbox() {
        let bbox = BoundingBox {
            west: -200.0,
            south: -25.0,
            east: -40.0,
            north: -15.0,
        };
        assert!(region_requests(
            &bbox,
            &[Layer::S2Harmonized],
            &[Period::Wet],
            &[2023],
            &[12],
            &["tvi-red".to_string()],
            &registry(),
            100,
        )
        .is_err());
    }
}
