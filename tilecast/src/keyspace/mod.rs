//! Request validation and canonical key derivation.
//!
//! This module is the only gate between raw wire input and the rest of the
//! pipeline. `canonicalise` checks every field of a `TileRequest` and yields
//! the `TileKey` the caches and the engine operate on; anything invalid is
//! rejected here and never reaches the upstream.
//!
//! The blob path serialisation round-trips: `parse_blob_path(k.blob_path())`
//! returns the original key for every valid key.

mod types;

pub use types::{
    Category, CompositeMode, Layer, MosaicKey, Period, TileKey, TileRequest, MAX_ZOOM, MIN_ZOOM,
};

use chrono::Datelike;
use thiserror::Error;

use crate::visparam::VisParamRegistry;

/// Validation failures for tile requests.
///
/// `is_not_found` separates "the request shape is wrong" (HTTP 400) from
/// "the request names something that does not exist" (HTTP 404).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("zoom {0} outside supported range {MIN_ZOOM}-{MAX_ZOOM}")]
    ZoomOutOfRange(u8),

    #[error("tile ({x}, {y}) outside the zoom {z} grid")]
    CoordOutOfRange { x: u32, y: u32, z: u8 },

    #[error("month is required when period is MONTH")]
    MonthRequired,

    #[error("month is only valid when period is MONTH")]
    MonthNotAllowed,

    #[error("month {0} outside 1-12")]
    MonthOutOfRange(u8),

    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    #[error("unknown period: {0}")]
    UnknownPeriod(String),

    #[error("unknown composite mode: {0}")]
    UnknownCompositeMode(String),

    #[error("composite mode is only supported for the landsat layer")]
    CompositeNotSupported,

    #[error("year {year} not available for layer {layer}")]
    YearOutOfRange { layer: Layer, year: i32 },

    #[error("unknown visparam: {0}")]
    UnknownVisParam(String),

    #[error("visparam {visparam} is not compatible with layer {layer}")]
    IncompatibleVisParam { layer: Layer, visparam: String },
}

impl KeyError {
    /// True when the request is well-formed but names an unknown resource.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            KeyError::UnknownLayer(_)
                | KeyError::YearOutOfRange { .. }
                | KeyError::UnknownVisParam(_)
                | KeyError::IncompatibleVisParam { .. }
        )
    }
}

/// Validates a raw request and derives its canonical `TileKey`.
///
/// Checks, in order: zoom range, coordinate range, month/period agreement,
/// per-layer year range, composite-mode applicability, and visparam
/// existence/compatibility against the registry.
///
/// # Errors
///
/// A `KeyError` describing the first violation found. Callers map it to 400
/// or 404 via `KeyError::is_not_found`.
pub fn canonicalise(req: &TileRequest, registry: &VisParamRegistry) -> Result<TileKey, KeyError> {
    if !(MIN_ZOOM..=MAX_ZOOM).contains(&req.z) {
        return Err(KeyError::ZoomOutOfRange(req.z));
    }
    let extent = 1u32 << req.z;
    if req.x >= extent || req.y >= extent {
        return Err(KeyError::CoordOutOfRange {
            x: req.x,
            y: req.y,
            z: req.z,
        });
    }

    let month = match (req.period, req.month) {
        (Period::Month, None) => return Err(KeyError::MonthRequired),
        (Period::Month, Some(m)) => {
            if !(1..=12).contains(&m) {
                return Err(KeyError::MonthOutOfRange(m));
            }
            Some(m)
        }
        (_, Some(_)) => return Err(KeyError::MonthNotAllowed),
        (_, None) => None,
    };

    let current_year = chrono::Utc::now().year();
    if req.year < req.layer.first_year() || req.year > current_year {
        return Err(KeyError::YearOutOfRange {
            layer: req.layer,
            year: req.year,
        });
    }

    if req.composite != CompositeMode::BestImage && req.layer != Layer::Landsat {
        return Err(KeyError::CompositeNotSupported);
    }

    if registry.lookup(&req.visparam).is_none() {
        return Err(KeyError::UnknownVisParam(req.visparam.clone()));
    }
    if !registry.is_compatible(req.layer, &req.visparam) {
        return Err(KeyError::IncompatibleVisParam {
            layer: req.layer,
            visparam: req.visparam.clone(),
        });
    }

    Ok(TileKey {
        mosaic: MosaicKey {
            layer: req.layer,
            period: req.period,
            year: req.year,
            month,
            visparam: req.visparam.clone(),
            composite: req.composite,
        },
        z: req.z,
        x: req.x,
        y: req.y,
    })
}

/// Parses an object-store path back into a `TileKey`.
///
/// Returns `None` for anything that does not match the layout produced by
/// `TileKey::blob_path`. Structural inverse only: the visparam is not checked
/// against the registry.
pub fn parse_blob_path(path: &str) -> Option<TileKey> {
    let rest = path.strip_prefix("tiles/")?;
    let segments: Vec<&str> = rest.split('/').collect();

    let layer: Layer = segments.first()?.parse().ok()?;
    let period: Period = segments.get(1)?.parse().ok()?;
    let year: i32 = segments.get(2)?.parse().ok()?;

    let (month, tail) = if period == Period::Month {
        let raw = segments.get(3)?;
        if raw.len() != 2 {
            return None;
        }
        (Some(raw.parse::<u8>().ok()?), &segments[4..])
    } else {
        (None, &segments[3..])
    };

    if tail.len() != 4 {
        return None;
    }
    let (visparam, composite) = match tail[0].split_once('+') {
        Some((name, "mosaic")) => (name.to_string(), CompositeMode::Mosaic),
        Some(_) => return None,
        None => (tail[0].to_string(), CompositeMode::BestImage),
    };
    if composite == CompositeMode::Mosaic && layer != Layer::Landsat {
        return None;
    }

    let z: u8 = tail[1].parse().ok()?;
    let x: u32 = tail[2].parse().ok()?;
    let y: u32 = tail[3].strip_suffix(".png")?.parse().ok()?;

    if !(MIN_ZOOM..=MAX_ZOOM).contains(&z) {
        return None;
    }
    let extent = 1u32 << z;
    if x >= extent || y >= extent {
        return None;
    }
    if let Some(m) = month {
        if !(1..=12).contains(&m) {
            return None;
        }
    }

    Some(TileKey {
        mosaic: MosaicKey {
            layer,
            period,
            year,
            month,
            visparam,
            composite,
        },
        z,
        x,
        y,
    })
}

/// Object-store prefixes covered by an invalidation scoped to a layer and/or
/// year.
///
/// The year segment sits below the period segment, so a year-scoped clear
/// expands to one prefix per period (and per layer when no layer is given).
pub fn clear_prefixes(layer: Option<Layer>, year: Option<i32>) -> Vec<String> {
    let layers: Vec<Layer> = match layer {
        Some(l) => vec![l],
        None => Layer::ALL.to_vec(),
    };
    match year {
        None => layers
            .iter()
            .map(|l| format!("tiles/{l}/"))
            .collect(),
        Some(year) => layers
            .iter()
            .flat_map(|l| {
                Period::ALL
                    .iter()
                    .map(move |p| format!("tiles/{l}/{p}/{year}/"))
            })
            .collect(),
    }
}

/// Canonical mosaic-key prefixes covered by an invalidation scoped to a
/// layer and/or year, without the `mosaic:`/`coalesce:` namespace.
///
/// Mirrors `clear_prefixes`: the year segment sits after the period segment
/// in the canonical form, so a year-scoped clear expands per period.
pub fn mosaic_prefixes(layer: Option<Layer>, year: Option<i32>) -> Vec<String> {
    let layers: Vec<Layer> = match layer {
        Some(l) => vec![l],
        None => Layer::ALL.to_vec(),
    };
    match year {
        None => layers.iter().map(|l| format!("{l}|")).collect(),
        Some(year) => layers
            .iter()
            .flat_map(|l| Period::ALL.iter().map(move |p| format!("{l}|{p}|{year}|")))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visparam::VisParamRegistry;

    fn registry() -> VisParamRegistry {
        VisParamRegistry::with_builtin_catalogue()
    }

    fn base_request() -> TileRequest {
        TileRequest {
            layer: Layer::S2Harmonized,
            x: 100,
            y: 100,
            z: 12,
            period: Period::Wet,
            year: 2023,
            month: None,
            visparam: "tvi-red".to_string(),
            composite: CompositeMode::BestImage,
        }
    }

    #[test]
    fn test_canonicalise_valid_request() {
        let key = canonicalise(&base_request(), &registry()).unwrap();
        assert_eq!(key.mosaic.canonical(), "s2_harmonized|WET|2023|tvi-red");
        assert_eq!(
            key.blob_path(),
            "tiles/s2_harmonized/WET/2023/tvi-red/12/100/100.png"
        );
    }

    #[test]
    fn test_zoom_below_range_rejected() {
        let mut req = base_request();
        req.z = 5;
        let err = canonicalise(&req, &registry()).unwrap_err();
        assert_eq!(err, KeyError::ZoomOutOfRange(5));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_zoom_above_range_rejected() {
        let mut req = base_request();
        req.z = 19;
        assert_eq!(
            canonicalise(&req, &registry()).unwrap_err(),
            KeyError::ZoomOutOfRange(19)
        );
    }

    #[test]
    fn test_coordinates_checked_against_zoom_grid() {
        let mut req = base_request();
        req.z = 6;
        req.x = 64; // grid at zoom 6 is 0..64
        assert!(matches!(
            canonicalise(&req, &registry()).unwrap_err(),
            KeyError::CoordOutOfRange { .. }
        ));
    }

    #[test]
    fn test_month_required_for_month_period() {
        let mut req = base_request();
        req.period = Period::Month;
        req.month = None;
        assert_eq!(
            canonicalise(&req, &registry()).unwrap_err(),
            KeyError::MonthRequired
        );
    }

    #[test]
    fn test_month_thirteen_rejected() {
        let mut req = base_request();
        req.period = Period::Month;
        req.month = Some(13);
        assert_eq!(
            canonicalise(&req, &registry()).unwrap_err(),
            KeyError::MonthOutOfRange(13)
        );
    }

    #[test]
    fn test_month_rejected_outside_month_period() {
        let mut req = base_request();
        req.month = Some(7);
        assert_eq!(
            canonicalise(&req, &registry()).unwrap_err(),
            KeyError::MonthNotAllowed
        );
    }

    #[test]
    fn test_year_before_sentinel_floor_is_not_found() {
        let mut req = base_request();
        req.year = 2016;
        let err = canonicalise(&req, &registry()).unwrap_err();
        assert!(matches!(err, KeyError::YearOutOfRange { year: 2016, .. }));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_landsat_accepts_1985() {
        let mut req = base_request();
        req.layer = Layer::Landsat;
        req.year = 1985;
        req.visparam = "landsat-tvi-false".to_string();
        assert!(canonicalise(&req, &registry()).is_ok());
    }

    #[test]
    fn test_landsat_visparam_on_sentinel_is_not_found() {
        let mut req = base_request();
        req.visparam = "landsat-tvi-false".to_string();
        let err = canonicalise(&req, &registry()).unwrap_err();
        assert!(matches!(err, KeyError::IncompatibleVisParam { .. }));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_visparam_is_not_found() {
        let mut req = base_request();
        req.visparam = "no-such-recipe".to_string();
        let err = canonicalise(&req, &registry()).unwrap_err();
        assert_eq!(err, KeyError::UnknownVisParam("no-such-recipe".to_string()));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_composite_mode_only_for_landsat() {
        let mut req = base_request();
        req.composite = CompositeMode::Mosaic;
        assert_eq!(
            canonicalise(&req, &registry()).unwrap_err(),
            KeyError::CompositeNotSupported
        );
    }

    #[test]
    fn test_month_key_is_zero_padded() {
        let mut req = base_request();
        req.layer = Layer::Landsat;
        req.period = Period::Month;
        req.month = Some(7);
        req.year = 2024;
        req.visparam = "landsat-tvi-false".to_string();
        let key = canonicalise(&req, &registry()).unwrap();
        assert_eq!(
            key.mosaic.canonical(),
            "landsat|MONTH|2024|07|landsat-tvi-false"
        );
        assert_eq!(
            key.blob_path(),
            "tiles/landsat/MONTH/2024/07/landsat-tvi-false/12/100/100.png"
        );
    }

    #[test]
    fn test_meta_and_election_keys() {
        let key = canonicalise(&base_request(), &registry()).unwrap();
        assert_eq!(key.mosaic.meta_key(), "mosaic:s2_harmonized|WET|2023|tvi-red");
        assert_eq!(
            key.mosaic.election_key(),
            "coalesce:s2_harmonized|WET|2023|tvi-red"
        );
    }

    #[test]
    fn test_blob_path_round_trip() {
        let reg = registry();
        let mut checked = 0usize;
        // A deterministic sweep over the valid space stands in for random
        // sampling: every layer, period, a spread of years, zooms and coords.
        for layer in Layer::ALL {
            let visparam = match layer {
                Layer::S2Harmonized => "tvi-red",
                Layer::Landsat => "landsat-tvi-false",
            };
            for period in Period::ALL {
                for year_off in [0, 3, 6] {
                    for z in [MIN_ZOOM, 10, 14, MAX_ZOOM] {
                        for (xs, ys) in [(0u32, 0u32), (17, 44), (63, 1)] {
                            let extent = 1u32 << z;
                            let req = TileRequest {
                                layer,
                                x: xs % extent,
                                y: ys % extent,
                                z,
                                period,
                                year: layer.first_year() + year_off,
                                month: (period == Period::Month).then_some(7),
                                visparam: visparam.to_string(),
                                composite: CompositeMode::BestImage,
                            };
                            let key = canonicalise(&req, &reg).unwrap();
                            let parsed = parse_blob_path(&key.blob_path()).unwrap();
                            assert_eq!(parsed, key);
                            checked += 1;
                        }
                    }
                }
            }
        }
        assert!(checked >= 200);
    }

    #[test]
    fn test_blob_path_round_trip_with_composite() {
        let key = TileKey {
            mosaic: MosaicKey {
                layer: Layer::Landsat,
                period: Period::Dry,
                year: 2020,
                month: None,
                visparam: "landsat-tvi-true".to_string(),
                composite: CompositeMode::Mosaic,
            },
            z: 10,
            x: 300,
            y: 500,
        };
        assert_eq!(
            key.blob_path(),
            "tiles/landsat/DRY/2020/landsat-tvi-true+mosaic/10/300/500.png"
        );
        assert_eq!(parse_blob_path(&key.blob_path()).unwrap(), key);
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        assert!(parse_blob_path("tiles/s2_harmonized/WET/2023/tvi-red/12/100").is_none());
        assert!(parse_blob_path("other/s2_harmonized/WET/2023/tvi-red/12/100/100.png").is_none());
        assert!(parse_blob_path("tiles/unknown/WET/2023/tvi-red/12/100/100.png").is_none());
        assert!(parse_blob_path("tiles/s2_harmonized/WET/2023/tvi-red/5/0/0.png").is_none());
        // MONTH without a month segment shifts the tail and must not parse.
        assert!(parse_blob_path("tiles/landsat/MONTH/2024/landsat-tvi-false/12/1/1.png").is_none());
        // Composite suffix is landsat-only.
        assert!(parse_blob_path("tiles/s2_harmonized/WET/2023/tvi-red+mosaic/12/1/1.png").is_none());
    }

    #[test]
    fn test_clear_prefixes_layer_only() {
        assert_eq!(
            clear_prefixes(Some(Layer::Landsat), None),
            vec!["tiles/landsat/".to_string()]
        );
    }

    #[test]
    fn test_clear_prefixes_layer_and_year() {
        let prefixes = clear_prefixes(Some(Layer::Landsat), Some(2024));
        assert_eq!(
            prefixes,
            vec![
                "tiles/landsat/WET/2024/".to_string(),
                "tiles/landsat/DRY/2024/".to_string(),
                "tiles/landsat/MONTH/2024/".to_string(),
            ]
        );
    }

    #[test]
    fn test_clear_prefixes_year_only_spans_layers() {
        let prefixes = clear_prefixes(None, Some(2023));
        assert_eq!(prefixes.len(), Layer::ALL.len() * Period::ALL.len());
        assert!(prefixes.contains(&"tiles/s2_harmonized/DRY/2023/".to_string()));
    }

    #[test]
    fn test_mosaic_prefixes_match_canonical_keys() {
        let key = canonicalise(&base_request(), &registry()).unwrap();
        let by_layer = mosaic_prefixes(Some(Layer::S2Harmonized), None);
        assert!(by_layer.iter().any(|p| key.mosaic.canonical().starts_with(p)));

        let by_year = mosaic_prefixes(Some(Layer::S2Harmonized), Some(2023));
        assert!(by_year.iter().any(|p| key.mosaic.canonical().starts_with(p)));

        let other_year = mosaic_prefixes(Some(Layer::S2Harmonized), Some(2022));
        assert!(!other_year.iter().any(|p| key.mosaic.canonical().starts_with(p)));
    }
}
