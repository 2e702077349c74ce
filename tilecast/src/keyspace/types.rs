//! Key space types: layers, periods, mosaic keys and tile keys.
//!
//! A `MosaicKey` identifies one upstream mosaic build; a `TileKey` extends it
//! with XYZ coordinates and doubles as the object-store path for the rendered
//! PNG. Canonical serialisations are fixed so the same request always maps to
//! the same MetaStore key and BlobStore path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::KeyError;

/// Lowest zoom level served.
pub const MIN_ZOOM: u8 = 6;

/// Highest zoom level served.
pub const MAX_ZOOM: u8 = 18;

/// Satellite sensor family a layer or visparam belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Sentinel-2 derived products.
    Sentinel,
    /// Landsat derived products.
    Landsat,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Sentinel => write!(f, "sentinel"),
            Category::Landsat => write!(f, "landsat"),
        }
    }
}

/// Imagery layer served by the tile endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Sentinel-2 harmonized collection (2017-present).
    S2Harmonized,
    /// Landsat collections TM/ETM+/OLI (1985-present).
    Landsat,
}

impl Layer {
    /// All layers the server knows about.
    pub const ALL: [Layer; 2] = [Layer::S2Harmonized, Layer::Landsat];

    /// Canonical lowercase name used in URLs, keys and paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::S2Harmonized => "s2_harmonized",
            Layer::Landsat => "landsat",
        }
    }

    /// First year with imagery for this layer.
    pub fn first_year(&self) -> i32 {
        match self {
            Layer::S2Harmonized => 2017,
            Layer::Landsat => 1985,
        }
    }

    /// Sensor family this layer's visparams must belong to.
    pub fn category(&self) -> Category {
        match self {
            Layer::S2Harmonized => Category::Sentinel,
            Layer::Landsat => Category::Landsat,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Layer {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s2_harmonized" => Ok(Layer::S2Harmonized),
            "landsat" => Ok(Layer::Landsat),
            other => Err(KeyError::UnknownLayer(other.to_string())),
        }
    }
}

/// Temporal compositing window for a mosaic.
///
/// WET and DRY are fixed seasonal windows (January-April and June-October);
/// MONTH selects a single calendar month and requires the `month` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Period {
    Wet,
    Dry,
    Month,
}

impl Period {
    /// All supported periods.
    pub const ALL: [Period; 3] = [Period::Wet, Period::Dry, Period::Month];

    /// Canonical name as it appears in keys and paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Wet => "WET",
            Period::Dry => "DRY",
            Period::Month => "MONTH",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Period {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WET" => Ok(Period::Wet),
            "DRY" => Ok(Period::Dry),
            "MONTH" => Ok(Period::Month),
            other => Err(KeyError::UnknownPeriod(other.to_string())),
        }
    }
}

/// How a Landsat mosaic composites overlapping scenes.
///
/// `BestImage` picks the least-cloudy scene; `Mosaic` blends every scene in
/// the window. The mode is part of the mosaic identity because the two
/// produce different pixels for the same window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompositeMode {
    Mosaic,
    #[default]
    BestImage,
}

impl CompositeMode {
    /// Canonical name as accepted by the query string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeMode::Mosaic => "MOSAIC",
            CompositeMode::BestImage => "BEST_IMAGE",
        }
    }
}

impl FromStr for CompositeMode {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MOSAIC" => Ok(CompositeMode::Mosaic),
            "BEST_IMAGE" => Ok(CompositeMode::BestImage),
            other => Err(KeyError::UnknownCompositeMode(other.to_string())),
        }
    }
}

/// A raw tile request, as decoded from the wire before validation.
///
/// `canonicalise` turns this into a `TileKey` or rejects it; nothing else in
/// the pipeline ever sees an unvalidated request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRequest {
    pub layer: Layer,
    pub x: u32,
    pub y: u32,
    pub z: u8,
    pub period: Period,
    pub year: i32,
    pub month: Option<u8>,
    pub visparam: String,
    #[serde(default)]
    pub composite: CompositeMode,
}

/// Identity of one upstream mosaic build.
///
/// Two tile requests with the same `MosaicKey` share one upstream URL
/// template; the single-flight layers key on its canonical form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MosaicKey {
    pub layer: Layer,
    pub period: Period,
    pub year: i32,
    pub month: Option<u8>,
    pub visparam: String,
    #[serde(default)]
    pub composite: CompositeMode,
}

impl MosaicKey {
    /// Canonical pipe-separated form, e.g. `s2_harmonized|WET|2023|tvi-red`.
    ///
    /// The month appears two-digit zero-padded only for MONTH periods; a
    /// non-default composite mode is folded into the visparam segment so the
    /// key stays a flat string.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}|{}|{}", self.layer, self.period, self.year);
        if let Some(month) = self.month {
            out.push_str(&format!("|{month:02}"));
        }
        out.push('|');
        out.push_str(&self.visparam_segment());
        out
    }

    /// MetaStore key for the cached `MosaicHandle`.
    pub fn meta_key(&self) -> String {
        format!("mosaic:{}", self.canonical())
    }

    /// MetaStore key for the cross-process build election marker.
    pub fn election_key(&self) -> String {
        format!("coalesce:{}", self.canonical())
    }

    /// Visparam path/key segment, carrying the composite-mode suffix when the
    /// mode is not the default.
    pub fn visparam_segment(&self) -> String {
        match self.composite {
            CompositeMode::BestImage => self.visparam.clone(),
            CompositeMode::Mosaic => format!("{}+mosaic", self.visparam),
        }
    }
}

impl fmt::Display for MosaicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Identity of one rendered tile: a mosaic key plus XYZ coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub mosaic: MosaicKey,
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    /// Object-store path for the rendered PNG.
    ///
    /// Layout: `tiles/<layer>/<period>/<year>[/<month>]/<visparam>/<z>/<x>/<y>.png`.
    pub fn blob_path(&self) -> String {
        let m = &self.mosaic;
        let mut out = format!("tiles/{}/{}/{}", m.layer, m.period, m.year);
        if let Some(month) = m.month {
            out.push_str(&format!("/{month:02}"));
        }
        out.push_str(&format!(
            "/{}/{}/{}/{}.png",
            m.visparam_segment(),
            self.z,
            self.x,
            self.y
        ));
        out
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.blob_path())
    }
}
