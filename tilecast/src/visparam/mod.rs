//! Read-only view over the visualization-parameter catalogue.
//!
//! Visparams are authored externally; the core only reads them. The registry
//! holds an immutable snapshot behind a lock and exposes a version counter
//! that bumps whenever the snapshot is replaced, so derived views (the
//! capabilities document) know when to rebuild.
//!
//! The recipe captured in a `MosaicKey` is identified by name alone: once a
//! mosaic is built, later catalogue edits never mutate cached tiles, because
//! a renamed or re-parameterised recipe produces a different key.

mod catalogue;

pub use catalogue::builtin_catalogue;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Datelike;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::keyspace::{Category, Layer, Period};

/// A render recipe: bands, stretch and palette for one visual style.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisParam {
    /// Identifier used in request query strings and cache keys.
    pub name: String,
    /// Human-readable name for the capabilities document.
    pub display_name: String,
    /// Sensor family this recipe applies to.
    pub category: Category,
    /// Band selection, outermost first.
    pub bands: Vec<String>,
    /// Per-band stretch minimums, comma separated as the upstream accepts.
    pub min: String,
    /// Per-band stretch maximums, comma separated.
    pub max: String,
    /// Optional gamma correction.
    pub gamma: Option<f64>,
    /// Optional palette for single-band products.
    pub palette: Option<Vec<String>>,
    /// Inactive recipes are hidden from lookup and capabilities.
    pub active: bool,
}

/// Landsat collection id for a given year.
///
/// The sensor generations hand over at fixed years: TM through 2011, ETM+
/// for 2012-2013, OLI for 2014-2024, OLI-2 from 2025.
pub fn landsat_collection_for_year(year: i32) -> &'static str {
    match year {
        ..=2011 => "LANDSAT/LT05/C02/T1_L2",
        2012..=2013 => "LANDSAT/LE07/C02/T1_L2",
        2014..=2024 => "LANDSAT/LC08/C02/T1_L2",
        _ => "LANDSAT/LC09/C02/T1_L2",
    }
}

/// Upstream collection id for a layer and year.
pub fn collection_for(layer: Layer, year: i32) -> &'static str {
    match layer {
        Layer::S2Harmonized => "COPERNICUS/S2_HARMONIZED",
        Layer::Landsat => landsat_collection_for_year(year),
    }
}

#[derive(Debug)]
struct Snapshot {
    by_name: HashMap<String, Arc<VisParam>>,
    version: u64,
}

/// Registry of visualization parameters with a change counter.
#[derive(Debug)]
pub struct VisParamRegistry {
    inner: RwLock<Snapshot>,
}

impl VisParamRegistry {
    /// Creates a registry seeded with the built-in catalogue.
    pub fn with_builtin_catalogue() -> Self {
        Self::from_catalogue(builtin_catalogue())
    }

    /// Creates a registry from an explicit recipe list.
    pub fn from_catalogue(params: Vec<VisParam>) -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                by_name: index(params),
                version: 1,
            }),
        }
    }

    /// Looks up an active recipe by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<VisParam>> {
        let snap = self.inner.read();
        snap.by_name.get(name).filter(|v| v.active).cloned()
    }

    /// True when the named recipe exists, is active, and belongs to the
    /// layer's sensor family.
    pub fn is_compatible(&self, layer: Layer, name: &str) -> bool {
        self.lookup(name)
            .map(|v| v.category == layer.category())
            .unwrap_or(false)
    }

    /// Monotonic snapshot version; bumps on every catalogue replacement.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Replaces the whole catalogue and bumps the version.
    ///
    /// Called by the external catalogue sync; cached tiles are unaffected
    /// because mosaic keys embed the recipe name.
    pub fn replace_catalogue(&self, params: Vec<VisParam>) {
        let mut snap = self.inner.write();
        snap.by_name = index(params);
        snap.version += 1;
    }

    /// Active recipe names for one sensor family, sorted.
    pub fn names_for(&self, category: Category) -> Vec<String> {
        let snap = self.inner.read();
        let mut names: Vec<String> = snap
            .by_name
            .values()
            .filter(|v| v.active && v.category == category)
            .map(|v| v.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Builds the capabilities document for the current snapshot.
    pub fn capabilities(&self) -> Capabilities {
        let version = self.version();
        let current_year = chrono::Utc::now().year();
        let collections = Layer::ALL
            .iter()
            .map(|layer| {
                let years: Vec<i32> = (layer.first_year()..=current_year).collect();
                CollectionCapability {
                    name: layer.as_str().to_string(),
                    satellite: layer.category(),
                    periods: Period::ALL.iter().map(|p| p.as_str().to_string()).collect(),
                    years,
                    visparams: self.names_for(layer.category()),
                    months: (*layer == Layer::Landsat)
                        .then(|| (1..=12).map(|m| format!("{m:02}")).collect()),
                }
            })
            .collect();
        Capabilities {
            collections,
            version,
        }
    }
}

fn index(params: Vec<VisParam>) -> HashMap<String, Arc<VisParam>> {
    params
        .into_iter()
        .map(|p| (p.name.clone(), Arc::new(p)))
        .collect()
}

/// Capabilities document served at `/api/capabilities`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Capabilities {
    pub collections: Vec<CollectionCapability>,
    pub version: u64,
}

/// One layer's advertised parameter space.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionCapability {
    pub name: String,
    pub satellite: Category,
    pub periods: Vec<String>,
    pub years: Vec<i32>,
    pub visparams: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub months: Option<Vec<String>>,
}
