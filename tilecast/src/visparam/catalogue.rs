//! Built-in visualization parameter catalogue.
//!
//! Seed recipes used until the externally-managed catalogue is synced in via
//! `VisParamRegistry::replace_catalogue`. The names and band recipes mirror
//! the production catalogue.

use crate::keyspace::Category;

use super::VisParam;

fn sentinel(name: &str, display: &str, bands: [&str; 3], min: &str, max: &str, gamma: f64) -> VisParam {
    VisParam {
        name: name.to_string(),
        display_name: display.to_string(),
        category: Category::Sentinel,
        bands: bands.iter().map(|b| b.to_string()).collect(),
        min: min.to_string(),
        max: max.to_string(),
        gamma: Some(gamma),
        palette: None,
        active: true,
    }
}

fn landsat(name: &str, display: &str, bands: [&str; 3], min: &str, max: &str, gamma: f64) -> VisParam {
    VisParam {
        name: name.to_string(),
        display_name: display.to_string(),
        category: Category::Landsat,
        bands: bands.iter().map(|b| b.to_string()).collect(),
        min: min.to_string(),
        max: max.to_string(),
        gamma: Some(gamma),
        palette: None,
        active: true,
    }
}

/// The built-in recipe set.
pub fn builtin_catalogue() -> Vec<VisParam> {
    vec![
        sentinel(
            "tvi-red",
            "TVI false color (red)",
            ["B11", "B8", "B4"],
            "300,500,100",
            "4300,5400,2800",
            1.05,
        ),
        sentinel(
            "tvi-green",
            "TVI false color (green)",
            ["B8", "B11", "B4"],
            "500,300,100",
            "5400,4300,2800",
            1.05,
        ),
        sentinel(
            "tvi-rgb",
            "True color",
            ["B4", "B3", "B2"],
            "0,0,0",
            "3000,3000,3000",
            1.2,
        ),
        landsat(
            "landsat-tvi-false",
            "TVI false color",
            ["SR_B6", "SR_B5", "SR_B4"],
            "0.03,0.05,0.01",
            "0.43,0.54,0.28",
            1.05,
        ),
        landsat(
            "landsat-tvi-true",
            "True color",
            ["SR_B4", "SR_B3", "SR_B2"],
            "0.0,0.0,0.0",
            "0.3,0.3,0.3",
            1.2,
        ),
        landsat(
            "landsat-tvi-agri",
            "Agriculture composite",
            ["SR_B6", "SR_B5", "SR_B2"],
            "0.03,0.05,0.0",
            "0.43,0.54,0.3",
            1.05,
        ),
    ]
}
