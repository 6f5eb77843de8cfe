#![allow(dead_code)]

use geotally::alias::AliasTable;
use geotally::geocode::PolygonGeocoder;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;

/// One square, lon/lat 0..10, with a delimiter in its region name.
pub const BOUNDARIES: &str = r#"{
    "type": "FeatureCollection",
    "features": [
        {"type": "Feature",
         "properties": {"region": "Rhondda, Cynon, Taff", "country": "Wales"},
         "geometry": {"type": "Polygon",
                      "coordinates": [[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]]}}
    ]
}"#;

pub fn geocoder() -> PolygonGeocoder {
    PolygonGeocoder::from_geojson(BOUNDARIES).unwrap()
}

pub fn aliases() -> AliasTable {
    AliasTable::new()
        .with_rule("Bob.*", "rj")
        .unwrap()
        .with_rule("Kayleigh.*", "kd")
        .unwrap()
}

/// A GeoJSON point feature line, as the tracker exports them.
pub fn point(owner: Option<&str>, activity: Option<&str>, time: Option<&str>, lon: f64, lat: f64) -> String {
    let mut properties = Map::new();
    if let Some(owner) = owner {
        properties.insert("Name".to_string(), json!(owner));
    }
    if let Some(activity) = activity {
        properties.insert("Activity".to_string(), json!(activity));
    }
    if let Some(time) = time {
        properties.insert("Time".to_string(), json!(time));
    }
    json!({
        "type": "Feature",
        "geometry": {"type": "Point", "coordinates": [lon, lat]},
        "properties": Value::Object(properties),
    })
    .to_string()
}

pub fn join_lines(lines: &[String]) -> Vec<u8> {
    let mut text = lines.join("\n");
    text.push('\n');
    text.into_bytes()
}

/// Data lines of an artifact, header dropped.
pub fn artifact_rows(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

/// Artifact file names in `dir`, sorted.
pub fn artifact_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("batch."))
        .collect();
    names.sort();
    names
}
