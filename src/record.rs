use crate::alias::AliasTable;
use crate::TallyError;
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

/// One decoded track point.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub owner_raw: Option<String>,
    pub canonical_owner: Option<String>,
    pub activity: Option<String>,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub point: Point,
}

impl Record {
    /// Resolve the owner through the alias table.
    pub fn canonicalize(mut self, aliases: &AliasTable) -> Self {
        self.canonical_owner = self.owner_raw.as_deref().map(|name| aliases.canonicalize(name));
        self
    }
}

#[derive(Deserialize)]
struct RawFeature {
    geometry: RawGeometry,
    #[serde(default)]
    properties: RawProperties,
}

#[derive(Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Vec<f64>,
}

#[derive(Deserialize, Default)]
struct RawProperties {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Activity")]
    activity: Option<String>,
    #[serde(rename = "Time")]
    time: Option<String>,
}

fn decode_error(reason: impl Into<String>) -> TallyError {
    TallyError::Decode { line: 0, reason: reason.into() }
}

/// Decode one GeoJSON point feature. The canonical owner is left unset; see
/// [`Record::canonicalize`].
pub fn parse_record(line: &[u8]) -> Result<Record, TallyError> {
    let raw: RawFeature = serde_json::from_slice(line).map_err(|e| decode_error(e.to_string()))?;

    if raw.geometry.kind != "Point" {
        return Err(decode_error(format!("expected Point geometry, got {}", raw.geometry.kind)));
    }
    let (lon, lat) = match raw.geometry.coordinates.as_slice() {
        [lon, lat, ..] => (*lon, *lat),
        _ => return Err(decode_error("point needs at least two coordinates")),
    };

    let timestamp = raw
        .properties
        .time
        .as_deref()
        .map(|t| DateTime::parse_from_rfc3339(t).map_err(|e| TallyError::Timestamp(format!("{}: {}", t, e))))
        .transpose()?;

    Ok(Record {
        owner_raw: raw.properties.name.filter(|n| !n.is_empty()),
        canonical_owner: None,
        activity: raw.properties.activity.filter(|a| !a.is_empty()),
        timestamp,
        point: Point { lon, lat },
    })
}
