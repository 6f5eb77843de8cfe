use crate::TallyError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// What a point resolved to. Either side may be missing when the loaded
/// boundaries only cover one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Place {
    pub region: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum GeocodeError {
    /// No known boundary contains the point. Counted and logged, never fatal.
    #[error("no boundary contains the point")]
    NotFound,
    #[error("{0}")]
    Failed(String),
}

impl From<GeocodeError> for TallyError {
    fn from(err: GeocodeError) -> Self {
        TallyError::Geocode(err.to_string())
    }
}

pub trait ReverseGeocoder: Send + Sync {
    fn reverse_geocode(&self, lon: f64, lat: f64) -> Result<Place, GeocodeError>;
}

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<BoundaryFeature>,
}

#[derive(Deserialize)]
struct BoundaryFeature {
    geometry: BoundaryGeometry,
    #[serde(default)]
    properties: BoundaryProperties,
}

#[derive(Deserialize)]
#[serde(tag = "type", content = "coordinates")]
enum BoundaryGeometry {
    Polygon(Vec<Vec<Vec<f64>>>),
    MultiPolygon(Vec<Vec<Vec<Vec<f64>>>>),
}

#[derive(Deserialize, Default)]
struct BoundaryProperties {
    #[serde(alias = "STATE_NAME")]
    region: Option<String>,
    #[serde(alias = "SOVEREIGNT")]
    country: Option<String>,
}

type Ring = Vec<(f64, f64)>;

struct Boundary {
    min: (f64, f64),
    max: (f64, f64),
    // Each polygon is an outer ring followed by its holes.
    polygons: Vec<Vec<Ring>>,
    place: Place,
}

impl Boundary {
    fn new(polygons: Vec<Vec<Ring>>, place: Place) -> Self {
        let mut min = (f64::INFINITY, f64::INFINITY);
        let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in polygons.iter().filter_map(|p| p.first()).flatten() {
            min = (min.0.min(*x), min.1.min(*y));
            max = (max.0.max(*x), max.1.max(*y));
        }
        Self { min, max, polygons, place }
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        if x < self.min.0 || x > self.max.0 || y < self.min.1 || y > self.max.1 {
            return false;
        }
        self.polygons.iter().any(|rings| match rings.split_first() {
            Some((outer, holes)) => ring_contains(outer, x, y) && !holes.iter().any(|h| ring_contains(h, x, y)),
            None => false,
        })
    }
}

/// Even-odd ray casting.
fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let mut inside = false;
    let mut j = match ring.len() {
        0 => return false,
        n => n - 1,
    };
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn to_ring(positions: Vec<Vec<f64>>) -> Result<Ring, TallyError> {
    positions
        .into_iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Ok((*x, *y)),
            _ => Err(TallyError::Config("boundary position needs two coordinates".to_string())),
        })
        .collect()
}

fn to_polygon(rings: Vec<Vec<Vec<f64>>>) -> Result<Vec<Ring>, TallyError> {
    rings.into_iter().map(to_ring).collect()
}

/// Point-in-polygon lookup over a GeoJSON FeatureCollection of boundaries.
pub struct PolygonGeocoder {
    boundaries: Vec<Boundary>,
}

impl PolygonGeocoder {
    pub fn from_geojson(text: &str) -> Result<Self, TallyError> {
        let collection: FeatureCollection = serde_json::from_str(text)?;
        let mut boundaries = Vec::with_capacity(collection.features.len());
        for feature in collection.features {
            let polygons = match feature.geometry {
                BoundaryGeometry::Polygon(rings) => vec![to_polygon(rings)?],
                BoundaryGeometry::MultiPolygon(polys) => {
                    polys.into_iter().map(to_polygon).collect::<Result<Vec<_>, _>>()?
                }
            };
            let place = Place {
                region: feature.properties.region,
                country: feature.properties.country,
            };
            boundaries.push(Boundary::new(polygons, place));
        }
        Ok(Self { boundaries })
    }

    pub fn load(path: &Path) -> Result<Self, TallyError> {
        let text = fs::read_to_string(path)?;
        let geocoder = Self::from_geojson(&text)?;
        tracing::info!(path = %path.display(), boundaries = geocoder.len(), "loaded boundaries");
        Ok(geocoder)
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }
}

impl ReverseGeocoder for PolygonGeocoder {
    fn reverse_geocode(&self, lon: f64, lat: f64) -> Result<Place, GeocodeError> {
        if !lon.is_finite() || !lat.is_finite() || lon.abs() > 180.0 || lat.abs() > 90.0 {
            return Err(GeocodeError::Failed(format!("coordinates out of range: ({}, {})", lon, lat)));
        }

        let mut place = Place::default();
        for boundary in self.boundaries.iter().filter(|b| b.contains(lon, lat)) {
            if place.region.is_none() {
                place.region = boundary.place.region.clone();
            }
            if place.country.is_none() {
                place.country = boundary.place.country.clone();
            }
            if place.region.is_some() && place.country.is_some() {
                break;
            }
        }

        if place.region.is_none() && place.country.is_none() {
            return Err(GeocodeError::NotFound);
        }
        Ok(place)
    }
}
