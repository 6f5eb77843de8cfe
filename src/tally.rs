use crate::artifact::Dimension;
use crate::geocode::{GeocodeError, ReverseGeocoder};
use crate::record::Record;
use crate::TallyError;
use chrono::{DateTime, FixedOffset, NaiveDate};
use rustc_hash::FxHashMap;

pub const FIELD_DELIMITER: char = ',';
pub const DELIMITER_SUBSTITUTE: char = '/';

/// Replace the artifact field delimiter inside a region name.
pub fn sanitize_region(name: &str) -> String {
    name.replace(FIELD_DELIMITER, &DELIMITER_SUBSTITUTE.to_string())
}

/// One artifact row: `(subKey, owner, date, count)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyRow {
    pub sub_key: String,
    pub owner: String,
    pub date: Option<NaiveDate>,
    pub count: u64,
}

/// owner -> sub-key -> count, plus the last timestamp seen per owner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    counts: FxHashMap<String, FxHashMap<String, u64>>,
    latest: FxHashMap<String, DateTime<FixedOffset>>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild counts from written rows. Dates are not carried over.
    pub fn from_rows(rows: &[TallyRow]) -> Self {
        let mut tally = Self::new();
        for row in rows {
            tally.add(&row.owner, &row.sub_key, row.count);
        }
        tally
    }

    pub fn increment(&mut self, owner: &str, sub_key: &str) {
        self.add(owner, sub_key, 1);
    }

    pub fn add(&mut self, owner: &str, sub_key: &str, n: u64) {
        *self
            .counts
            .entry(owner.to_string())
            .or_default()
            .entry(sub_key.to_string())
            .or_insert(0) += n;
    }

    /// Last write wins, in iteration order.
    pub fn observe_timestamp(&mut self, owner: &str, at: DateTime<FixedOffset>) {
        self.latest.insert(owner.to_string(), at);
    }

    pub fn count(&self, owner: &str, sub_key: &str) -> u64 {
        self.counts
            .get(owner)
            .and_then(|keys| keys.get(sub_key))
            .copied()
            .unwrap_or(0)
    }

    pub fn latest(&self, owner: &str) -> Option<&DateTime<FixedOffset>> {
        self.latest.get(owner)
    }

    pub fn counts(&self) -> &FxHashMap<String, FxHashMap<String, u64>> {
        &self.counts
    }

    /// Number of distinct `(owner, sub-key)` pairs.
    pub fn pair_count(&self) -> usize {
        self.counts.values().map(|keys| keys.len()).sum()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().flat_map(|keys| keys.values()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Rows grouped by owner, sorted by `(owner, sub-key)`.
    pub fn rows(&self) -> Vec<TallyRow> {
        let mut rows: Vec<TallyRow> = self
            .counts
            .iter()
            .flat_map(|(owner, keys)| {
                let date = self.latest.get(owner).map(|t| t.date_naive());
                keys.iter().map(move |(sub_key, count)| TallyRow {
                    sub_key: sub_key.clone(),
                    owner: owner.clone(),
                    date,
                    count: *count,
                })
            })
            .collect();
        rows.sort_by(|a, b| (&a.owner, &a.sub_key).cmp(&(&b.owner, &b.sub_key)));
        rows
    }
}

/// The three per-batch tallies, one per dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchTallies {
    pub activity: Tally,
    pub region: Tally,
    pub country: Tally,
}

impl BatchTallies {
    pub fn get(&self, dimension: Dimension) -> &Tally {
        match dimension {
            Dimension::Activity => &self.activity,
            Dimension::Region => &self.region,
            Dimension::Country => &self.country,
        }
    }

    pub fn get_mut(&mut self, dimension: Dimension) -> &mut Tally {
        match dimension {
            Dimension::Activity => &mut self.activity,
            Dimension::Region => &mut self.region,
            Dimension::Country => &mut self.country,
        }
    }
}

/// Activity pass: owner -> activity label.
pub fn accumulate_activity(records: &[Record]) -> Tally {
    let mut tally = Tally::new();
    for record in records {
        let Some(owner) = record.canonical_owner.as_deref().filter(|o| !o.is_empty()) else {
            continue;
        };
        if let Some(at) = record.timestamp {
            tally.observe_timestamp(owner, at);
        }
        if let Some(activity) = record.activity.as_deref() {
            tally.increment(owner, activity);
        }
    }
    tally
}

/// Output of the geographic pass. `not_found` holds indices into the input
/// slice of records that no boundary contained.
#[derive(Debug, Default)]
pub struct RegionTallies {
    pub region: Tally,
    pub country: Tally,
    pub not_found: Vec<usize>,
}

/// Geographic pass: owner -> region and owner -> country. A not-found lookup
/// drops the record from both tallies; any other geocoder failure is returned.
pub fn accumulate_regions(records: &[Record], geocoder: &dyn ReverseGeocoder) -> Result<RegionTallies, TallyError> {
    let mut out = RegionTallies::default();
    for (index, record) in records.iter().enumerate() {
        let Some(owner) = record.canonical_owner.as_deref().filter(|o| !o.is_empty()) else {
            continue;
        };
        if let Some(at) = record.timestamp {
            out.region.observe_timestamp(owner, at);
            out.country.observe_timestamp(owner, at);
        }

        match geocoder.reverse_geocode(record.point.lon, record.point.lat) {
            Ok(place) => {
                if let Some(region) = place.region.as_deref() {
                    out.region.increment(owner, &sanitize_region(region));
                }
                if let Some(country) = place.country.as_deref() {
                    out.country.increment(owner, country);
                }
            }
            Err(GeocodeError::NotFound) => out.not_found.push(index),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}
