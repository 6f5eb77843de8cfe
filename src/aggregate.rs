use crate::artifact::Dimension;
use crate::tally::{BatchTallies, Tally};
use crate::TallyError;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;

type Counts = FxHashMap<String, FxHashMap<String, u64>>;

/// Process-wide running totals, per dimension: owner -> sub-key -> count.
/// The only state shared between workers; every mutation goes through
/// [`GlobalAggregate::merge_batch`] under one lock.
#[derive(Default)]
pub struct GlobalAggregate {
    totals: Mutex<FxHashMap<Dimension, Counts>>,
}

impl GlobalAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one completed batch into the totals. Commutative and associative,
    /// so batches may arrive in any order.
    pub fn merge_batch(&self, tallies: &BatchTallies) -> Result<(), TallyError> {
        let mut totals = self
            .totals
            .lock()
            .map_err(|_| TallyError::Worker("aggregate lock poisoned".to_string()))?;
        for dimension in Dimension::ALL {
            merge_into(totals.entry(dimension).or_default(), tallies.get(dimension));
        }
        Ok(())
    }

    /// Ordered copy of the current totals.
    pub fn snapshot(&self) -> Result<AggregateSnapshot, TallyError> {
        let totals = self
            .totals
            .lock()
            .map_err(|_| TallyError::Worker("aggregate lock poisoned".to_string()))?;
        let dimensions = totals
            .iter()
            .map(|(dimension, counts)| {
                let ordered: BTreeMap<String, BTreeMap<String, u64>> = counts
                    .iter()
                    .map(|(owner, keys)| {
                        let keys = keys.iter().map(|(k, v)| (k.clone(), *v)).collect::<BTreeMap<_, _>>();
                        (owner.clone(), keys)
                    })
                    .collect();
                (*dimension, ordered)
            })
            .collect();
        Ok(AggregateSnapshot { dimensions })
    }
}

fn merge_into(counts: &mut Counts, tally: &Tally) {
    for (owner, keys) in tally.counts() {
        let owner_counts = counts.entry(owner.clone()).or_default();
        for (sub_key, n) in keys {
            *owner_counts.entry(sub_key.clone()).or_insert(0) += n;
        }
    }
}

/// Read-only, sorted view of the aggregate for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    dimensions: BTreeMap<Dimension, BTreeMap<String, BTreeMap<String, u64>>>,
}

impl AggregateSnapshot {
    pub fn count(&self, dimension: Dimension, owner: &str, sub_key: &str) -> u64 {
        self.dimensions
            .get(&dimension)
            .and_then(|owners| owners.get(owner))
            .and_then(|keys| keys.get(sub_key))
            .copied()
            .unwrap_or(0)
    }

    /// `(owner, sub-key, count)` in sorted order.
    pub fn rows(&self, dimension: Dimension) -> Vec<(&str, &str, u64)> {
        self.dimensions
            .get(&dimension)
            .into_iter()
            .flatten()
            .flat_map(|(owner, keys)| keys.iter().map(move |(k, v)| (owner.as_str(), k.as_str(), *v)))
            .collect()
    }

    /// Sub-key totals summed across owners.
    pub fn sub_key_totals(&self, dimension: Dimension) -> BTreeMap<&str, u64> {
        let mut totals = BTreeMap::new();
        for (_, sub_key, count) in self.rows(dimension) {
            *totals.entry(sub_key).or_insert(0) += count;
        }
        totals
    }

    pub fn total(&self, dimension: Dimension) -> u64 {
        self.rows(dimension).iter().map(|(_, _, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.values().all(|owners| owners.is_empty())
    }
}
