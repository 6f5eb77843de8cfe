use crate::aggregate::GlobalAggregate;
use crate::alias::AliasTable;
use crate::artifact::{read_artifact, write_artifact, IdempotenceGate};
use crate::batcher::Batch;
use crate::failure_log::FailureLog;
use crate::geocode::ReverseGeocoder;
use crate::pipeline::RunStats;
use crate::record::{parse_record, Record};
use crate::tally::{accumulate_activity, accumulate_regions, BatchTallies, Tally};
use crate::TallyError;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Artifacts already existed; totals were re-read from them.
    Skipped,
    Processed { records: usize, geocode_failures: usize },
}

/// Everything a worker thread needs to take one batch to completion. Holds
/// only shared references, so one value is handed to every thread in the pool.
#[derive(Clone, Copy)]
pub struct BatchWorker<'a> {
    pub gate: &'a IdempotenceGate,
    pub aliases: &'a AliasTable,
    pub geocoder: &'a dyn ReverseGeocoder,
    pub failure_log: &'a FailureLog,
    pub aggregate: &'a GlobalAggregate,
    pub stats: &'a RunStats,
}

impl<'a> BatchWorker<'a> {
    pub fn process(&self, batch: &Batch) -> Result<BatchOutcome, TallyError> {
        if self.gate.is_complete(batch) {
            tracing::info!(batch = batch.sequence, lines = batch.len(), "skipping batch, artifacts already exist");
            self.rehydrate(batch)?;
            self.stats.batches_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(BatchOutcome::Skipped);
        }

        let records = decode_batch(batch, self.aliases)?;
        self.stats.records_decoded.fetch_add(records.len() as u64, Ordering::Relaxed);

        let (activity, regions) = rayon::join(
            || accumulate_activity(&records),
            || accumulate_regions(&records, self.geocoder),
        );
        let regions = regions?;
        let not_found = regions.not_found;

        let tallies = BatchTallies {
            activity,
            region: regions.region,
            country: regions.country,
        };
        for descriptor in self.gate.descriptors(batch) {
            let path = descriptor.path(self.gate.output_dir());
            let rows = tallies.get(descriptor.dimension).rows();
            write_artifact(&path, descriptor.dimension, &rows)?;
            self.stats.artifacts_written.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(batch = batch.sequence, rows = rows.len(), path = %path.display(), "artifact written");
        }

        // Only after every artifact is written: a failed batch leaves no log entries.
        // Record indices are line indices.
        let geocode_failures = self
            .failure_log
            .append(not_found.iter().map(|&i| batch.lines[i].as_slice()))?;
        if geocode_failures > 0 {
            self.stats.geocode_failures.fetch_add(geocode_failures as u64, Ordering::Relaxed);
            tracing::warn!(batch = batch.sequence, geocode_failures, "points outside every known region");
        }

        self.aggregate.merge_batch(&tallies)?;
        self.stats.batches_processed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(batch = batch.sequence, records = records.len(), "batch merged");

        Ok(BatchOutcome::Processed {
            records: records.len(),
            geocode_failures,
        })
    }

    fn rehydrate(&self, batch: &Batch) -> Result<(), TallyError> {
        let mut tallies = BatchTallies::default();
        for descriptor in self.gate.descriptors(batch) {
            let rows = read_artifact(&descriptor.path(self.gate.output_dir()))?;
            *tallies.get_mut(descriptor.dimension) = Tally::from_rows(&rows);
        }
        self.aggregate.merge_batch(&tallies)
    }
}

/// Decode and canonicalize every line. The first bad line fails the batch.
pub fn decode_batch(batch: &Batch, aliases: &AliasTable) -> Result<Vec<Record>, TallyError> {
    batch
        .lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            parse_record(line)
                .map(|record| record.canonicalize(aliases))
                .map_err(|e| e.at_line(i + 1))
        })
        .collect()
}
