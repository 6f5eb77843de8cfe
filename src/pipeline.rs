use crate::aggregate::{AggregateSnapshot, GlobalAggregate};
use crate::alias::AliasTable;
use crate::artifact::{consolidate, Dimension, IdempotenceGate};
use crate::batcher::{feed, Batch, LineBatcher};
use crate::config::PipelineConfig;
use crate::failure_log::FailureLog;
use crate::geocode::ReverseGeocoder;
use crate::throttle::ResourceThrottle;
use crate::worker::BatchWorker;
use crate::TallyError;
use crossbeam_channel::{bounded, Receiver};
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Dispatching,
    Draining,
    Done,
}

impl DispatchState {
    fn advance(self, next: DispatchState) -> DispatchState {
        tracing::debug!(from = ?self, to = ?next, "dispatcher state");
        next
    }
}

/// Process-wide counters, bumped by the dispatcher and every worker.
#[derive(Debug, Default)]
pub struct RunStats {
    pub batches_emitted: AtomicU64,
    pub batches_skipped: AtomicU64,
    pub batches_processed: AtomicU64,
    pub records_decoded: AtomicU64,
    pub geocode_failures: AtomicU64,
    pub artifacts_written: AtomicU64,
}

impl RunStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_emitted: self.batches_emitted.load(Ordering::SeqCst),
            batches_skipped: self.batches_skipped.load(Ordering::SeqCst),
            batches_processed: self.batches_processed.load(Ordering::SeqCst),
            records_decoded: self.records_decoded.load(Ordering::SeqCst),
            geocode_failures: self.geocode_failures.load(Ordering::SeqCst),
            artifacts_written: self.artifacts_written.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches_emitted: u64,
    pub batches_skipped: u64,
    pub batches_processed: u64,
    pub records_decoded: u64,
    pub geocode_failures: u64,
    pub artifacts_written: u64,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub aggregate: AggregateSnapshot,
}

/// Run the whole pipeline over `input` with a throttle that reads system memory.
pub fn run_pipeline<R: BufRead + Send>(
    config: &PipelineConfig,
    input: R,
    aliases: &AliasTable,
    geocoder: &dyn ReverseGeocoder,
) -> Result<RunSummary, TallyError> {
    let throttle = ResourceThrottle::new(config.throttle());
    run_pipeline_with_throttle(config, input, aliases, geocoder, &throttle)
}

/// Batch `input`, fan batches out to `config.worker_count` threads, and wait
/// for every dispatched batch to finish. The first error from the reader or
/// any worker stops dispatch and is returned once the pool has drained.
pub fn run_pipeline_with_throttle<R: BufRead + Send>(
    config: &PipelineConfig,
    input: R,
    aliases: &AliasTable,
    geocoder: &dyn ReverseGeocoder,
    throttle: &ResourceThrottle,
) -> Result<RunSummary, TallyError> {
    config.validate()?;
    fs::create_dir_all(&config.output_dir)?;
    let started = Instant::now();

    let gate = IdempotenceGate::new(&config.output_dir, &Dimension::ALL);
    let failure_log = FailureLog::new(config.failure_log_path());
    let aggregate = GlobalAggregate::new();
    let stats = RunStats::default();
    let worker = BatchWorker {
        gate: &gate,
        aliases,
        geocoder,
        failure_log: &failure_log,
        aggregate: &aggregate,
        stats: &stats,
    };

    let abort = AtomicBool::new(false);
    let in_flight = AtomicUsize::new(0);
    let first_error: Mutex<Option<TallyError>> = Mutex::new(None);

    let (batch_tx, batch_rx) = bounded::<Result<Batch, TallyError>>(config.queue_depth);
    // Rendezvous: a send completes only when a worker takes the batch.
    let (job_tx, job_rx) = bounded::<Batch>(0);
    let batcher = LineBatcher::new(input, config.batch_size);

    tracing::info!(
        output_dir = %config.output_dir.display(),
        batch_size = config.batch_size,
        workers = config.worker_count,
        "starting pipeline"
    );

    thread::scope(|s| {
        s.spawn(move || feed(batcher, batch_tx));

        let mut handles = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let jobs = job_rx.clone();
            let (worker, abort, in_flight, first_error) = (&worker, &abort, &in_flight, &first_error);
            handles.push(s.spawn(move || worker_loop(id, worker, jobs, abort, in_flight, first_error)));
        }
        drop(job_rx);

        let mut state = DispatchState::Idle;
        for item in batch_rx.iter() {
            if abort.load(Ordering::SeqCst) {
                break;
            }
            let batch = match item {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "input read failed");
                    record_error(&first_error, e);
                    abort.store(true, Ordering::SeqCst);
                    break;
                }
            };
            if state == DispatchState::Idle {
                state = state.advance(DispatchState::Dispatching);
            }
            stats.batches_emitted.fetch_add(1, Ordering::SeqCst);

            throttle.wait_for_capacity(&in_flight, &abort);
            if abort.load(Ordering::SeqCst) {
                break;
            }
            in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(unsent) = job_tx.send(batch) {
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(batch = unsent.0.sequence, "no workers left to take batch");
                break;
            }
        }

        state = state.advance(DispatchState::Draining);
        tracing::info!(in_flight = in_flight.load(Ordering::SeqCst), "input exhausted, draining workers");
        drop(job_tx);
        drop(batch_rx);

        for handle in handles {
            if handle.join().is_err() {
                record_error(&first_error, TallyError::Worker("worker thread panicked".to_string()));
            }
        }
        state.advance(DispatchState::Done);
    });

    if let Some(e) = first_error.into_inner().map_err(|_| TallyError::Worker("error slot poisoned".to_string()))? {
        tracing::error!(error = %e, "pipeline aborted");
        return Err(e);
    }

    let stats = stats.snapshot();
    tracing::info!(
        batches = stats.batches_emitted,
        processed = stats.batches_processed,
        skipped = stats.batches_skipped,
        records = stats.records_decoded,
        geocode_failures = stats.geocode_failures,
        artifacts = stats.artifacts_written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "pipeline done"
    );
    Ok(RunSummary {
        stats,
        aggregate: aggregate.snapshot()?,
    })
}

/// Combine per-batch artifacts into one file per dimension. Returns the
/// combined files that were written this call.
pub fn consolidate_outputs(output_dir: &Path) -> Result<Vec<PathBuf>, TallyError> {
    let mut written = Vec::new();
    for dimension in Dimension::ALL {
        if let Some(path) = consolidate(output_dir, dimension)? {
            written.push(path);
        }
    }
    Ok(written)
}

/// Decrements the in-flight count even if the batch panics.
struct InFlightGuard<'a> {
    in_flight: &'a AtomicUsize,
    abort: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if thread::panicking() {
            self.abort.store(true, Ordering::SeqCst);
        }
    }
}

fn worker_loop(
    id: usize,
    worker: &BatchWorker<'_>,
    jobs: Receiver<Batch>,
    abort: &AtomicBool,
    in_flight: &AtomicUsize,
    first_error: &Mutex<Option<TallyError>>,
) {
    for batch in jobs.iter() {
        let _guard = InFlightGuard { in_flight, abort };
        if abort.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(e) = worker.process(&batch) {
            tracing::error!(worker = id, batch = batch.sequence, error = %e, "batch failed");
            abort.store(true, Ordering::SeqCst);
            record_error(first_error, e);
        }
    }
    tracing::debug!(worker = id, "worker exiting");
}

/// Keep the first error only.
fn record_error(slot: &Mutex<Option<TallyError>>, error: TallyError) {
    if let Ok(mut slot) = slot.lock() {
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{GeocodeError, Place};
    use crate::throttle::MemoryProbe;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    struct OneCountry;

    impl ReverseGeocoder for OneCountry {
        fn reverse_geocode(&self, lon: f64, _lat: f64) -> Result<Place, GeocodeError> {
            if lon >= 1000.0 {
                return Err(GeocodeError::Failed("no index".to_string()));
            }
            Ok(Place {
                region: Some("Central".to_string()),
                country: Some("Testland".to_string()),
            })
        }
    }

    struct PlentyOfMemory;

    impl MemoryProbe for PlentyOfMemory {
        fn available_mb(&self) -> Option<u64> {
            Some(u64::MAX)
        }
    }

    /// Slow lookups that record how many run at once. A batch's geographic
    /// pass is sequential, so concurrent lookups are concurrent batches.
    #[derive(Default)]
    struct CountingGeocoder {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ReverseGeocoder for CountingGeocoder {
        fn reverse_geocode(&self, lon: f64, lat: f64) -> Result<Place, GeocodeError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.current.fetch_sub(1, Ordering::SeqCst);
            OneCountry.reverse_geocode(lon, lat)
        }
    }

    /// Below any floor for the first `low_readings` calls, then plenty.
    struct RecoveringMemory {
        calls: Arc<AtomicUsize>,
        low_readings: usize,
    }

    impl MemoryProbe for RecoveringMemory {
        fn available_mb(&self) -> Option<u64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.low_readings {
                Some(0)
            } else {
                Some(u64::MAX)
            }
        }
    }

    fn input(n: usize) -> Cursor<Vec<u8>> {
        let mut text = String::new();
        for i in 0..n {
            text.push_str(&format!(
                r#"{{"type":"Feature","geometry":{{"type":"Point","coordinates":[1.0,2.0]}},"properties":{{"Name":"user{}","Activity":"run","Time":"2020-01-01T00:00:00Z"}}}}"#,
                i % 3
            ));
            text.push('\n');
        }
        Cursor::new(text.into_bytes())
    }

    fn run(config: &PipelineConfig, data: Cursor<Vec<u8>>) -> Result<RunSummary, TallyError> {
        let throttle = ResourceThrottle::with_probe(config.throttle(), Box::new(PlentyOfMemory));
        run_pipeline_with_throttle(config, data, &AliasTable::new(), &OneCountry, &throttle)
    }

    #[test]
    fn test_every_batch_is_processed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 4, 3);

        let summary = run(&config, input(10)).unwrap();
        assert_eq!(summary.stats.batches_emitted, 3);
        assert_eq!(summary.stats.batches_processed, 3);
        assert_eq!(summary.stats.records_decoded, 10);
        assert_eq!(summary.stats.artifacts_written, 9);
        assert_eq!(summary.aggregate.total(Dimension::Activity), 10);
        assert!(temp_dir.path().join("batch.3.size.2_activity_count.csv").exists());
    }

    #[test]
    fn test_empty_input_is_done_with_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 4, 2);
        let summary = run(&config, input(0)).unwrap();
        assert_eq!(summary.stats, StatsSnapshot::default());
        assert!(summary.aggregate.is_empty());
    }

    #[test]
    fn test_single_worker_single_in_flight() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 1, 1);
        config.max_in_flight = 1;
        let summary = run(&config, input(5)).unwrap();
        assert_eq!(summary.stats.batches_processed, 5);
    }

    #[test]
    fn test_concurrent_batches_never_exceed_max_in_flight() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 1, 4);
        config.max_in_flight = 2;
        let throttle = ResourceThrottle::with_probe(config.throttle(), Box::new(PlentyOfMemory));
        let geocoder = CountingGeocoder::default();

        let summary = run_pipeline_with_throttle(&config, input(12), &AliasTable::new(), &geocoder, &throttle).unwrap();
        assert_eq!(summary.stats.batches_processed, 12);
        let peak = geocoder.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
    }

    #[test]
    fn test_dispatch_resumes_when_memory_recovers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 2, 2);
        config.memory_free_floor_mb = 64;
        let calls = Arc::new(AtomicUsize::new(0));
        let memory = RecoveringMemory {
            calls: Arc::clone(&calls),
            low_readings: 3,
        };
        let throttle = ResourceThrottle::with_probe(config.throttle(), Box::new(memory));

        let summary = run_pipeline_with_throttle(&config, input(7), &AliasTable::new(), &OneCountry, &throttle).unwrap();
        assert_eq!(summary.stats.batches_emitted, 4);
        assert_eq!(summary.stats.batches_processed, 4);
        assert_eq!(summary.aggregate.total(Dimension::Activity), 7);
        assert!(calls.load(Ordering::SeqCst) > 3);
    }

    #[test]
    fn test_unexpected_geocode_error_aborts() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 2, 2);
        let mut data = input(4).into_inner();
        data.extend_from_slice(
            br#"{"type":"Feature","geometry":{"type":"Point","coordinates":[5000.0,2.0]},"properties":{"Name":"x"}}"#,
        );
        let err = run(&config, Cursor::new(data)).unwrap_err();
        assert!(matches!(err, TallyError::Geocode(_)));
        assert!(!temp_dir.path().join("batch.3.size.1_activity_count.csv").exists());
    }

    #[test]
    fn test_malformed_line_aborts() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 2, 2);
        let mut data = input(4).into_inner();
        data.extend_from_slice(b"not json at all\n");
        let err = run(&config, Cursor::new(data)).unwrap_err();
        assert!(matches!(err, TallyError::Decode { line: 1, .. }));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 0, 2);
        assert!(matches!(run(&config, input(1)), Err(TallyError::Config(_))));
    }

    #[test]
    fn test_consolidate_outputs_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::custom(temp_dir.path().to_path_buf(), 4, 2);
        run(&config, input(10)).unwrap();

        let written = consolidate_outputs(temp_dir.path()).unwrap();
        assert_eq!(written.len(), 3);
        assert!(temp_dir.path().join("activity_count_combined.csv").exists());
        assert!(consolidate_outputs(temp_dir.path()).unwrap().is_empty());
    }
}
