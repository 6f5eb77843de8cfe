use crate::throttle::ThrottleConfig;
use crate::TallyError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 500_000;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_MEMORY_FREE_FLOOR_MB: u64 = 4096;
pub const DEFAULT_FAILURE_LOG_NAME: &str = "geocode_failures.jsonl.gz";

/// Run configuration for one pipeline invocation
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `None` or `-` reads stdin.
    pub input_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub worker_count: usize,
    pub memory_free_floor_mb: u64,
    pub max_in_flight: usize,
    pub throttle_poll_interval: Duration,
    pub failure_log_name: String,
    /// Batches buffered between the reader thread and the dispatcher.
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: None,
            output_dir: PathBuf::from("."),
            batch_size: DEFAULT_BATCH_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            memory_free_floor_mb: DEFAULT_MEMORY_FREE_FLOOR_MB,
            max_in_flight: DEFAULT_WORKER_COUNT,
            throttle_poll_interval: Duration::from_secs(1),
            failure_log_name: DEFAULT_FAILURE_LOG_NAME.to_string(),
            queue_depth: 1,
        }
    }
}

impl PipelineConfig {
    /// Small-batch configuration for tests: no memory floor, fast polling.
    pub fn custom(output_dir: PathBuf, batch_size: usize, worker_count: usize) -> Self {
        Self {
            output_dir,
            batch_size,
            worker_count,
            max_in_flight: worker_count,
            memory_free_floor_mb: 0,
            throttle_poll_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TallyError> {
        if self.batch_size == 0 {
            return Err(TallyError::Config("batch_size must be greater than 0".to_string()));
        }
        if self.worker_count == 0 {
            return Err(TallyError::Config("worker_count must be greater than 0".to_string()));
        }
        if self.max_in_flight == 0 {
            return Err(TallyError::Config("max_in_flight must be greater than 0".to_string()));
        }
        if self.failure_log_name.is_empty() {
            return Err(TallyError::Config("failure_log_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn failure_log_path(&self) -> PathBuf {
        self.output_dir.join(&self.failure_log_name)
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_in_flight: self.max_in_flight,
            memory_free_floor_mb: self.memory_free_floor_mb,
            poll_interval: self.throttle_poll_interval,
        }
    }
}
