pub mod aggregate;
pub mod alias;
pub mod artifact;
pub mod batcher;
pub mod config;
pub mod error;
pub mod failure_log;
pub mod geocode;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod summary;
pub mod tally;
pub mod throttle;
pub mod worker;

pub use error::*;
pub use logging::init_tracing;
