use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error on line {line}: {reason}")]
    Decode { line: usize, reason: String },
    #[error("Timestamp error: {0}")]
    Timestamp(String),
    #[error("Geocode error: {0}")]
    Geocode(String),
    #[error("Artifact write error at {path}: {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Artifact read error: {0}")]
    ArtifactRead(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Alias error: {0}")]
    Alias(#[from] regex::Error),
    #[error("Worker error: {0}")]
    Worker(String),
    #[error("Error: {0}")]
    Other(String),
}

impl From<csv::Error> for TallyError {
    fn from(err: csv::Error) -> Self {
        TallyError::ArtifactRead(err.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Config(err.to_string())
    }
}

impl From<String> for TallyError {
    fn from(err: String) -> Self {
        TallyError::Other(err)
    }
}

impl From<&str> for TallyError {
    fn from(err: &str) -> Self {
        TallyError::Other(err.to_string())
    }
}

impl TallyError {
    /// Attach the 1-based line number within the batch to a decode failure.
    pub fn at_line(self, line: usize) -> Self {
        match self {
            TallyError::Decode { reason, .. } => TallyError::Decode { line, reason },
            TallyError::Timestamp(reason) => TallyError::Decode { line, reason },
            other => other,
        }
    }
}
