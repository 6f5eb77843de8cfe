use crate::TallyError;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only gzip file of raw records that failed geocoding with a
/// not-found outcome. Each append writes one gzip member, so concurrent
/// workers serialize on the lock and the file stays a valid multi-member
/// stream.
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<'a>(&self, lines: impl IntoIterator<Item = &'a [u8]>) -> Result<usize, TallyError> {
        let mut lines = lines.into_iter().peekable();
        if lines.peek().is_none() {
            return Ok(0);
        }

        let _guard = self.lock.lock().map_err(|_| TallyError::Worker("failure log lock poisoned".to_string()))?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        let mut written = 0;
        for line in lines {
            encoder.write_all(line)?;
            encoder.write_all(b"\n")?;
            written += 1;
        }
        encoder.finish()?.sync_data()?;
        Ok(written)
    }
}

/// Every line in a failure log, across all members.
pub fn read_failure_log(path: &Path) -> Result<Vec<Vec<u8>>, TallyError> {
    let reader = BufReader::new(MultiGzDecoder::new(File::open(path)?));
    let mut lines = Vec::new();
    for line in reader.split(b'\n') {
        lines.push(line?);
    }
    Ok(lines)
}
