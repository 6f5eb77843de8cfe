use crate::batcher::Batch;
use crate::tally::TallyRow;
use crate::TallyError;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Activity,
    Region,
    Country,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Activity, Dimension::Region, Dimension::Country];

    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Activity => "activity",
            Dimension::Region => "region",
            Dimension::Country => "country",
        }
    }

    /// First column of the artifact header.
    pub fn header(&self) -> &'static str {
        match self {
            Dimension::Activity => "Activity",
            Dimension::Region => "Region",
            Dimension::Country => "Country",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.name() == name)
    }

    pub fn combined_file_name(&self) -> String {
        format!("{}_count_combined.csv", self.name())
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Names the artifact for one `(batch, dimension)` pair. The path is a pure
/// function of these fields, which is what makes batches skippable on rerun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub sequence: u64,
    pub batch_size: usize,
    pub dimension: Dimension,
}

impl ArtifactDescriptor {
    pub fn for_batch(batch: &Batch, dimension: Dimension) -> Self {
        Self {
            sequence: batch.sequence,
            batch_size: batch.len(),
            dimension,
        }
    }

    pub fn file_name(&self) -> String {
        format!("batch.{}.size.{}_{}_count.csv", self.sequence, self.batch_size, self.dimension.name())
    }

    pub fn path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(self.file_name())
    }

    /// Inverse of [`ArtifactDescriptor::file_name`].
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_prefix("batch.")?.strip_suffix("_count.csv")?;
        let (numbers, dimension) = stem.rsplit_once('_')?;
        let (sequence, batch_size) = numbers.split_once(".size.")?;
        Some(Self {
            sequence: sequence.parse().ok()?,
            batch_size: batch_size.parse().ok()?,
            dimension: Dimension::from_name(dimension)?,
        })
    }
}

/// Skips batches whose artifacts already exist for every tracked dimension.
#[derive(Debug, Clone)]
pub struct IdempotenceGate {
    output_dir: PathBuf,
    dimensions: Vec<Dimension>,
}

impl IdempotenceGate {
    pub fn new(output_dir: impl Into<PathBuf>, dimensions: &[Dimension]) -> Self {
        Self {
            output_dir: output_dir.into(),
            dimensions: dimensions.to_vec(),
        }
    }

    pub fn descriptors(&self, batch: &Batch) -> Vec<ArtifactDescriptor> {
        self.dimensions
            .iter()
            .map(|d| ArtifactDescriptor::for_batch(batch, *d))
            .collect()
    }

    pub fn is_complete(&self, batch: &Batch) -> bool {
        self.descriptors(batch)
            .iter()
            .all(|d| d.path(&self.output_dir).is_file())
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(DATE_FORMAT).to_string()).unwrap_or_default()
}

/// Write rows as CSV with header `<Dimension>,Name,date,counts`. The file
/// appears at `path` only once fully written.
pub fn write_artifact(path: &Path, dimension: Dimension, rows: &[TallyRow]) -> Result<(), TallyError> {
    let temp_path = path.with_extension("csv.tmp");
    let write_error = |source: io::Error| TallyError::ArtifactWrite {
        path: path.to_path_buf(),
        source,
    };

    let write = || -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(&temp_path)?;
        writer.write_record([dimension.header(), "Name", "date", "counts"])?;
        for row in rows {
            writer.write_record([
                row.sub_key.as_str(),
                row.owner.as_str(),
                format_date(row.date).as_str(),
                row.count.to_string().as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    };

    if let Err(e) = write() {
        let _ = fs::remove_file(&temp_path);
        return Err(write_error(e.into()));
    }
    fs::rename(&temp_path, path).map_err(write_error)?;
    Ok(())
}

pub fn read_artifact(path: &Path) -> Result<Vec<TallyRow>, TallyError> {
    let read_error = |reason: String| TallyError::ArtifactRead(format!("{}: {}", path.display(), reason));

    let mut reader = csv::Reader::from_path(path).map_err(|e| read_error(e.to_string()))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| read_error(e.to_string()))?;
        if record.len() != 4 {
            return Err(read_error(format!("expected 4 fields, found {}", record.len())));
        }
        let date = match &record[2] {
            "" => None,
            text => Some(NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|e| read_error(e.to_string()))?),
        };
        let count = record[3].parse::<u64>().map_err(|e| read_error(e.to_string()))?;
        rows.push(TallyRow {
            sub_key: record[0].to_string(),
            owner: record[1].to_string(),
            date,
            count,
        });
    }
    Ok(rows)
}

/// Per-batch artifacts of one dimension in `output_dir`, in batch order.
pub fn list_artifacts(output_dir: &Path, dimension: Dimension) -> Result<Vec<(ArtifactDescriptor, PathBuf)>, TallyError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(descriptor) = name.to_str().and_then(ArtifactDescriptor::parse) {
            if descriptor.dimension == dimension {
                found.push((descriptor, entry.path()));
            }
        }
    }
    found.sort_by_key(|(d, _)| d.sequence);
    Ok(found)
}

/// Combine every per-batch artifact of `dimension` into one file, summing
/// counts per `(sub-key, owner)` and keeping the latest date. Returns `None`
/// when the combined file already exists.
pub fn consolidate(output_dir: &Path, dimension: Dimension) -> Result<Option<PathBuf>, TallyError> {
    let combined_path = output_dir.join(dimension.combined_file_name());
    if combined_path.exists() {
        tracing::info!(path = %combined_path.display(), "combined file exists, skipping");
        return Ok(None);
    }

    let artifacts = list_artifacts(output_dir, dimension)?;
    let mut combined: BTreeMap<(String, String), (u64, Option<NaiveDate>)> = BTreeMap::new();
    for (_, path) in &artifacts {
        for row in read_artifact(path)? {
            let entry = combined.entry((row.owner, row.sub_key)).or_insert((0, None));
            entry.0 += row.count;
            entry.1 = entry.1.max(row.date);
        }
    }

    let rows: Vec<TallyRow> = combined
        .into_iter()
        .map(|((owner, sub_key), (count, date))| TallyRow { sub_key, owner, date, count })
        .collect();
    write_artifact(&combined_path, dimension, &rows)?;
    tracing::info!(
        dimension = %dimension,
        batches = artifacts.len(),
        rows = rows.len(),
        path = %combined_path.display(),
        "consolidated artifacts"
    );
    Ok(Some(combined_path))
}
