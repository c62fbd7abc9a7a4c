//! CSV-backed store: one file per symbol and granularity
//!
//! Layout: `{root}/{SYMBOL}_{granularity}.csv` with a header row and one bar
//! per line, oldest first. A sibling `.lock` file carries an advisory
//! `fd-lock` so several processes can share a cache directory.
//!
//! Merges that only extend the tail append to the existing file. Anything
//! else rewrites the file through a temporary file in the same directory that
//! is then renamed over the original, so readers always see a complete file.

use super::{
    coverage_runs, merge_rows, slice_range, LocalStore, MergeOutcome, StoreError, StoreResult,
};
use crate::{Bar, Granularity, TimeRange};
use async_trait::async_trait;
use csv::{ReaderBuilder, WriterBuilder};
use fd_lock::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const DEFAULT_BUFFER_SIZE: usize = 8192; // 8KB buffer

/// On-disk row
#[derive(Debug, Serialize, Deserialize)]
struct BarRecord {
    timestamp: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

impl From<&Bar> for BarRecord {
    fn from(bar: &Bar) -> Self {
        Self {
            timestamp: bar.timestamp,
            open: bar.open.to_string(),
            high: bar.high.to_string(),
            low: bar.low.to_string(),
            close: bar.close.to_string(),
            volume: bar.volume.to_string(),
        }
    }
}

impl TryFrom<BarRecord> for Bar {
    type Error = String;

    fn try_from(record: BarRecord) -> Result<Self, Self::Error> {
        let parse = |field: &str, value: &str| {
            Decimal::from_str(value).map_err(|e| format!("{field} {value:?}: {e}"))
        };
        Ok(Bar {
            timestamp: record.timestamp,
            open: parse("open", &record.open)?,
            high: parse("high", &record.high)?,
            low: parse("low", &record.low)?,
            close: parse("close", &record.close)?,
            volume: parse("volume", &record.volume)?,
        })
    }
}

/// Store keeping each series in its own CSV file
#[derive(Debug, Clone)]
pub struct CsvStore {
    root: PathBuf,
}

impl CsvStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding a series
    pub fn path_for(&self, symbol: &str, granularity: Granularity) -> StoreResult<PathBuf> {
        let safe = filesystem_safe_symbol(symbol)?;
        Ok(self.root.join(format!("{safe}_{granularity}.csv")))
    }

    async fn blocking<T, F>(f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StoreResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::TaskError(e.to_string()))?
    }
}

/// Map a symbol to a file-name component
fn filesystem_safe_symbol(symbol: &str) -> StoreResult<String> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return Err(StoreError::InvalidSymbol(symbol.to_string()));
    }
    Ok(trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect())
}

fn open_lock_file(path: &Path) -> StoreResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path.with_extension("lock"))
        .map_err(|e| StoreError::LockError(format!("Failed to open lock file: {e}")))
}

/// Read a whole series file. A missing file is an empty series.
fn load_series(path: &Path) -> StoreResult<Vec<Bar>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::IoError(format!("Failed to open {}: {e}", path.display()))),
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, file));

    let mut bars = Vec::new();
    for (index, record) in reader.deserialize::<BarRecord>().enumerate() {
        let line = index as u64 + 2;
        let record = record.map_err(|e| StoreError::CorruptRow {
            path: path.display().to_string(),
            line,
            message: e.to_string(),
        })?;
        let bar = Bar::try_from(record).map_err(|message| StoreError::CorruptRow {
            path: path.display().to_string(),
            line,
            message,
        })?;
        bars.push(bar);
    }
    Ok(bars)
}

fn append_rows(path: &Path, rows: &[Bar]) -> StoreResult<()> {
    let file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| StoreError::IoError(format!("Failed to open for append: {e}")))?;

    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, file));
    for bar in rows {
        writer
            .serialize(BarRecord::from(bar))
            .map_err(|e| StoreError::CsvError(format!("Failed to write bar: {e}")))?;
    }

    let buf_writer = writer
        .into_inner()
        .map_err(|e| StoreError::IoError(format!("Failed to flush rows: {e}")))?;
    let file = buf_writer
        .into_inner()
        .map_err(|e| StoreError::IoError(format!("Failed to get file handle: {e}")))?;
    file.sync_all()
        .map_err(|e| StoreError::IoError(format!("Failed to sync file: {e}")))
}

fn rewrite_series(path: &Path, bars: &[Bar]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::IoError(format!("{} has no parent", path.display())))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::IoError(format!("Failed to create temp file: {e}")))?;

    {
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_writer(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, temp_file.as_file_mut()));
        for bar in bars {
            writer
                .serialize(BarRecord::from(bar))
                .map_err(|e| StoreError::CsvError(format!("Failed to write bar: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| StoreError::IoError(format!("Failed to flush temp file: {e}")))?;
    }

    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| StoreError::IoError(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| StoreError::IoError(format!("Failed to persist temp file: {e}")))?;

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn merge_file(path: &Path, rows: Vec<Bar>) -> StoreResult<MergeOutcome> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::IoError(format!("Failed to create directory: {e}")))?;
    }

    let mut lock = RwLock::new(open_lock_file(path)?);
    let _guard = lock
        .write()
        .map_err(|e| StoreError::LockError(format!("Failed to acquire write lock: {e}")))?;

    let mut series = load_series(path)?;
    let previous_len = series.len();
    let outcome = merge_rows(&mut series, rows);

    if !outcome.changed() {
        debug!(path = %path.display(), "Merge was a no-op");
        return Ok(outcome);
    }

    if outcome.appended && previous_len > 0 {
        append_rows(path, &series[previous_len..])?;
        debug!(
            path = %path.display(),
            appended = outcome.inserted,
            "Appended rows to cache file"
        );
    } else {
        rewrite_series(path, &series)?;
        info!(
            path = %path.display(),
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            total = series.len(),
            "Rewrote cache file"
        );
    }
    Ok(outcome)
}

fn read_file(path: &Path) -> StoreResult<Vec<Bar>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let lock = RwLock::new(open_lock_file(path)?);
    let _guard = lock
        .read()
        .map_err(|e| StoreError::LockError(format!("Failed to acquire read lock: {e}")))?;
    load_series(path)
}

#[async_trait]
impl LocalStore for CsvStore {
    async fn read(
        &self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> StoreResult<Vec<Bar>> {
        let path = self.path_for(symbol, granularity)?;
        Self::blocking(move || {
            let bars = read_file(&path)?;
            Ok(slice_range(&bars, range).to_vec())
        })
        .await
    }

    async fn merge(
        &self,
        symbol: &str,
        granularity: Granularity,
        rows: Vec<Bar>,
    ) -> StoreResult<MergeOutcome> {
        let path = self.path_for(symbol, granularity)?;
        Self::blocking(move || merge_file(&path, rows)).await
    }

    async fn coverage(
        &self,
        symbol: &str,
        granularity: Granularity,
    ) -> StoreResult<Vec<TimeRange>> {
        let path = self.path_for(symbol, granularity)?;
        Self::blocking(move || {
            let bars = read_file(&path)?;
            Ok(coverage_runs(&bars, granularity))
        })
        .await
    }
}
