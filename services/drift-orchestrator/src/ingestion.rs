//! Ingestion merger: source shards -> one deduplicated dataset plus provenance entries.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use churnguard_core::{fsio, PIPELINE_METRICS};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::PipelineConfig;
use crate::error::IngestionError;
use crate::provenance::{IngestionRecord, ProvenanceLog};
use crate::schema::{classify_csv_error, ChurnRecord, CsvFault, DATASET_COLUMNS, SOURCE_EXTENSION};

/// Source file names with the expected extension, in lexicographic order.
pub fn list_source_files(source_dir: &Path) -> Result<Vec<String>, IngestionError> {
    let io_err = |source| IngestionError::Io { path: source_dir.to_path_buf(), source };
    let mut names = Vec::new();
    for entry in std::fs::read_dir(source_dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_file() { continue; }
        if path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXTENSION) { continue; }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => names.push(name.to_string()),
            None => return Err(IngestionError::FileName { dir: source_dir.to_path_buf(), name: entry.file_name().to_string_lossy().into_owned() }),
        }
    }
    names.sort();
    Ok(names)
}

/// Source files not yet present in the provenance log.
pub fn pending_files(source_dir: &Path, log: &ProvenanceLog) -> Result<Vec<String>, IngestionError> {
    Ok(list_source_files(source_dir)?.into_iter().filter(|f| !log.contains(f)).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub files: Vec<String>,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub new_log_entries: usize,
}

/// A rewritten dataset whose provenance entries are not yet in the log.
#[derive(Debug, Clone)]
pub struct StagedMerge {
    pub summary: MergeSummary,
    pub pending: Vec<IngestionRecord>,
}

#[derive(Debug, Clone)]
pub struct IngestionMerger {
    source_dir: PathBuf,
    dataset_path: PathBuf,
    log_path: PathBuf,
}

impl IngestionMerger {
    pub fn new(source_dir: impl Into<PathBuf>, dataset_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self { source_dir: source_dir.into(), dataset_path: dataset_path.into(), log_path: log_path.into() }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(cfg.input_dir.clone(), cfg.merged_dataset_path(), cfg.provenance_log_path())
    }

    pub fn dataset_path(&self) -> &Path { &self.dataset_path }

    /// Merge and record provenance in one go, with today's UTC date on new entries.
    pub fn merge(&self) -> Result<MergeSummary, IngestionError> {
        self.merge_at(&today())
    }

    pub fn merge_at(&self, ingestion_date: &str) -> Result<MergeSummary, IngestionError> {
        let staged = self.stage_at(ingestion_date)?;
        self.record(staged.pending)?;
        Ok(staged.summary)
    }

    pub fn stage(&self) -> Result<StagedMerge, IngestionError> {
        self.stage_at(&today())
    }

    /// Re-scan every source file and rewrite the dataset. The log is left alone; the returned
    /// entries go in through [`Self::record`] once the run no longer needs these files again.
    ///
    /// Rows keep directory-listing order; a row identical to an earlier one in every column is
    /// dropped. Re-staging unchanged sources produces a byte-identical dataset.
    #[instrument(skip(self), fields(source = %self.source_dir.display()))]
    pub fn stage_at(&self, ingestion_date: &str) -> Result<StagedMerge, IngestionError> {
        let files = list_source_files(&self.source_dir)?;
        let log = ProvenanceLog::load(&self.log_path)?;
        let source_dir = self.source_dir.display().to_string();
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut pending = Vec::new();
        let mut rows_read = 0u64;

        for name in &files {
            let rows = read_source(&self.source_dir.join(name))?;
            debug!(file = %name, rows = rows.len(), "source read");
            rows_read += rows.len() as u64;
            if !log.contains(name) {
                pending.push(IngestionRecord { source_dir: source_dir.clone(), filename: name.clone(), row_count: rows.len() as u64, ingestion_date: ingestion_date.to_string() });
            }
            for row in rows {
                if seen.insert(row.clone()) { merged.push(row); }
            }
        }

        fsio::write_atomic(&self.dataset_path, &encode_dataset(&self.dataset_path, &merged)?)
            .map_err(|source| IngestionError::Io { path: self.dataset_path.clone(), source })?;

        PIPELINE_METRICS.rows_ingested_total.add(rows_read, &[]);
        info!(files = files.len(), rows_read, rows_kept = merged.len(), pending = pending.len(), "ingestion merged");
        let summary = MergeSummary { files, rows_read, rows_kept: merged.len() as u64, new_log_entries: pending.len() };
        Ok(StagedMerge { summary, pending })
    }

    /// Append entries for files the log does not list yet. Returns how many were added.
    pub fn record(&self, pending: Vec<IngestionRecord>) -> Result<usize, IngestionError> {
        let mut log = ProvenanceLog::load(&self.log_path)?;
        let added = log.append_missing(pending);
        log.save()?;
        debug!(added, log = %self.log_path.display(), "provenance recorded");
        Ok(added)
    }
}

fn today() -> String { chrono::Utc::now().format("%Y%m%d").to_string() }

fn read_source(path: &Path) -> Result<Vec<ChurnRecord>, IngestionError> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path).map_err(|e| fault(path, e))?;
    let found: Vec<String> = rdr.headers().map_err(|e| fault(path, e))?.iter().map(str::to_string).collect();
    if found != DATASET_COLUMNS {
        return Err(IngestionError::Schema { path: path.to_path_buf(), expected: DATASET_COLUMNS.iter().map(|c| c.to_string()).collect(), found });
    }
    let mut rows = Vec::new();
    for (i, rec) in rdr.deserialize::<ChurnRecord>().enumerate() {
        let rec = rec.map_err(|e| fault(path, e))?;
        if rec.exited != 0 && rec.exited != 1 {
            return Err(IngestionError::InvalidLabel { path: path.to_path_buf(), row: i as u64 + 1, value: rec.exited });
        }
        rows.push(rec);
    }
    Ok(rows)
}

fn encode_dataset(path: &Path, rows: &[ChurnRecord]) -> Result<Vec<u8>, IngestionError> {
    let mut wtr = csv::WriterBuilder::new().has_headers(false).terminator(csv::Terminator::Any(b'\n')).from_writer(Vec::new());
    wtr.write_record(DATASET_COLUMNS).map_err(|e| fault(path, e))?;
    for row in rows { wtr.serialize(row).map_err(|e| fault(path, e))?; }
    wtr.into_inner().map_err(|e| IngestionError::Io { path: path.to_path_buf(), source: e.into_error() })
}

fn fault(path: &Path, err: csv::Error) -> IngestionError {
    match classify_csv_error(err) {
        CsvFault::Io(source) => IngestionError::Io { path: path.to_path_buf(), source },
        CsvFault::Format(source) => IngestionError::Csv { path: path.to_path_buf(), source },
    }
}
