//! Provenance log: which source files were ever merged.
//!
//! Line format, one per file: `source_dir,filename,row_count,ingestion_date,` (the trailing empty
//! field is kept for older readers). Entries are append-only; saving rewrites the file atomically
//! with the previous lines first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use churnguard_core::fsio;

use crate::error::IngestionError;
use crate::schema::{classify_csv_error, CsvFault};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRecord {
    pub source_dir: String,
    pub filename: String,
    pub row_count: u64,
    pub ingestion_date: String,
}

#[derive(Debug)]
pub struct ProvenanceLog {
    path: PathBuf,
    entries: Vec<IngestionRecord>,
    known: HashSet<String>,
}

impl ProvenanceLog {
    /// Read the log; a missing file is an empty log.
    pub fn load(path: &Path) -> Result<Self, IngestionError> {
        let mut log = Self { path: path.to_path_buf(), entries: Vec::new(), known: HashSet::new() };
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(source) => return Err(IngestionError::Io { path: path.to_path_buf(), source }),
        };
        let mut rdr = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(bytes.as_slice());
        for rec in rdr.records() {
            let rec = rec.map_err(|e| log_fault(path, e))?;
            let line = rec.position().map(|p| p.line()).unwrap_or(0);
            if rec.len() < 4 {
                return Err(IngestionError::Provenance { path: path.to_path_buf(), line, reason: format!("expected at least 4 fields, found {}", rec.len()) });
            }
            let row_count = rec[2].trim().parse::<u64>().map_err(|_| IngestionError::Provenance { path: path.to_path_buf(), line, reason: format!("row count {:?} is not a number", &rec[2]) })?;
            log.push(IngestionRecord { source_dir: rec[0].to_string(), filename: rec[1].to_string(), row_count, ingestion_date: rec[3].to_string() });
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn entries(&self) -> &[IngestionRecord] { &self.entries }
    pub fn contains(&self, filename: &str) -> bool { self.known.contains(filename) }

    /// Append records for files not already present. Returns how many were added.
    pub fn append_missing(&mut self, records: impl IntoIterator<Item = IngestionRecord>) -> usize {
        let before = self.entries.len();
        for r in records { if !self.contains(&r.filename) { self.push(r); } }
        self.entries.len() - before
    }

    pub fn save(&self) -> Result<(), IngestionError> {
        fsio::write_atomic(&self.path, &self.to_bytes()?).map_err(|source| IngestionError::Io { path: self.path.clone(), source })
    }

    fn to_bytes(&self) -> Result<Vec<u8>, IngestionError> {
        let mut wtr = csv::WriterBuilder::new().has_headers(false).flexible(true).terminator(csv::Terminator::Any(b'\n')).from_writer(Vec::new());
        for e in &self.entries {
            let count = e.row_count.to_string();
            wtr.write_record([e.source_dir.as_str(), e.filename.as_str(), count.as_str(), e.ingestion_date.as_str(), ""]).map_err(|err| log_fault(&self.path, err))?;
        }
        wtr.into_inner().map_err(|e| IngestionError::Io { path: self.path.clone(), source: e.into_error() })
    }

    fn push(&mut self, r: IngestionRecord) {
        self.known.insert(r.filename.clone());
        self.entries.push(r);
    }
}

fn log_fault(path: &Path, err: csv::Error) -> IngestionError {
    match classify_csv_error(err) {
        CsvFault::Io(source) => IngestionError::Io { path: path.to_path_buf(), source },
        CsvFault::Format(source) => IngestionError::Csv { path: path.to_path_buf(), source },
    }
}
