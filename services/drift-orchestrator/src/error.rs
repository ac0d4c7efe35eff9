//! Error types for the retrain pipeline.
//!
//! Each component owns a narrow error enum; the orchestrator folds them into [`StageError`] and
//! tags the failing stage in [`PipelineError`].

use std::io;
use std::path::PathBuf;

use churnguard_resilience::DeadlineError;
use thiserror::Error;

use crate::state::PipelineState;

/// Missing or invalid path roots and settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config source: {0}")]
    Source(#[from] churnguard_core::ConfigSourceError),
    #[error("path root `{key}` is not set")]
    EmptyRoot { key: &'static str },
    #[error("path root `{key}` ({}) does not exist", .path.display())]
    MissingRoot { key: &'static str, path: PathBuf },
    #[error("path root `{key}` ({}) is not a directory", .path.display())]
    NotADirectory { key: &'static str, path: PathBuf },
    #[error("cannot create `{key}` ({}): {source}", .path.display())]
    Prepare { key: &'static str, path: PathBuf, #[source] source: io::Error },
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Unreadable or schema-mismatched source files, and provenance log faults.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("io on {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("{}: header {found:?} does not match schema {expected:?}", .path.display())]
    Schema { path: PathBuf, expected: Vec<String>, found: Vec<String> },
    #[error("{}: {source}", .path.display())]
    Csv { path: PathBuf, #[source] source: csv::Error },
    #[error("{}: row {row} has label {value}, expected 0 or 1", .path.display())]
    InvalidLabel { path: PathBuf, row: u64, value: i64 },
    #[error("{}: file name {name:?} is not valid UTF-8", .dir.display())]
    FileName { dir: PathBuf, name: String },
    #[error("provenance log {} line {line}: {reason}", .path.display())]
    Provenance { path: PathBuf, line: u64, reason: String },
}

/// A labeled dataset that cannot be projected onto the feature/label columns.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io on {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("{}: {source}", .path.display())]
    Csv { path: PathBuf, #[source] source: csv::Error },
    #[error("{}: missing column `{column}`", .path.display())]
    MissingColumn { path: PathBuf, column: String },
    #[error("{}: row {row} column `{column}` has non-numeric value {value:?}", .path.display())]
    BadValue { path: PathBuf, row: u64, column: String, value: String },
    #[error("{}: row {row} has label {value:?}, expected 0 or 1", .path.display())]
    BadLabel { path: PathBuf, row: u64, value: String },
}

/// Corrupt or missing model artifacts, and prediction contract violations.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact {} not found", .path.display())]
    Missing { path: PathBuf },
    #[error("io on {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("model artifact {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("model artifact {} checksum mismatch expected={expected} got={actual}", .path.display())]
    ChecksumMismatch { path: PathBuf, expected: String, actual: String },
    #[error("model artifact {}: {source}", .path.display())]
    Decode { path: PathBuf, #[source] source: serde_json::Error },
    #[error("model encode: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("model expects features {expected:?}, got {found:?}")]
    FeatureMismatch { expected: Vec<String>, found: Vec<String> },
}

/// Schema mismatch between a dataset and the scoring contract, or an unreadable score artifact.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model returned {predicted} predictions for {expected} rows")]
    PredictionCount { expected: usize, predicted: usize },
    #[error("io on score artifact {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("score artifact {} holds {content:?}, not a decimal number", .path.display())]
    BadScore { path: PathBuf, content: String },
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("cannot fit a model on an empty dataset")]
    EmptyDataset,
    #[error("fit diverged: {0}")]
    Diverged(String),
}

/// Publish failures. Any variant raised before the commit rename leaves production untouched.
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("io on {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error("snapshot {} is incomplete: missing {missing}", .dir.display())]
    Incomplete { dir: PathBuf, missing: String },
    #[error("snapshot {} failed verification: {reason}", .dir.display())]
    Verification { dir: PathBuf, reason: String },
    #[error("manifest {}: {source}", .path.display())]
    Manifest { path: PathBuf, #[source] source: serde_json::Error },
    #[error("publish aborted at {phase}: {reason}")]
    Aborted { phase: String, reason: String },
    #[error("publish of snapshot {snapshot} cancelled before commit")]
    Cancelled { snapshot: String },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("run lock {} is held by {holder}", .path.display())]
    Held { path: PathBuf, holder: String },
    #[error("run lock {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
}

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error("no deployed snapshot to diagnose")]
    NoDeployment,
    #[error("dependency audit `{command}` failed: {reason}")]
    Audit { command: String, reason: String },
    #[error("io on {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("report encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Anything a single stage can fail with.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error(transparent)]
    Timeout(#[from] DeadlineError),
    #[error("stage abandoned at its deadline before committing")]
    Cancelled,
}

/// Terminal error of an orchestrator run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not start run: {0}")]
    Lock(#[from] LockError),
    #[error("stage {stage} failed: {source}")]
    Stage { stage: PipelineState, #[source] source: StageError },
}

impl PipelineError {
    pub fn stage(&self) -> Option<PipelineState> {
        match self { PipelineError::Stage { stage, .. } => Some(*stage), PipelineError::Lock(_) => None }
    }
}
