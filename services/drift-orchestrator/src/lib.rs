//! Churn model drift monitor.
//!
//! Watches a source directory for new labeled shards, merges them into one deduplicated dataset,
//! re-scores the deployed model, and retrains plus atomically redeploys when the score moves.
//! [`orchestrator::DriftOrchestrator`] drives the stages; each component is usable on its own.

pub mod cli;
pub mod commands;
pub mod config;
pub mod deployment;
pub mod diagnostics;
pub mod error;
pub mod ingestion;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod provenance;
pub mod schema;
pub mod scoring;
pub mod state;
pub mod training;

pub use config::{DriftPolicy, PipelineConfig};
pub use error::{PipelineError, StageError};
pub use orchestrator::{DriftDecision, DriftOrchestrator, RunReport};
pub use state::PipelineState;
