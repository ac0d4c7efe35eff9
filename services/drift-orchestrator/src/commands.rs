//! Subcommand handlers. Writers take the run lock; every body runs under the stage deadline.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use churnguard_resilience::{with_cancellable_deadline, with_deadline, StageToken};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::cli::{Commands, OutputFormat};
use crate::config::PipelineConfig;
use crate::deployment::{deploy_latest, DeploymentSynchronizer};
use crate::diagnostics::{self, audit_from_config, DiagnosticsReporter, FileReporter};
use crate::error::DiagnosticsError;
use crate::ingestion::{pending_files, IngestionMerger};
use crate::lock::{LeaseRecord, RunLock};
use crate::orchestrator::DriftOrchestrator;
use crate::provenance::ProvenanceLog;
use crate::scoring::score_model;
use crate::training::{train_and_save, LogisticRegressionTrainer};

pub async fn dispatch(command: Commands, cfg: Arc<PipelineConfig>, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Run => {
            let report = DriftOrchestrator::new(cfg).run().await?;
            emit(format, &report)
        }
        Commands::Ingest => {
            let summary = exclusive(cfg, "INGEST", |cfg, _| IngestionMerger::from_config(cfg).merge()).await?;
            emit(format, &summary)
        }
        Commands::Train => {
            exclusive(cfg.clone(), "RETRAIN", |cfg, _| train_and_save(cfg, &LogisticRegressionTrainer::default())).await?;
            emit(format, &serde_json::json!({ "model": cfg.model_path() }))
        }
        Commands::Score => {
            let score = exclusive(cfg.clone(), "SCORE", |cfg, _| score_model(cfg)).await?;
            emit(format, &serde_json::json!({ "score": score, "path": cfg.score_path() }))
        }
        Commands::Deploy => {
            let snapshot = exclusive(cfg, "REDEPLOY", deploy_latest).await?;
            emit(format, &snapshot.manifest)
        }
        Commands::Diagnose => {
            let report = exclusive(cfg, "DIAGNOSE", |cfg, _| {
                let snapshot = DeploymentSynchronizer::from_config(cfg).current()?.ok_or(DiagnosticsError::NoDeployment)?;
                let report = diagnostics::collect(cfg, &snapshot, &[], audit_from_config(cfg).as_ref())?;
                FileReporter::new(cfg.model_dir.clone()).publish(&report)?;
                Ok::<_, DiagnosticsError>(report)
            }).await?;
            emit(format, &report)
        }
        Commands::Status => {
            let deadline = cfg.stage_deadline();
            let status = with_deadline("STATUS", deadline, move || collect_status(&cfg)).await??;
            emit(format, &status)
        }
    }
}

/// Run `work` on the blocking pool while holding the run lock. The lock goes with the body, so it
/// is only released once the body returns, deadline or not.
async fn exclusive<T, E, F>(cfg: Arc<PipelineConfig>, stage: &'static str, work: F) -> Result<T>
where
    F: FnOnce(&PipelineConfig, &StageToken) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let run_id = Uuid::new_v4();
    let lock = RunLock::acquire(&cfg.lock_path(), cfg.lock_lease(), run_id)?;
    info!(stage, %run_id, "command started");
    let deadline = cfg.stage_deadline();
    let out = with_cancellable_deadline(stage, deadline, move |token| {
        let _lock = lock;
        work(&cfg, token)
    }).await??;
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub pending_files: Vec<String>,
    pub ingested_files: usize,
    pub deployed_snapshot: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub deployed_score: Option<f64>,
    pub lock_holder: Option<LeaseRecord>,
}

pub fn collect_status(cfg: &PipelineConfig) -> Result<PipelineStatus> {
    let log = ProvenanceLog::load(&cfg.provenance_log_path())?;
    let pending = pending_files(&cfg.input_dir, &log)?;
    let snapshot = DeploymentSynchronizer::from_config(cfg).current()?;
    let deployed_score = snapshot.as_ref().map(|s| s.score()).transpose().context("reading deployed score")?;
    Ok(PipelineStatus {
        pending_files: pending,
        ingested_files: log.entries().len(),
        deployed_snapshot: snapshot.as_ref().map(|s| s.id.clone()),
        deployed_at: snapshot.as_ref().map(|s| s.manifest.created_at),
        deployed_score,
        lock_holder: RunLock::inspect(&cfg.lock_path())?,
    })
}

fn emit<T: Serialize>(format: OutputFormat, value: &T) -> Result<()> {
    let out = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Text => serde_yaml::to_string(value)?,
    };
    println!("{}", out.trim_end());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_of_a_fresh_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        std::fs::write(dir.path().join("in/a.csv"), "corporation,lastmonth_activity,lastyear_activity,number_of_employees,exited\n").unwrap();
        let cfg = PipelineConfig::from_roots(dir.path().join("in"), dir.path().join("out"), dir.path().join("test"), dir.path().join("models"), dir.path().join("prod"));
        let status = collect_status(&cfg).unwrap();
        assert_eq!(status.pending_files, vec!["a.csv"]);
        assert_eq!(status.ingested_files, 0);
        assert!(status.deployed_snapshot.is_none());
        assert!(status.lock_holder.is_none());
        assert!(serde_yaml::to_string(&status).unwrap().contains("pending_files"));
    }

    #[tokio::test]
    async fn exclusive_refuses_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        let cfg = PipelineConfig::from_roots(dir.path().join("in"), dir.path().join("out"), dir.path().join("test"), dir.path().join("models"), dir.path().join("prod"));
        cfg.prepare_dirs().unwrap();
        let cfg = Arc::new(cfg);
        let _held = RunLock::acquire(&cfg.lock_path(), cfg.lock_lease(), Uuid::new_v4()).unwrap();
        let res = exclusive(cfg.clone(), "INGEST", |cfg, _| IngestionMerger::from_config(cfg).merge()).await;
        assert!(res.unwrap_err().to_string().contains("held"));
        assert!(!cfg.merged_dataset_path().exists());
    }

    #[tokio::test]
    async fn overrunning_command_keeps_the_lock_until_it_returns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        let mut cfg = PipelineConfig::from_roots(dir.path().join("in"), dir.path().join("out"), dir.path().join("test"), dir.path().join("models"), dir.path().join("prod"));
        cfg.prepare_dirs().unwrap();
        cfg.stage_deadline_secs = 1;
        let cfg = Arc::new(cfg);
        let res = exclusive(cfg.clone(), "SCORE", |_, _| {
            std::thread::sleep(std::time::Duration::from_millis(1800));
            Ok::<_, std::io::Error>(())
        }).await;
        assert!(res.unwrap_err().to_string().contains("deadline"));
        assert!(cfg.lock_path().exists());
        tokio::time::sleep(std::time::Duration::from_millis(2000)).await;
        assert!(!cfg.lock_path().exists());
    }
}
