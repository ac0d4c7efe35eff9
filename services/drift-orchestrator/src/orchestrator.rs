//! Drift orchestrator: the conditional retrain pipeline.
//!
//! One run holds the run lock for its whole duration and walks the state machine in
//! [`crate::state`]. Every stage body runs on the blocking pool under the configured deadline; the
//! first stage error ends the run in FAILED. DIAGNOSE is the exception: its failure is recorded and
//! the run still ends in DONE, since the deployment it reports on is already committed.

use std::sync::Arc;
use std::time::Instant;

use churnguard_core::PIPELINE_METRICS;
use churnguard_resilience::{with_cancellable_deadline, StageToken};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::deployment::{DeploymentBundle, DeploymentSynchronizer};
use crate::diagnostics::{self, audit_from_config, DependencyAudit, DiagnosticsReporter, FileReporter};
use crate::error::{PipelineError, StageError};
use crate::ingestion::{pending_files, IngestionMerger, MergeSummary};
use crate::lock::RunLock;
use crate::provenance::ProvenanceLog;
use crate::scoring::{record_score, score_dataset};
use crate::state::{PipelineState, RunTrace, StageReport};
use crate::training::{train_and_save, LogisticRegressionTrainer, Trainer};

/// Outcome of comparing the deployed score with a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DriftDecision {
    /// Nothing deployed yet.
    Bootstrap,
    Stable { baseline: f64, fresh: f64 },
    Drifted { baseline: f64, fresh: f64 },
}

impl DriftDecision {
    pub fn should_retrain(&self) -> bool { !matches!(self, DriftDecision::Stable { .. }) }
}

/// Re-score the deployed model on the merged dataset and compare with its recorded score.
pub fn check_drift(cfg: &PipelineConfig) -> Result<DriftDecision, StageError> {
    let Some(snapshot) = DeploymentSynchronizer::from_config(cfg).current()? else {
        return Ok(DriftDecision::Bootstrap);
    };
    let baseline = snapshot.score()?;
    let model = snapshot.load_model()?;
    let fresh = score_dataset(&model, &cfg.merged_dataset_path())?;
    Ok(if cfg.drift_policy.differs(baseline, fresh) { DriftDecision::Drifted { baseline, fresh } } else { DriftDecision::Stable { baseline, fresh } })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: PipelineState,
    pub new_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics_error: Option<String>,
    pub stages: Vec<StageReport>,
    pub total_ms: f64,
}

impl RunReport {
    fn new(run_id: Uuid) -> Self {
        Self { run_id, outcome: PipelineState::CheckNewData, new_files: Vec::new(), merge: None, drift: None, new_score: None, snapshot_id: None, diagnostics_error: None, stages: Vec::new(), total_ms: 0.0 }
    }

    fn finish(mut self, trace: &RunTrace) -> Self {
        self.outcome = trace.state();
        self.stages = trace.reports().to_vec();
        self.total_ms = trace.total_elapsed().as_secs_f64() * 1000.0;
        self
    }
}

pub struct DriftOrchestrator {
    cfg: Arc<PipelineConfig>,
    trainer: Arc<dyn Trainer>,
    audit: Arc<dyn DependencyAudit>,
    reporters: Vec<Arc<dyn DiagnosticsReporter>>,
}

impl DriftOrchestrator {
    /// Logistic regression trainer, audit from config, reports written into the model directory.
    pub fn new(cfg: Arc<PipelineConfig>) -> Self {
        let audit = audit_from_config(&cfg);
        let reporters: Vec<Arc<dyn DiagnosticsReporter>> = vec![Arc::new(FileReporter::new(cfg.model_dir.clone()))];
        Self { cfg, trainer: Arc::new(LogisticRegressionTrainer::default()), audit, reporters }
    }

    pub fn with_trainer(mut self, trainer: Arc<dyn Trainer>) -> Self { self.trainer = trainer; self }
    pub fn with_audit(mut self, audit: Arc<dyn DependencyAudit>) -> Self { self.audit = audit; self }
    pub fn with_reporters(mut self, reporters: Vec<Arc<dyn DiagnosticsReporter>>) -> Self { self.reporters = reporters; self }

    pub fn config(&self) -> &PipelineConfig { &self.cfg }

    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let res = self.run_locked(run_id).instrument(tracing::info_span!("pipeline_run", %run_id)).await;
        let outcome = match &res {
            Ok(report) => report.outcome,
            Err(_) => PipelineState::Failed,
        };
        PIPELINE_METRICS.runs_total.add(1, &[KeyValue::new("outcome", outcome.as_str())]);
        match &res {
            Ok(report) => info!(outcome = %report.outcome, total_ms = report.total_ms, "run finished"),
            Err(e) => error!(stage = ?e.stage(), error = %e, "run failed"),
        }
        res
    }

    async fn run_locked(&self, run_id: Uuid) -> Result<RunReport, PipelineError> {
        let lease = Arc::new(RunLock::acquire(&self.cfg.lock_path(), self.cfg.lock_lease(), run_id)?);
        let mut trace = RunTrace::new();
        let mut report = RunReport::new(run_id);

        let cfg = Arc::clone(&self.cfg);
        let new_files = self.step(&mut trace, &lease, move |_| {
            let log = ProvenanceLog::load(&cfg.provenance_log_path())?;
            Ok(pending_files(&cfg.input_dir, &log)?)
        }).await?;
        if new_files.is_empty() {
            info!("no new source files");
            trace.advance(PipelineState::NoNewData);
            return Ok(report.finish(&trace));
        }
        info!(count = new_files.len(), files = ?new_files, "new source files");
        report.new_files = new_files;

        // Provenance entries are held back until the run reaches NO_DRIFT or commits a redeploy,
        // so a failed run leaves its files pending for the next one.
        trace.advance(PipelineState::Ingest);
        let cfg = Arc::clone(&self.cfg);
        let staged = self.step(&mut trace, &lease, move |_| Ok(IngestionMerger::from_config(&cfg).stage()?)).await?;
        report.merge = Some(staged.summary);
        let pending = staged.pending;

        trace.advance(PipelineState::CheckDrift);
        let cfg = Arc::clone(&self.cfg);
        let (drift, pending) = self.step(&mut trace, &lease, move |token| {
            let drift = check_drift(&cfg)?;
            if drift.should_retrain() { return Ok((drift, pending)); }
            if !token.enter_commit() { return Err(StageError::Cancelled); }
            IngestionMerger::from_config(&cfg).record(pending)?;
            Ok((drift, Vec::new()))
        }).await?;
        report.drift = Some(drift);
        match drift {
            DriftDecision::Stable { baseline, fresh } => {
                info!(baseline, fresh, "no drift");
                trace.advance(PipelineState::NoDrift);
                return Ok(report.finish(&trace));
            }
            DriftDecision::Drifted { baseline, fresh } => info!(baseline, fresh, "drift detected"),
            DriftDecision::Bootstrap => info!("nothing deployed yet; training initial model"),
        }

        trace.advance(PipelineState::Retrain);
        let cfg = Arc::clone(&self.cfg);
        let trainer = Arc::clone(&self.trainer);
        let (model, score) = self.step(&mut trace, &lease, move |_| {
            let model = train_and_save(&cfg, trainer.as_ref())?;
            let score = record_score(&model, &cfg.merged_dataset_path(), &cfg.score_path())?;
            Ok((model, score))
        }).await?;
        info!(score, "model retrained");
        report.new_score = Some(score);

        trace.advance(PipelineState::Redeploy);
        let cfg = Arc::clone(&self.cfg);
        let snapshot = self.step(&mut trace, &lease, move |token| {
            let bundle = DeploymentBundle { model, score, dataset: cfg.merged_dataset_path() };
            let snapshot = DeploymentSynchronizer::from_config(&cfg).with_token(token.clone()).publish(&bundle)?;
            IngestionMerger::from_config(&cfg).record(pending)?;
            Ok(snapshot)
        }).await?;
        report.snapshot_id = Some(snapshot.id.clone());

        trace.advance(PipelineState::Diagnose);
        let cfg = Arc::clone(&self.cfg);
        let audit = Arc::clone(&self.audit);
        let reporters = self.reporters.clone();
        let stages = trace.reports().to_vec();
        let diagnosed = self.timed(PipelineState::Diagnose, &lease, move |_| {
            let diag = diagnostics::collect(&cfg, &snapshot, &stages, audit.as_ref())?;
            let mut first_err = None;
            for r in &reporters {
                if let Err(e) = r.publish(&diag) {
                    warn!(reporter = r.name(), error = %e, "diagnostics reporter failed");
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), |e| Err(e.into()))
        }).await;
        match diagnosed {
            Ok(()) => trace.advance(PipelineState::Done),
            Err(e) => {
                warn!(error = %e, "diagnostics failed; deployment stands");
                report.diagnostics_error = Some(e.to_string());
                trace.advance_degraded(PipelineState::Done, e.to_string());
            }
        }
        Ok(report.finish(&trace))
    }

    /// Run the current state's body; on error close the trace as FAILED.
    async fn step<T, F>(&self, trace: &mut RunTrace, lease: &Arc<RunLock>, work: F) -> Result<T, PipelineError>
    where F: FnOnce(&StageToken) -> Result<T, StageError> + Send + 'static, T: Send + 'static {
        let stage = trace.state();
        match self.timed(stage, lease, work).await {
            Ok(v) => Ok(v),
            Err(source) => {
                trace.fail(source.to_string());
                Err(PipelineError::Stage { stage, source })
            }
        }
    }

    /// Deadline, latency metric and failure accounting around one stage body. The body holds a
    /// share of the run lock, so a body left running past its deadline keeps the lock until it
    /// returns.
    async fn timed<T, F>(&self, stage: PipelineState, lease: &Arc<RunLock>, work: F) -> Result<T, StageError>
    where F: FnOnce(&StageToken) -> Result<T, StageError> + Send + 'static, T: Send + 'static {
        let started = Instant::now();
        info!(stage = %stage, "stage started");
        let lease = Arc::clone(lease);
        let body = move |token: &StageToken| {
            let _lease = lease;
            work(token)
        };
        let res = match with_cancellable_deadline(stage.as_str(), self.cfg.stage_deadline(), body).await {
            Ok(inner) => inner,
            Err(timeout) => Err(StageError::Timeout(timeout)),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let attrs = [KeyValue::new("stage", stage.as_str())];
        PIPELINE_METRICS.stage_latency_ms.record(elapsed_ms, &attrs);
        match &res {
            Ok(_) => info!(stage = %stage, elapsed_ms, "stage finished"),
            Err(e) => {
                PIPELINE_METRICS.stage_failures_total.add(1, &attrs);
                error!(stage = %stage, elapsed_ms, error = %e, "stage failed");
            }
        }
        res
    }
}
