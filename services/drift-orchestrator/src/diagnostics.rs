//! Operator diagnostics for the deployed snapshot.
//!
//! Collected after a publish (DIAGNOSE) or on demand. Nothing here feeds back into the pipeline;
//! failures are logged by the caller and never undo a deployment.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use churnguard_core::fsio;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::PipelineConfig;
use crate::deployment::DeploymentSnapshot;
use crate::error::{DatasetError, DiagnosticsError, ScoringError};
use crate::model::Classifier;
use crate::schema::{csv_error, Label, LabeledData, FEATURE_COLUMNS};
use crate::scoring::f1_score;
use crate::state::{PipelineState, StageReport};

pub const DIAGNOSTICS_FILE: &str = "diagnostics.json";
pub const CONFUSION_MATRIX_FILE: &str = "confusion_matrix.json";

/// Lists packages with newer releases available.
pub trait DependencyAudit: Send + Sync {
    fn outdated_dependencies(&self) -> Result<Vec<String>, DiagnosticsError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoAudit;

impl DependencyAudit for NoAudit {
    fn outdated_dependencies(&self) -> Result<Vec<String>, DiagnosticsError> { Ok(Vec::new()) }
}

/// Runs an external checker and takes the first token of each table row on stdout.
/// Header rows (`Package ...`, `Name ...`) and `---` rules are skipped.
#[derive(Debug, Clone)]
pub struct CommandAudit {
    argv: Vec<String>,
}

impl CommandAudit {
    pub fn new(argv: Vec<String>) -> Self { Self { argv } }
}

impl DependencyAudit for CommandAudit {
    fn outdated_dependencies(&self) -> Result<Vec<String>, DiagnosticsError> {
        let command = self.argv.join(" ");
        let Some((program, args)) = self.argv.split_first() else {
            return Err(DiagnosticsError::Audit { command, reason: "empty command".into() });
        };
        let out = Command::new(program).args(args).output()
            .map_err(|e| DiagnosticsError::Audit { command: command.clone(), reason: e.to_string() })?;
        if !out.status.success() {
            return Err(DiagnosticsError::Audit { command, reason: format!("{}: {}", out.status, String::from_utf8_lossy(&out.stderr).trim()) });
        }
        Ok(parse_audit_table(&String::from_utf8_lossy(&out.stdout)))
    }
}

fn parse_audit_table(stdout: &str) -> Vec<String> {
    stdout.lines()
        .filter_map(|l| l.split_whitespace().next())
        .filter(|tok| !tok.chars().all(|c| c == '-') && !matches!(*tok, "Package" | "Name"))
        .map(str::to_string)
        .collect()
}

pub fn audit_from_config(cfg: &PipelineConfig) -> Arc<dyn DependencyAudit> {
    if cfg.dependency_audit_command.is_empty() { Arc::new(NoAudit) } else { Arc::new(CommandAudit::new(cfg.dependency_audit_command.clone())) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub true_negative: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub true_positive: u64,
}

impl ConfusionMatrix {
    pub fn from_labels(truth: &[Label], pred: &[Label]) -> Self {
        let mut cm = Self::default();
        for (&t, &p) in truth.iter().zip(pred) {
            match (t, p) {
                (0, 0) => cm.true_negative += 1,
                (0, _) => cm.false_positive += 1,
                (_, 0) => cm.false_negative += 1,
                _ => cm.true_positive += 1,
            }
        }
        cm
    }

    /// `[[tn, fp], [fn, tp]]`, rows are actual classes.
    pub fn as_rows(&self) -> [[u64; 2]; 2] {
        [[self.true_negative, self.false_positive], [self.false_negative, self.true_positive]]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSummary {
    pub column: String,
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation; absent with fewer than two values.
    pub std_dev: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingFraction {
    pub column: String,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed_ms: f64,
}

/// Elapsed time of the ingestion and training stages of a run.
pub fn stage_durations(reports: &[StageReport]) -> Vec<StageTiming> {
    reports.iter()
        .filter(|r| matches!(r.stage, PipelineState::Ingest | PipelineState::Retrain))
        .map(|r| StageTiming { stage: r.stage.to_string(), elapsed_ms: r.elapsed_ms })
        .collect()
}

pub fn predictions(model: &dyn Classifier, data: &LabeledData) -> Result<Vec<Label>, ScoringError> {
    let pred = model.predict(&data.features)?;
    if pred.len() != data.len() {
        return Err(ScoringError::PredictionCount { expected: data.len(), predicted: pred.len() });
    }
    Ok(pred)
}

/// Raw string cells of a CSV, for statistics that must tolerate blanks.
#[derive(Debug, Clone, Default)]
pub struct DatasetProfile {
    columns: Vec<String>,
    cells: Vec<Vec<String>>,
}

impl DatasetProfile {
    pub fn from_csv(path: &Path) -> Result<Self, DatasetError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).flexible(true).from_path(path).map_err(|e| csv_error(path, e))?;
        let columns = rdr.headers().map_err(|e| csv_error(path, e))?.iter().map(str::to_string).collect();
        let mut cells = Vec::new();
        for rec in rdr.records() {
            cells.push(rec.map_err(|e| csv_error(path, e))?.iter().map(str::to_string).collect());
        }
        Ok(Self { columns, cells })
    }

    fn is_missing(cell: Option<&String>) -> bool {
        match cell.map(|c| c.as_str()) {
            None | Some("") => true,
            Some(c) => c.eq_ignore_ascii_case("na") || c.eq_ignore_ascii_case("nan") || c.eq_ignore_ascii_case("null"),
        }
    }

    /// Share of blank or NA cells in every column. 0.0 for an empty table.
    pub fn missing_value_fractions(&self) -> Vec<MissingFraction> {
        self.columns.iter().enumerate().map(|(j, column)| {
            let missing = self.cells.iter().filter(|r| Self::is_missing(r.get(j))).count();
            let fraction = if self.cells.is_empty() { 0.0 } else { missing as f64 / self.cells.len() as f64 };
            MissingFraction { column: column.clone(), fraction }
        }).collect()
    }

    /// Mean, median and sample std of each feature column over its parseable cells. Columns with no
    /// values are omitted.
    pub fn summary_statistics(&self) -> Vec<FeatureSummary> {
        FEATURE_COLUMNS.iter().filter_map(|&name| {
            let j = self.columns.iter().position(|c| c == name)?;
            let mut values: Vec<f64> = self.cells.iter()
                .filter_map(|r| r.get(j).and_then(|c| c.parse::<f64>().ok()))
                .filter(|v| v.is_finite())
                .collect();
            if values.is_empty() { return None; }
            values.sort_by(f64::total_cmp);
            let n = values.len();
            let mean = values.iter().sum::<f64>() / n as f64;
            let median = if n % 2 == 1 { values[n / 2] } else { (values[n / 2 - 1] + values[n / 2]) / 2.0 };
            let std_dev = (n > 1).then(|| (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt());
            Some(FeatureSummary { column: name.to_string(), mean, median, std_dev })
        }).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub snapshot_id: String,
    pub test_data: PathBuf,
    pub holdout_f1: f64,
    pub predictions: Vec<Label>,
    pub confusion_matrix: ConfusionMatrix,
    pub summary_statistics: Vec<FeatureSummary>,
    pub missing_value_fractions: Vec<MissingFraction>,
    pub stage_durations: Vec<StageTiming>,
    pub outdated_dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_error: Option<String>,
}

/// Score the deployed model on held-out data and profile that data.
#[instrument(skip_all, fields(snapshot = %snapshot.id))]
pub fn collect(cfg: &PipelineConfig, snapshot: &DeploymentSnapshot, stages: &[StageReport], audit: &dyn DependencyAudit) -> Result<DiagnosticsReport, DiagnosticsError> {
    let model = snapshot.load_model()?;
    let test_path = cfg.test_data_path();
    let test = LabeledData::from_csv(&test_path)?;
    let preds = predictions(&model, &test)?;
    let profile = DatasetProfile::from_csv(&test_path)?;
    let (outdated_dependencies, audit_error) = match audit.outdated_dependencies() {
        Ok(list) => (list, None),
        Err(e) => {
            warn!(error = %e, "dependency audit failed");
            (Vec::new(), Some(e.to_string()))
        }
    };
    Ok(DiagnosticsReport {
        snapshot_id: snapshot.id.clone(),
        test_data: test_path,
        holdout_f1: f1_score(&test.labels, &preds),
        confusion_matrix: ConfusionMatrix::from_labels(&test.labels, &preds),
        predictions: preds,
        summary_statistics: profile.summary_statistics(),
        missing_value_fractions: profile.missing_value_fractions(),
        stage_durations: stage_durations(stages),
        outdated_dependencies,
        audit_error,
    })
}

/// Consumer of a finished report.
pub trait DiagnosticsReporter: Send + Sync {
    fn name(&self) -> &'static str;
    fn publish(&self, report: &DiagnosticsReport) -> Result<(), DiagnosticsError>;
}

/// Writes `diagnostics.json` and `confusion_matrix.json` into a directory.
#[derive(Debug, Clone)]
pub struct FileReporter {
    dir: PathBuf,
}

impl FileReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }
}

impl DiagnosticsReporter for FileReporter {
    fn name(&self) -> &'static str { "file" }

    fn publish(&self, report: &DiagnosticsReport) -> Result<(), DiagnosticsError> {
        let write = |name: &str, body: Vec<u8>| {
            let path = self.dir.join(name);
            fsio::write_atomic(&path, &body).map_err(|source| DiagnosticsError::Io { path, source })
        };
        write(DIAGNOSTICS_FILE, serde_json::to_vec_pretty(report)?)?;
        write(CONFUSION_MATRIX_FILE, serde_json::to_vec_pretty(&report.confusion_matrix.as_rows())?)?;
        info!(dir = %self.dir.display(), holdout_f1 = report.holdout_f1, "diagnostics written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{DeploymentBundle, DeploymentSynchronizer};
    use crate::model::tests::threshold_model;
    use crate::state::StageOutcome;

    const HEADER: &str = "corporation,lastmonth_activity,lastyear_activity,number_of_employees,exited\n";

    #[test]
    fn confusion_matrix_counts() {
        let cm = ConfusionMatrix::from_labels(&[0, 0, 1, 1, 1], &[0, 1, 0, 1, 1]);
        assert_eq!(cm.as_rows(), [[1, 1], [1, 2]]);
    }

    #[test]
    fn profile_stats_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finaldata.csv");
        std::fs::write(&path, format!("{HEADER}a,1,10,5,0\nb,3,,5,1\nc,8,30,5,\nd,4,20,5,0\n")).unwrap();
        let p = DatasetProfile::from_csv(&path).unwrap();
        let stats = p.summary_statistics();
        assert_eq!(stats[0], FeatureSummary { column: "lastmonth_activity".into(), mean: 4.0, median: 3.5, std_dev: Some((26.0f64 / 3.0).sqrt()) });
        assert_eq!(stats[1].median, 20.0);
        assert_eq!(stats[2].std_dev, Some(0.0));
        let missing: Vec<f64> = p.missing_value_fractions().iter().map(|m| m.fraction).collect();
        assert_eq!(missing, vec![0.0, 0.0, 0.25, 0.0, 0.25]);
    }

    #[test]
    fn durations_cover_ingest_and_retrain_only() {
        let stage = |stage, elapsed_ms| StageReport { stage, elapsed_ms, outcome: StageOutcome::Succeeded };
        let reports = [stage(PipelineState::CheckNewData, 1.0), stage(PipelineState::Ingest, 2.0), stage(PipelineState::CheckDrift, 3.0), stage(PipelineState::Retrain, 4.0), stage(PipelineState::Redeploy, 5.0)];
        assert_eq!(stage_durations(&reports), vec![StageTiming { stage: "INGEST".into(), elapsed_ms: 2.0 }, StageTiming { stage: "RETRAIN".into(), elapsed_ms: 4.0 }]);
    }

    #[test]
    fn audit_table_parsing() {
        let out = "Package    Version Latest Type\n---------- ------- ------ -----\nnumpy      1.24.0  1.26.4 wheel\nscikit-learn 1.2.0 1.4.1 wheel\n\n";
        assert_eq!(parse_audit_table(out), vec!["numpy", "scikit-learn"]);
    }

    #[test]
    fn collect_and_write_report() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        let cfg = PipelineConfig::from_roots(dir.path().join("in"), dir.path().join("out"), dir.path().join("test"), dir.path().join("models"), dir.path().join("prod"));
        cfg.prepare_dirs().unwrap();
        std::fs::create_dir_all(&cfg.test_data_dir).unwrap();
        std::fs::write(cfg.test_data_path(), format!("{HEADER}a,20,0,0,1\nb,2,0,0,1\nc,1,0,0,0\n")).unwrap();
        let dataset = dir.path().join("merged.csv");
        std::fs::write(&dataset, format!("{HEADER}a,20,0,0,1\n")).unwrap();
        let snap = DeploymentSynchronizer::from_config(&cfg).publish(&DeploymentBundle { model: threshold_model(10.0), score: 1.0, dataset }).unwrap();
        let stages = [StageReport { stage: PipelineState::Ingest, elapsed_ms: 12.5, outcome: StageOutcome::Succeeded }];

        let report = collect(&cfg, &snap, &stages, &NoAudit).unwrap();
        assert_eq!(report.predictions, vec![1, 0, 0]);
        assert_eq!(report.holdout_f1, 2.0 / 3.0);
        assert_eq!(report.stage_durations, vec![StageTiming { stage: "INGEST".into(), elapsed_ms: 12.5 }]);
        // profiled from the held-out file, not the one-row deployed dataset
        assert_eq!(report.summary_statistics[0].mean, 23.0 / 3.0);
        assert_eq!(report.summary_statistics[0].median, 2.0);
        assert_eq!(report.missing_value_fractions.len(), 5);

        FileReporter::new(&cfg.model_dir).publish(&report).unwrap();
        let cm: serde_json::Value = serde_json::from_slice(&std::fs::read(cfg.model_dir.join(CONFUSION_MATRIX_FILE)).unwrap()).unwrap();
        assert_eq!(cm, serde_json::json!([[1, 0], [1, 1]]));
        assert!(cfg.model_dir.join(DIAGNOSTICS_FILE).exists());
    }

    #[test]
    fn failing_audit_is_recorded_not_fatal() {
        struct Broken;
        impl DependencyAudit for Broken {
            fn outdated_dependencies(&self) -> Result<Vec<String>, DiagnosticsError> {
                Err(DiagnosticsError::Audit { command: "pip".into(), reason: "offline".into() })
            }
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        let cfg = PipelineConfig::from_roots(dir.path().join("in"), dir.path().join("out"), dir.path().join("test"), dir.path().join("models"), dir.path().join("prod"));
        std::fs::create_dir_all(&cfg.test_data_dir).unwrap();
        std::fs::write(cfg.test_data_path(), format!("{HEADER}a,20,0,0,1\n")).unwrap();
        let dataset = dir.path().join("merged.csv");
        std::fs::write(&dataset, HEADER).unwrap();
        let snap = DeploymentSynchronizer::from_config(&cfg).publish(&DeploymentBundle { model: threshold_model(10.0), score: 1.0, dataset }).unwrap();
        let report = collect(&cfg, &snap, &[], &Broken).unwrap();
        assert!(report.outdated_dependencies.is_empty());
        assert!(report.audit_error.unwrap().contains("offline"));
    }
}
