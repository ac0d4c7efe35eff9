//! Pipeline configuration: five path roots plus run policy.
//!
//! Loaded once at startup, validated, then shared read-only as `Arc<PipelineConfig>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "CHURNGUARD";
pub const SERVICE_NAME: &str = "churnguard";

pub const MERGED_DATASET_FILE: &str = "finaldata.csv";
pub const PROVENANCE_LOG_FILE: &str = "ingestedfiles.txt";
pub const MODEL_FILE: &str = "trainedmodel.json";
pub const SCORE_FILE: &str = "latestscore.txt";
pub const TEST_DATA_FILE: &str = "testdata.csv";
pub const LOCK_FILE: &str = ".churnguard.lock";

/// How a freshly computed score is compared with the recorded baseline.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Any difference at all, including the last bit, counts as drift.
    #[default]
    Exact,
    /// Drift only when `|baseline - fresh| > epsilon`.
    Tolerance(f64),
}

impl DriftPolicy {
    pub fn differs(&self, baseline: f64, fresh: f64) -> bool {
        match *self {
            DriftPolicy::Exact => baseline != fresh,
            DriftPolicy::Tolerance(eps) => !((baseline - fresh).abs() <= eps),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Raw tabular shards (`*.csv`).
    #[serde(default, alias = "input_folder_path")]
    pub input_dir: PathBuf,
    /// Canonical merged dataset and provenance log.
    #[serde(default, alias = "output_folder_path")]
    pub output_dir: PathBuf,
    /// Held-out labeled data used by diagnostics.
    #[serde(default, alias = "test_data_path")]
    pub test_data_dir: PathBuf,
    /// Latest trained model and its score.
    #[serde(default, alias = "output_model_path")]
    pub model_dir: PathBuf,
    /// Production snapshot.
    #[serde(default, alias = "prod_deployment_path")]
    pub prod_deployment_dir: PathBuf,
    #[serde(default = "default_stage_deadline_secs")]
    pub stage_deadline_secs: u64,
    #[serde(default)]
    pub drift_policy: DriftPolicy,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    /// argv of an external outdated-dependency checker; empty disables the audit.
    #[serde(default)]
    pub dependency_audit_command: Vec<String>,
}

fn default_service_name() -> String { SERVICE_NAME.to_string() }
fn default_stage_deadline_secs() -> u64 { 600 }
fn default_lock_lease_secs() -> u64 { 3600 }

impl PipelineConfig {
    /// Layered load (defaults, file, `CHURNGUARD_*` env), then validate and create output roots.
    pub fn load(file: Option<&Path>) -> Result<Arc<Self>, ConfigError> {
        let cfg: PipelineConfig = churnguard_core::load_layered(SERVICE_NAME, file, ENV_PREFIX)?;
        cfg.validate()?;
        cfg.prepare_dirs()?;
        debug!(?cfg, "pipeline config loaded");
        Ok(Arc::new(cfg))
    }

    /// Config with default policy over explicit roots. Still needs [`Self::validate`].
    pub fn from_roots(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, test_data_dir: impl Into<PathBuf>, model_dir: impl Into<PathBuf>, prod_deployment_dir: impl Into<PathBuf>) -> Self {
        Self {
            service_name: default_service_name(),
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            test_data_dir: test_data_dir.into(),
            model_dir: model_dir.into(),
            prod_deployment_dir: prod_deployment_dir.into(),
            stage_deadline_secs: default_stage_deadline_secs(),
            drift_policy: DriftPolicy::default(),
            lock_lease_secs: default_lock_lease_secs(),
            dependency_audit_command: Vec::new(),
        }
    }

    fn roots(&self) -> [(&'static str, &Path); 5] {
        [
            ("input_dir", self.input_dir.as_path()),
            ("output_dir", self.output_dir.as_path()),
            ("test_data_dir", self.test_data_dir.as_path()),
            ("model_dir", self.model_dir.as_path()),
            ("prod_deployment_dir", self.prod_deployment_dir.as_path()),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, path) in self.roots() {
            if path.as_os_str().is_empty() { return Err(ConfigError::EmptyRoot { key }); }
            if path.exists() && !path.is_dir() { return Err(ConfigError::NotADirectory { key, path: path.to_path_buf() }); }
        }
        if !self.input_dir.is_dir() { return Err(ConfigError::MissingRoot { key: "input_dir", path: self.input_dir.clone() }); }
        if self.stage_deadline_secs == 0 { return Err(ConfigError::Invalid { key: "stage_deadline_secs", reason: "must be positive".into() }); }
        if self.lock_lease_secs == 0 { return Err(ConfigError::Invalid { key: "lock_lease_secs", reason: "must be positive".into() }); }
        if let DriftPolicy::Tolerance(eps) = self.drift_policy {
            if !eps.is_finite() || eps < 0.0 { return Err(ConfigError::Invalid { key: "drift_policy", reason: format!("tolerance {eps} must be a finite non-negative number") }); }
        }
        Ok(())
    }

    /// Create the roots this process writes into.
    pub fn prepare_dirs(&self) -> Result<(), ConfigError> {
        for (key, path) in [("output_dir", &self.output_dir), ("model_dir", &self.model_dir), ("prod_deployment_dir", &self.prod_deployment_dir)] {
            std::fs::create_dir_all(path).map_err(|source| ConfigError::Prepare { key, path: path.clone(), source })?;
        }
        Ok(())
    }

    pub fn merged_dataset_path(&self) -> PathBuf { self.output_dir.join(MERGED_DATASET_FILE) }
    pub fn provenance_log_path(&self) -> PathBuf { self.output_dir.join(PROVENANCE_LOG_FILE) }
    pub fn model_path(&self) -> PathBuf { self.model_dir.join(MODEL_FILE) }
    pub fn score_path(&self) -> PathBuf { self.model_dir.join(SCORE_FILE) }
    pub fn test_data_path(&self) -> PathBuf { self.test_data_dir.join(TEST_DATA_FILE) }
    pub fn lock_path(&self) -> PathBuf { self.prod_deployment_dir.join(LOCK_FILE) }
    pub fn stage_deadline(&self) -> Duration { Duration::from_secs(self.stage_deadline_secs) }
    pub fn lock_lease(&self) -> Duration { Duration::from_secs(self.lock_lease_secs) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn roots(dir: &Path) -> PipelineConfig {
        std::fs::create_dir_all(dir.join("sourcedata")).unwrap();
        PipelineConfig::from_roots(dir.join("sourcedata"), dir.join("ingesteddata"), dir.join("testdata"), dir.join("models"), dir.join("production_deployment"))
    }

    #[test]
    fn loads_legacy_key_names_from_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("practicedata")).unwrap();
        let file = dir.path().join("config.json");
        let mut f = std::fs::File::create(&file).unwrap();
        let root = dir.path().display();
        write!(f, r#"{{
            "input_folder_path": "{root}/practicedata",
            "output_folder_path": "{root}/ingesteddata",
            "test_data_path": "{root}/testdata",
            "output_model_path": "{root}/practicemodels",
            "prod_deployment_path": "{root}/production_deployment"
        }}"#).unwrap();
        let cfg = PipelineConfig::load(Some(&file)).unwrap();
        assert_eq!(cfg.input_dir, dir.path().join("practicedata"));
        assert_eq!(cfg.drift_policy, DriftPolicy::Exact);
        assert_eq!(cfg.stage_deadline(), Duration::from_secs(600));
        assert!(dir.path().join("production_deployment").is_dir());
        assert_eq!(cfg.model_path(), dir.path().join("practicemodels").join(MODEL_FILE));
    }

    #[test]
    fn yaml_tolerance_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("in")).unwrap();
        let file = dir.path().join("churnguard.yaml");
        let root = dir.path().display();
        std::fs::write(&file, format!("input_dir: {root}/in\noutput_dir: {root}/out\ntest_data_dir: {root}/test\nmodel_dir: {root}/models\nprod_deployment_dir: {root}/prod\nstage_deadline_secs: 30\ndrift_policy:\n  tolerance: 0.001\n")).unwrap();
        let cfg = PipelineConfig::load(Some(&file)).unwrap();
        assert_eq!(cfg.drift_policy, DriftPolicy::Tolerance(0.001));
        assert_eq!(cfg.stage_deadline_secs, 30);
    }

    #[test]
    fn empty_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = roots(dir.path());
        cfg.model_dir = PathBuf::new();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyRoot { key: "model_dir" })));
    }

    #[test]
    fn missing_input_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = roots(dir.path());
        cfg.input_dir = dir.path().join("nope");
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingRoot { key: "input_dir", .. })));
    }

    #[test]
    fn file_in_place_of_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = roots(dir.path());
        let file = dir.path().join("plainfile");
        std::fs::write(&file, b"x").unwrap();
        cfg.output_dir = file;
        assert!(matches!(cfg.validate(), Err(ConfigError::NotADirectory { key: "output_dir", .. })));
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = roots(dir.path());
        cfg.drift_policy = DriftPolicy::Tolerance(-1.0);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { key: "drift_policy", .. })));
    }

    #[test]
    fn drift_policies() {
        assert!(!DriftPolicy::Exact.differs(0.5714285714285715, 0.5714285714285715));
        assert!(DriftPolicy::Exact.differs(0.5, 0.5 + f64::EPSILON));
        assert!(DriftPolicy::Exact.differs(f64::NAN, f64::NAN));
        assert!(!DriftPolicy::Tolerance(1e-6).differs(0.5, 0.5000001));
        assert!(DriftPolicy::Tolerance(1e-6).differs(0.5, 0.6));
    }
}
