//! Deployment synchronizer: all-or-nothing publish of {model, score, dataset}.
//!
//! Production layout:
//! ```text
//! <prod>/CURRENT                      id of the live snapshot
//! <prod>/snapshots/<id>/trainedmodel.json
//!                      /latestscore.txt
//!                      /finaldata.csv
//!                      /MANIFEST.json  sha256 of each member, plus the score
//! ```
//! A publish fills `snapshots/.staging-<id>`, renames it to `snapshots/<id>`, then atomically
//! replaces `CURRENT`. That last rename is the commit point; anything that fails earlier leaves the
//! live snapshot untouched. Superseded snapshots are pruned after commit. A synchronizer carrying
//! a [`StageToken`] claims the commit through it and gives up if the stage was already abandoned.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use churnguard_core::fsio;
use churnguard_resilience::StageToken;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{PipelineConfig, MERGED_DATASET_FILE, MODEL_FILE, SCORE_FILE};
use crate::error::{DeploymentError, ModelError, ScoringError};
use crate::model::{self, sha256_hex, StoredModel};
use crate::scoring::read_score;

pub const CURRENT_FILE: &str = "CURRENT";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const MANIFEST_FILE: &str = "MANIFEST.json";
const STAGING_PREFIX: &str = ".staging-";

/// What gets published together.
#[derive(Debug, Clone)]
pub struct DeploymentBundle {
    pub model: StoredModel,
    pub score: f64,
    pub dataset: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase { ModelStaged, ScoreStaged, DatasetStaged, Promoted }

impl fmt::Display for PublishPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublishPhase::ModelStaged => "model_staged",
            PublishPhase::ScoreStaged => "score_staged",
            PublishPhase::DatasetStaged => "dataset_staged",
            PublishPhase::Promoted => "promoted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub score: f64,
    pub files: Vec<ManifestEntry>,
}

/// A committed, read-only production snapshot.
#[derive(Debug, Clone)]
pub struct DeploymentSnapshot {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: SnapshotManifest,
}

impl DeploymentSnapshot {
    pub fn model_path(&self) -> PathBuf { self.dir.join(MODEL_FILE) }
    pub fn score_path(&self) -> PathBuf { self.dir.join(SCORE_FILE) }
    pub fn dataset_path(&self) -> PathBuf { self.dir.join(MERGED_DATASET_FILE) }

    pub fn load_model(&self) -> Result<StoredModel, ModelError> { model::load_model(&self.model_path()) }
    pub fn score(&self) -> Result<f64, ScoringError> { read_score(&self.score_path()) }

    /// Re-hash every member against the manifest.
    pub fn verify(&self) -> Result<(), DeploymentError> {
        for entry in &self.manifest.files {
            let path = self.dir.join(&entry.name);
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(DeploymentError::Incomplete { dir: self.dir.clone(), missing: entry.name.clone() }),
                Err(source) => return Err(DeploymentError::Io { path, source }),
            };
            let actual = sha256_hex(&bytes);
            if actual != entry.sha256 {
                return Err(DeploymentError::Verification { dir: self.dir.clone(), reason: format!("{} sha256 {} != manifest {}", entry.name, actual, entry.sha256) });
            }
        }
        let score = self.score()?;
        if score.to_bits() != self.manifest.score.to_bits() {
            return Err(DeploymentError::Verification { dir: self.dir.clone(), reason: format!("score {score} != manifest {}", self.manifest.score) });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentSynchronizer {
    root: PathBuf,
    token: Option<StageToken>,
}

impl DeploymentSynchronizer {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into(), token: None } }
    pub fn from_config(cfg: &PipelineConfig) -> Self { Self::new(cfg.prod_deployment_dir.clone()) }

    pub fn with_token(mut self, token: StageToken) -> Self { self.token = Some(token); self }

    fn snapshots_dir(&self) -> PathBuf { self.root.join(SNAPSHOTS_DIR) }
    fn pointer_path(&self) -> PathBuf { self.root.join(CURRENT_FILE) }

    /// The live snapshot, or `None` before the first publish.
    pub fn current(&self) -> Result<Option<DeploymentSnapshot>, DeploymentError> {
        let pointer = self.pointer_path();
        let id = match fs::read_to_string(&pointer) {
            Ok(s) => s.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(DeploymentError::Io { path: pointer, source }),
        };
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(DeploymentError::Verification { dir: self.root.clone(), reason: format!("pointer holds invalid snapshot id {id:?}") });
        }
        let dir = self.snapshots_dir().join(&id);
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = match fs::read(&manifest_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(DeploymentError::Incomplete { dir, missing: MANIFEST_FILE.into() }),
            Err(source) => return Err(DeploymentError::Io { path: manifest_path, source }),
        };
        let manifest: SnapshotManifest = serde_json::from_slice(&raw).map_err(|source| DeploymentError::Manifest { path: manifest_path, source })?;
        Ok(Some(DeploymentSnapshot { id, dir, manifest }))
    }

    pub fn publish(&self, bundle: &DeploymentBundle) -> Result<DeploymentSnapshot, DeploymentError> {
        self.publish_observed(bundle, |_| Ok(()))
    }

    /// [`Self::publish`] with a callback after each pre-commit phase. An `Err` from the callback
    /// aborts the publish exactly as a real failure at that point would.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub fn publish_observed<F>(&self, bundle: &DeploymentBundle, mut observe: F) -> Result<DeploymentSnapshot, DeploymentError>
    where F: FnMut(PublishPhase) -> Result<(), DeploymentError> {
        let created_at = Utc::now();
        let id = format!("{}-{}", created_at.format("%Y%m%dT%H%M%S%3fZ"), &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let snapshots = self.snapshots_dir();
        let staging = snapshots.join(format!("{STAGING_PREFIX}{id}"));
        let target = snapshots.join(&id);

        let staged = (|| -> Result<SnapshotManifest, DeploymentError> {
            fs::create_dir_all(&staging).map_err(|source| DeploymentError::Io { path: staging.clone(), source })?;
            let mut files = Vec::with_capacity(3);

            files.push(stage_file(&staging, MODEL_FILE, &model::encode(&bundle.model)?)?);
            observe(PublishPhase::ModelStaged)?;
            files.push(stage_file(&staging, SCORE_FILE, bundle.score.to_string().as_bytes())?);
            observe(PublishPhase::ScoreStaged)?;
            let dataset = fs::read(&bundle.dataset).map_err(|source| DeploymentError::Io { path: bundle.dataset.clone(), source })?;
            files.push(stage_file(&staging, MERGED_DATASET_FILE, &dataset)?);
            observe(PublishPhase::DatasetStaged)?;

            let manifest = SnapshotManifest { snapshot_id: id.clone(), created_at, score: bundle.score, files };
            let manifest_path = staging.join(MANIFEST_FILE);
            let body = serde_json::to_vec_pretty(&manifest).map_err(|source| DeploymentError::Manifest { path: manifest_path, source })?;
            stage_file(&staging, MANIFEST_FILE, &body)?;
            fsio::sync_dir(&staging);

            fs::rename(&staging, &target).map_err(|source| DeploymentError::Io { path: target.clone(), source })?;
            fsio::sync_dir(&snapshots);
            observe(PublishPhase::Promoted)?;
            if let Some(token) = &self.token {
                if !token.enter_commit() { return Err(DeploymentError::Cancelled { snapshot: id.clone() }); }
            }
            Ok(manifest)
        })();

        let manifest = match staged {
            Ok(m) => m,
            Err(err) => {
                warn!(snapshot = %id, error = %err, "publish aborted before commit; production untouched");
                for dir in [&staging, &target] {
                    if dir.exists() { let _ = fs::remove_dir_all(dir); }
                }
                return Err(err);
            }
        };

        let pointer = self.pointer_path();
        fsio::write_atomic(&pointer, id.as_bytes()).map_err(|source| DeploymentError::Io { path: pointer, source })?;
        info!(snapshot = %id, score = bundle.score, "snapshot committed");
        self.prune(&id);
        Ok(DeploymentSnapshot { id, dir: target, manifest })
    }

    /// Best-effort removal of everything under `snapshots/` except `keep`.
    fn prune(&self, keep: &str) {
        let Ok(entries) = fs::read_dir(self.snapshots_dir()) else { return };
        for entry in entries.flatten() {
            if entry.file_name() == keep { continue; }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!(path = %entry.path().display(), "pruned superseded snapshot"),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "could not prune snapshot"),
            }
        }
    }
}

fn stage_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<ManifestEntry, DeploymentError> {
    let path = dir.join(name);
    let res = (|| {
        let mut f = File::create(&path)?;
        f.write_all(bytes)?;
        f.sync_all()
    })();
    res.map_err(|source| DeploymentError::Io { path, source })?;
    Ok(ManifestEntry { name: name.to_string(), sha256: sha256_hex(bytes), bytes: bytes.len() as u64 })
}

/// Publish what sits in the model directory (model plus recorded score) with the merged dataset.
pub fn deploy_latest(cfg: &PipelineConfig, token: &StageToken) -> Result<DeploymentSnapshot, DeploymentError> {
    let bundle = DeploymentBundle {
        model: model::load_model(&cfg.model_path())?,
        score: read_score(&cfg.score_path())?,
        dataset: cfg.merged_dataset_path(),
    };
    DeploymentSynchronizer::from_config(cfg).with_token(token.clone()).publish(&bundle)
}
