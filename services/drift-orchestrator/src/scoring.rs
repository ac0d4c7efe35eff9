//! Score evaluator: F1 of a classifier against a labeled dataset, persisted as plain text.

use std::path::Path;

use churnguard_core::fsio;
use tracing::{debug, instrument};

use crate::config::PipelineConfig;
use crate::error::ScoringError;
use crate::model::{load_model, Classifier};
use crate::schema::{Label, LabeledData};

/// Harmonic mean of precision and recall for the positive class. 0.0 when there are no positives
/// in either `truth` or `pred`.
pub fn f1_score(truth: &[Label], pred: &[Label]) -> f64 {
    let (mut tp, mut fp, mut fnc) = (0u64, 0u64, 0u64);
    for (&t, &p) in truth.iter().zip(pred) {
        match (t, p) {
            (1, 1) => tp += 1,
            (0, 1) => fp += 1,
            (1, 0) => fnc += 1,
            _ => {}
        }
    }
    let denom = 2 * tp + fp + fnc;
    if denom == 0 { 0.0 } else { (2 * tp) as f64 / denom as f64 }
}

pub fn evaluate(model: &dyn Classifier, data: &LabeledData) -> Result<f64, ScoringError> {
    let pred = model.predict(&data.features)?;
    if pred.len() != data.len() {
        return Err(ScoringError::PredictionCount { expected: data.len(), predicted: pred.len() });
    }
    Ok(f1_score(&data.labels, &pred))
}

/// Score `model` on the CSV at `dataset`.
pub fn score_dataset(model: &dyn Classifier, dataset: &Path) -> Result<f64, ScoringError> {
    let data = LabeledData::from_csv(dataset)?;
    let score = evaluate(model, &data)?;
    debug!(dataset = %dataset.display(), rows = data.len(), score, "dataset scored");
    Ok(score)
}

/// Score and overwrite `out` with the value.
pub fn record_score(model: &dyn Classifier, dataset: &Path, out: &Path) -> Result<f64, ScoringError> {
    let score = score_dataset(model, dataset)?;
    write_score(out, score)?;
    Ok(score)
}

/// The artifact holds the shortest decimal that parses back to the same `f64`.
pub fn write_score(path: &Path, score: f64) -> Result<(), ScoringError> {
    fsio::write_atomic(path, score.to_string().as_bytes()).map_err(|source| ScoringError::Io { path: path.to_path_buf(), source })
}

pub fn read_score(path: &Path) -> Result<f64, ScoringError> {
    let content = std::fs::read_to_string(path).map_err(|source| ScoringError::Io { path: path.to_path_buf(), source })?;
    content.trim().parse::<f64>().map_err(|_| ScoringError::BadScore { path: path.to_path_buf(), content })
}

/// Score the model in the model directory on the merged dataset and record it next to the model.
#[instrument(skip_all)]
pub fn score_model(cfg: &PipelineConfig) -> Result<f64, ScoringError> {
    let model = load_model(&cfg.model_path())?;
    record_score(&model, &cfg.merged_dataset_path(), &cfg.score_path())
}
