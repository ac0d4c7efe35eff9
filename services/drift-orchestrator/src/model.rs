//! Model artifacts: the `Classifier` capability and the on-disk codec.
//!
//! File layout:
//! ```text
//! churnguard-model/v1 sha256=<hex of body>\n
//! <JSON body>
//! ```
//! The body is hashed as written, so a truncated or edited file fails to load instead of
//! silently predicting with different weights.

use std::path::Path;

use churnguard_core::fsio;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ModelError;
use crate::schema::{FeatureMatrix, Label};

pub const MODEL_FORMAT: &str = "churnguard-model/v1";

/// Anything that maps feature rows to binary labels.
pub trait Classifier: Send + Sync {
    /// Feature names the model expects, in order.
    fn features(&self) -> &[String];
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Label>, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredModel {
    LogisticRegression(LogisticRegression),
}

impl Classifier for StoredModel {
    fn features(&self) -> &[String] {
        match self { StoredModel::LogisticRegression(m) => m.features() }
    }
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Label>, ModelError> {
        match self { StoredModel::LogisticRegression(m) => m.predict(features) }
    }
}

/// Linear decision function over standardized inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub features: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl LogisticRegression {
    pub fn decision(&self, row: &[f64]) -> f64 {
        row.iter().zip(&self.means).zip(&self.scales).zip(&self.weights)
            .map(|(((x, m), s), w)| w * (x - m) / s)
            .sum::<f64>() + self.intercept
    }
}

impl Classifier for LogisticRegression {
    fn features(&self) -> &[String] { &self.features }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Label>, ModelError> {
        if features.columns() != self.features.as_slice() {
            return Err(ModelError::FeatureMismatch { expected: self.features.clone(), found: features.columns().to_vec() });
        }
        Ok(features.rows().iter().map(|r| Label::from(self.decision(r) > 0.0)).collect())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

pub fn encode(model: &StoredModel) -> Result<Vec<u8>, ModelError> {
    let body = serde_json::to_vec_pretty(model).map_err(ModelError::Encode)?;
    let mut out = format!("{MODEL_FORMAT} sha256={}\n", sha256_hex(&body)).into_bytes();
    out.extend_from_slice(&body);
    Ok(out)
}

/// `path` only labels errors.
pub fn decode(path: &Path, bytes: &[u8]) -> Result<StoredModel, ModelError> {
    let corrupt = |reason: &str| ModelError::Corrupt { path: path.to_path_buf(), reason: reason.to_string() };
    let split = bytes.iter().position(|&b| b == b'\n').ok_or_else(|| corrupt("missing header line"))?;
    let header = std::str::from_utf8(&bytes[..split]).map_err(|_| corrupt("header is not utf-8"))?;
    let body = &bytes[split + 1..];
    let (format, digest) = header.split_once(' ').ok_or_else(|| corrupt("malformed header"))?;
    if format != MODEL_FORMAT {
        return Err(corrupt(&format!("unknown format {format:?}")));
    }
    let expected = digest.strip_prefix("sha256=").ok_or_else(|| corrupt("header has no sha256"))?;
    let actual = sha256_hex(body);
    if !expected.eq_ignore_ascii_case(&actual) {
        return Err(ModelError::ChecksumMismatch { path: path.to_path_buf(), expected: expected.to_string(), actual });
    }
    serde_json::from_slice(body).map_err(|source| ModelError::Decode { path: path.to_path_buf(), source })
}

pub fn load_model(path: &Path) -> Result<StoredModel, ModelError> {
    let bytes = std::fs::read(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => ModelError::Missing { path: path.to_path_buf() },
        _ => ModelError::Io { path: path.to_path_buf(), source },
    })?;
    let model = decode(path, &bytes)?;
    debug!(path = %path.display(), "model loaded");
    Ok(model)
}

pub fn save_model(path: &Path, model: &StoredModel) -> Result<(), ModelError> {
    fsio::write_atomic(path, &encode(model)?).map_err(|source| ModelError::Io { path: path.to_path_buf(), source })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::FEATURE_COLUMNS;

    /// Predicts 1 when `lastmonth_activity` exceeds `threshold`.
    pub(crate) fn threshold_model(threshold: f64) -> StoredModel {
        StoredModel::LogisticRegression(LogisticRegression {
            features: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            means: vec![threshold, 0.0, 0.0],
            scales: vec![1.0, 1.0, 1.0],
            weights: vec![1.0, 0.0, 0.0],
            intercept: 0.0,
        })
    }

    fn matrix(rows: Vec<Vec<f64>>) -> FeatureMatrix {
        FeatureMatrix::new(FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(), rows)
    }

    #[test]
    fn predicts_by_decision_sign() {
        let m = threshold_model(10.0);
        assert_eq!(m.predict(&matrix(vec![vec![11.0, 0.0, 0.0], vec![10.0, 0.0, 0.0], vec![2.0, 5.0, 5.0]])).unwrap(), vec![1, 0, 0]);
    }

    #[test]
    fn wrong_feature_order_is_rejected() {
        let m = threshold_model(10.0);
        let swapped = FeatureMatrix::new(vec!["lastyear_activity".into(), "lastmonth_activity".into(), "number_of_employees".into()], vec![]);
        assert!(matches!(m.predict(&swapped), Err(ModelError::FeatureMismatch { .. })));
    }

    #[test]
    fn artifact_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainedmodel.json");
        let mut m = threshold_model(0.1 + 0.2);
        if let StoredModel::LogisticRegression(lr) = &mut m { lr.intercept = -1.0 / 3.0; }
        save_model(&path, &m).unwrap();
        assert_eq!(load_model(&path).unwrap(), m);
    }

    #[test]
    fn tampered_body_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainedmodel.json");
        save_model(&path, &threshold_model(1.0)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap().replace("\"intercept\": 0.0", "\"intercept\": 5.0");
        std::fs::write(&path, text).unwrap();
        assert!(matches!(load_model(&path), Err(ModelError::ChecksumMismatch { .. })));
    }

    #[test]
    fn truncated_and_foreign_files_are_corrupt() {
        let p = Path::new("m");
        assert!(matches!(decode(p, b"no newline at all"), Err(ModelError::Corrupt { .. })));
        assert!(matches!(decode(p, b"pickle/v4 sha256=00\n{}"), Err(ModelError::Corrupt { .. })));
        let body = b"{\"kind\":\"logistic_regression\"";
        let bytes = [format!("{MODEL_FORMAT} sha256={}\n", sha256_hex(body)).as_bytes(), body.as_slice()].concat();
        assert!(matches!(decode(p, &bytes), Err(ModelError::Decode { .. })));
    }

    #[test]
    fn missing_artifact_is_reported_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_model(&dir.path().join("absent.json")), Err(ModelError::Missing { .. })));
    }
}
