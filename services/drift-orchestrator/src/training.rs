//! Training collaborator. The orchestrator only sees the [`Trainer`] trait.

use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::TrainingError;
use crate::model::{save_model, LogisticRegression, StoredModel};
use crate::schema::LabeledData;

pub trait Trainer: Send + Sync {
    fn name(&self) -> &'static str;
    fn fit(&self, data: &LabeledData) -> Result<StoredModel, TrainingError>;
}

/// L2-regularized logistic regression, full-batch gradient descent on standardized features.
///
/// Loss is mean log-loss plus `||w||² / (2·C·n)`; the intercept is not penalized. Deterministic:
/// same data, same weights.
#[derive(Debug, Clone)]
pub struct LogisticRegressionTrainer {
    pub c: f64,
    pub learning_rate: f64,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for LogisticRegressionTrainer {
    fn default() -> Self { Self { c: 1.0, learning_rate: 1.0, max_iter: 10_000, tol: 1e-4 } }
}

impl Trainer for LogisticRegressionTrainer {
    fn name(&self) -> &'static str { "logistic_regression" }

    fn fit(&self, data: &LabeledData) -> Result<StoredModel, TrainingError> {
        if data.is_empty() { return Err(TrainingError::EmptyDataset); }
        let n = data.len() as f64;
        let d = data.features.columns().len();

        let mut means = Vec::with_capacity(d);
        let mut scales = Vec::with_capacity(d);
        for j in 0..d {
            let mean = data.features.column(j).sum::<f64>() / n;
            let var = data.features.column(j).map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            means.push(mean);
            scales.push(if var > 0.0 { var.sqrt() } else { 1.0 });
        }
        let x: Vec<Vec<f64>> = data.features.rows().iter()
            .map(|r| r.iter().zip(&means).zip(&scales).map(|((v, m), s)| (v - m) / s).collect())
            .collect();
        let y: Vec<f64> = data.labels.iter().map(|&l| f64::from(l)).collect();

        let mut w = vec![0.0; d];
        let mut b = 0.0;
        let mut converged = false;
        for iter in 0..self.max_iter {
            let mut grad_w: Vec<f64> = w.iter().map(|wj| wj / (self.c * n)).collect();
            let mut grad_b = 0.0;
            for (row, &yi) in x.iter().zip(&y) {
                let z = b + row.iter().zip(&w).map(|(a, c)| a * c).sum::<f64>();
                let err = (sigmoid(z) - yi) / n;
                for (g, xj) in grad_w.iter_mut().zip(row) { *g += err * xj; }
                grad_b += err;
            }
            let max_grad = grad_w.iter().fold(grad_b.abs(), |acc, g| acc.max(g.abs()));
            if !max_grad.is_finite() { return Err(TrainingError::Diverged(format!("non-finite gradient at iteration {iter}"))); }
            if max_grad < self.tol {
                debug!(iter, max_grad, "gradient descent converged");
                converged = true;
                break;
            }
            for (wj, g) in w.iter_mut().zip(&grad_w) { *wj -= self.learning_rate * g; }
            b -= self.learning_rate * grad_b;
        }
        if !converged { warn!(max_iter = self.max_iter, "gradient descent hit iteration cap"); }

        Ok(StoredModel::LogisticRegression(LogisticRegression {
            features: data.features.columns().to_vec(),
            means,
            scales,
            weights: w,
            intercept: b,
        }))
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 { 1.0 / (1.0 + (-z).exp()) } else { let e = z.exp(); e / (1.0 + e) }
}

/// Fit on the merged dataset and write the artifact into the model directory.
#[instrument(skip_all, fields(trainer = trainer.name()))]
pub fn train_and_save(cfg: &PipelineConfig, trainer: &dyn Trainer) -> Result<StoredModel, TrainingError> {
    let data = LabeledData::from_csv(&cfg.merged_dataset_path())?;
    let model = trainer.fit(&data)?;
    save_model(&cfg.model_path(), &model)?;
    info!(rows = data.len(), path = %cfg.model_path().display(), "model trained");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classifier;
    use crate::schema::{FeatureMatrix, FEATURE_COLUMNS};

    fn data(rows: Vec<Vec<f64>>, labels: Vec<u8>) -> LabeledData {
        LabeledData { features: FeatureMatrix::new(FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(), rows), labels }
    }

    #[test]
    fn separates_linearly_separable_rows() {
        let d = data(
            vec![vec![1.0, 10.0, 5.0], vec![2.0, 12.0, 5.0], vec![3.0, 9.0, 5.0], vec![40.0, 11.0, 5.0], vec![45.0, 10.0, 5.0], vec![50.0, 12.0, 5.0]],
            vec![0, 0, 0, 1, 1, 1],
        );
        let model = LogisticRegressionTrainer::default().fit(&d).unwrap();
        assert_eq!(model.predict(&d.features).unwrap(), d.labels);
    }

    #[test]
    fn fit_is_deterministic() {
        let d = data(vec![vec![1.0, 2.0, 3.0], vec![3.0, 1.0, 2.0], vec![2.0, 3.0, 1.0]], vec![0, 1, 1]);
        let t = LogisticRegressionTrainer::default();
        assert_eq!(t.fit(&d).unwrap(), t.fit(&d).unwrap());
    }

    #[test]
    fn constant_column_does_not_poison_weights() {
        let d = data(vec![vec![1.0, 7.0, 7.0], vec![9.0, 7.0, 7.0]], vec![0, 1]);
        let StoredModel::LogisticRegression(lr) = LogisticRegressionTrainer::default().fit(&d).unwrap();
        assert!(lr.weights.iter().all(|w| w.is_finite()));
        assert_eq!(lr.scales[1], 1.0);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        assert!(matches!(LogisticRegressionTrainer::default().fit(&LabeledData::default()), Err(TrainingError::EmptyDataset)));
    }
}
