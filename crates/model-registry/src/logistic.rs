//! Baseline linear model. Always available; the ensemble falls back to it
//! when the optional kinds are absent.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use feature_engine::{FeatureMatrix, FeatureRow};
use market_core::{CoreError, CoreResult, ModelKind};

use crate::math::{apply_logistic, fit_logistic, Standardizer};
use crate::predictor::{check_schema, labelled_complete_rows, Predictor, TrainOptions};

const PAYLOAD_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticHyperparams {
    pub l2: f64,
    pub learning_rate: f64,
    pub iterations: usize,
}

impl Default for LogisticHyperparams {
    fn default() -> Self {
        Self {
            l2: 1e-3,
            learning_rate: 0.3,
            iterations: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FittedState {
    weights: Vec<f64>,
    standardizer: Standardizer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payload {
    format: u32,
    feature_set_version: String,
    hyper: LogisticHyperparams,
    fitted: Option<FittedState>,
}

pub struct LogisticPredictor {
    model_id: String,
    feature_set_version: String,
    hyper: LogisticHyperparams,
    fitted: Option<FittedState>,
}

impl LogisticPredictor {
    pub fn new(model_id: impl Into<String>, feature_set_version: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            feature_set_version: feature_set_version.into(),
            hyper: LogisticHyperparams::default(),
            fitted: None,
        }
    }

    pub fn with_hyperparams(mut self, hyper: LogisticHyperparams) -> Self {
        self.hyper = hyper;
        self
    }

    pub fn from_payload(model_id: &str, payload: &serde_json::Value) -> CoreResult<Self> {
        let payload: Payload = serde_json::from_value(payload.clone()).map_err(|e| {
            CoreError::Persistence(format!("logistic payload for {model_id}: {e}"))
        })?;
        if payload.format != PAYLOAD_FORMAT {
            return Err(CoreError::UnreadableState(format!(
                "logistic payload format {} for {model_id}, expected {PAYLOAD_FORMAT}",
                payload.format
            )));
        }
        Ok(Self {
            model_id: model_id.to_string(),
            feature_set_version: payload.feature_set_version,
            hyper: payload.hyper,
            fitted: payload.fitted,
        })
    }

    pub fn hyperparams_json(&self) -> serde_json::Value {
        serde_json::to_value(self.hyper).unwrap_or(serde_json::Value::Null)
    }
}

impl Predictor for LogisticPredictor {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Logistic
    }

    fn feature_set_version(&self) -> &str {
        &self.feature_set_version
    }

    fn is_trained(&self) -> bool {
        self.fitted.is_some()
    }

    fn train(
        &mut self,
        matrix: &FeatureMatrix,
        labels: &[Option<bool>],
        opts: &TrainOptions,
    ) -> CoreResult<()> {
        if matrix.schema_version != self.feature_set_version {
            return Err(CoreError::SchemaMismatch {
                model_id: self.model_id.clone(),
                expected: self.feature_set_version.clone(),
                actual: matrix.schema_version.clone(),
            });
        }

        let (rows, targets) = labelled_complete_rows(matrix, labels);
        if rows.len() < opts.min_rows {
            return Err(CoreError::InsufficientData {
                model_id: self.model_id.clone(),
                rows: rows.len(),
                need: opts.min_rows,
            });
        }

        let cols = matrix.cols();
        let standardizer = Standardizer::fit(&rows, cols);
        let standardized: Vec<Vec<f64>> =
            rows.iter().map(|r| standardizer.transform(r)).collect();

        let x = DMatrix::from_fn(standardized.len(), cols, |i, j| standardized[i][j]);
        let y = DVector::from_vec(targets);

        let weights = fit_logistic(
            &x,
            &y,
            self.hyper.l2,
            self.hyper.learning_rate,
            self.hyper.iterations,
            opts.deadline,
        )
        .map_err(|e| contextualise(e, &self.model_id))?;

        self.fitted = Some(FittedState {
            weights: weights.iter().copied().collect(),
            standardizer,
        });
        Ok(())
    }

    fn predict(&self, row: &FeatureRow) -> CoreResult<f64> {
        check_schema(&self.model_id, &self.feature_set_version, row)?;
        let fitted = self.fitted.as_ref().ok_or_else(|| CoreError::PredictionFailed {
            model_id: self.model_id.clone(),
            reason: "model not trained".into(),
        })?;
        let x = fitted.standardizer.transform(&row.values);
        let w = DVector::from_vec(fitted.weights.clone());
        Ok(apply_logistic(&w, &x))
    }

    fn serialize(&self) -> CoreResult<serde_json::Value> {
        let payload = Payload {
            format: PAYLOAD_FORMAT,
            feature_set_version: self.feature_set_version.clone(),
            hyper: self.hyper,
            fitted: self.fitted.clone(),
        };
        serde_json::to_value(payload)
            .map_err(|e| CoreError::Persistence(format!("serialize {}: {e}", self.model_id)))
    }
}

/// Attach the model id to errors produced by the shared fit routine.
pub(crate) fn contextualise(err: CoreError, model_id: &str) -> CoreError {
    match err {
        CoreError::TrainingTimedOut { seconds, .. } => CoreError::TrainingTimedOut {
            model_id: model_id.to_string(),
            seconds,
        },
        CoreError::TrainingFailed { reason, .. } => CoreError::TrainingFailed {
            model_id: model_id.to_string(),
            reason,
        },
        other => other,
    }
}
