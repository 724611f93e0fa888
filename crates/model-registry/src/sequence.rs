//! Sequence predictor: a logistic head over an exponentially time-decayed
//! pool of the trailing feature-row window. Optional at runtime.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use feature_engine::{FeatureMatrix, FeatureRow};
use market_core::{CoreError, CoreResult, ModelKind};

use crate::logistic::contextualise;
use crate::math::{apply_logistic, fit_logistic, Standardizer};
use crate::predictor::{check_schema, Predictor, TrainOptions};

const PAYLOAD_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceHyperparams {
    /// Trailing rows pooled into one input.
    pub window: usize,
    /// Per-step decay applied to older rows, in (0, 1].
    pub decay: f64,
    pub l2: f64,
    pub learning_rate: f64,
    pub iterations: usize,
}

impl Default for SequenceHyperparams {
    fn default() -> Self {
        Self {
            window: 10,
            decay: 0.8,
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
    hyper: SequenceHyperparams,
    fitted: Option<FittedState>,
}

pub struct SequencePredictor {
    model_id: String,
    feature_set_version: String,
    hyper: SequenceHyperparams,
    fitted: Option<FittedState>,
}

impl SequencePredictor {
    pub fn new(model_id: impl Into<String>, feature_set_version: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            feature_set_version: feature_set_version.into(),
            hyper: SequenceHyperparams::default(),
            fitted: None,
        }
    }

    pub fn with_hyperparams(mut self, hyper: SequenceHyperparams) -> Self {
        self.hyper = hyper;
        self
    }

    pub fn from_payload(model_id: &str, payload: &serde_json::Value) -> CoreResult<Self> {
        let payload: Payload = serde_json::from_value(payload.clone()).map_err(|e| {
            CoreError::Persistence(format!("sequence payload for {model_id}: {e}"))
        })?;
        if payload.format != PAYLOAD_FORMAT {
            return Err(CoreError::UnreadableState(format!(
                "sequence payload format {} for {model_id}, expected {PAYLOAD_FORMAT}",
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

    /// Decay-weighted pool of standardised rows, newest last.
    fn pool(&self, standardizer: &Standardizer, rows: &[&[f64]]) -> Vec<f64> {
        let cols = standardizer.means.len();
        let mut pooled = vec![0.0; cols];
        let mut weight_sum = 0.0;
        let newest = rows.len() - 1;
        for (i, row) in rows.iter().enumerate() {
            let age = (newest - i) as i32;
            let w = self.hyper.decay.powi(age);
            let std_row = standardizer.transform(row);
            for c in 0..cols {
                pooled[c] += w * std_row[c];
            }
            weight_sum += w;
        }
        for v in pooled.iter_mut() {
            *v /= weight_sum;
        }
        pooled
    }
}

impl Predictor for SequencePredictor {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Sequence
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

        let complete = matrix.complete_row_indices();
        let complete_set: std::collections::HashSet<usize> = complete.iter().copied().collect();
        let w = self.hyper.window;

        // raw rows cached once; the pool standardises on demand
        let raw_rows: Vec<Vec<f64>> = (0..matrix.rows()).map(|i| matrix.row(i).values).collect();

        // fit the standardizer over complete rows only
        let fit_rows: Vec<Vec<f64>> = complete.iter().map(|&i| raw_rows[i].clone()).collect();
        if fit_rows.is_empty() {
            return Err(CoreError::InsufficientData {
                model_id: self.model_id.clone(),
                rows: 0,
                need: opts.min_rows,
            });
        }
        let standardizer = Standardizer::fit(&fit_rows, matrix.cols());

        let mut pooled_rows = Vec::new();
        let mut targets = Vec::new();
        for i in 0..matrix.rows() {
            if i + 1 < w {
                continue;
            }
            let window_ok = (i + 1 - w..=i).all(|j| complete_set.contains(&j));
            if !window_ok {
                continue;
            }
            if let Some(Some(up)) = labels.get(i) {
                let window: Vec<&[f64]> =
                    (i + 1 - w..=i).map(|j| raw_rows[j].as_slice()).collect();
                pooled_rows.push(self.pool(&standardizer, &window));
                targets.push(if *up { 1.0 } else { 0.0 });
            }
        }

        if pooled_rows.len() < opts.min_rows {
            return Err(CoreError::InsufficientData {
                model_id: self.model_id.clone(),
                rows: pooled_rows.len(),
                need: opts.min_rows,
            });
        }

        let x = DMatrix::from_fn(pooled_rows.len(), matrix.cols(), |i, j| pooled_rows[i][j]);
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
        self.predict_window(std::slice::from_ref(row))
    }

    fn predict_window(&self, rows: &[FeatureRow]) -> CoreResult<f64> {
        let fitted = self.fitted.as_ref().ok_or_else(|| CoreError::PredictionFailed {
            model_id: self.model_id.clone(),
            reason: "model not trained".into(),
        })?;
        if rows.is_empty() {
            return Err(CoreError::PredictionFailed {
                model_id: self.model_id.clone(),
                reason: "empty feature window".into(),
            });
        }
        for row in rows {
            check_schema(&self.model_id, &self.feature_set_version, row)?;
        }

        // use at most the trailing `window` rows
        let start = rows.len().saturating_sub(self.hyper.window);
        let window: Vec<&[f64]> = rows[start..].iter().map(|r| r.values.as_slice()).collect();
        let pooled = self.pool(&fitted.standardizer, &window);
        let w = DVector::from_vec(fitted.weights.clone());
        Ok(apply_logistic(&w, &pooled))
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
