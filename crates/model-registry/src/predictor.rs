use std::time::Instant;

use feature_engine::{FeatureMatrix, FeatureRow};
use market_core::{CoreError, CoreResult, ModelKind};

/// Knobs common to every training run.
#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    /// Wall-clock ceiling; breach fails the run with `TrainingTimedOut`.
    pub deadline: Option<Instant>,
    /// Minimum labelled rows below which training is refused.
    pub min_rows: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            min_rows: 60,
        }
    }
}

/// Common contract for every model kind the registry can own.
///
/// `predict` must be deterministic given fitted state, and
/// `deserialize(serialize(m))` must reproduce `m`'s predictions exactly
/// (JSON preserves finite f64 bit patterns; tests pin 1e-12).
pub trait Predictor: Send + Sync {
    fn model_id(&self) -> &str;
    fn kind(&self) -> ModelKind;
    fn feature_set_version(&self) -> &str;
    fn is_trained(&self) -> bool;

    fn train(
        &mut self,
        matrix: &FeatureMatrix,
        labels: &[Option<bool>],
        opts: &TrainOptions,
    ) -> CoreResult<()>;

    /// Probability of an upward move for a single feature row.
    fn predict(&self, row: &FeatureRow) -> CoreResult<f64>;

    /// Multi-row variant; non-sequence kinds read only the final row.
    fn predict_window(&self, rows: &[FeatureRow]) -> CoreResult<f64> {
        match rows.last() {
            Some(row) => self.predict(row),
            None => Err(CoreError::PredictionFailed {
                model_id: self.model_id().to_string(),
                reason: "empty feature window".into(),
            }),
        }
    }

    /// Versioned JSON payload; the registry never introspects it.
    fn serialize(&self) -> CoreResult<serde_json::Value>;
}

/// Rebuild a predictor from its persisted payload.
pub fn deserialize_predictor(
    model_id: &str,
    kind: ModelKind,
    payload: &serde_json::Value,
) -> CoreResult<Box<dyn Predictor>> {
    match kind {
        ModelKind::Logistic => Ok(Box::new(crate::logistic::LogisticPredictor::from_payload(
            model_id, payload,
        )?)),
        ModelKind::Gbdt => Ok(Box::new(crate::gbdt::GbdtPredictor::from_payload(
            model_id, payload,
        )?)),
        ModelKind::Sequence => Ok(Box::new(crate::sequence::SequencePredictor::from_payload(
            model_id, payload,
        )?)),
    }
}

/// Fail with `SchemaMismatch` unless the row was produced under the
/// feature-set version the model was trained against.
pub(crate) fn check_schema(model_id: &str, expected: &str, row: &FeatureRow) -> CoreResult<()> {
    if row.schema_version != expected {
        return Err(CoreError::SchemaMismatch {
            model_id: model_id.to_string(),
            expected: expected.to_string(),
            actual: row.schema_version.clone(),
        });
    }
    Ok(())
}

/// Extract (rows, targets) for training: rows past every warmup window
/// with a realised label. Row order follows the matrix, so the result is
/// deterministic.
pub(crate) fn labelled_complete_rows(
    matrix: &FeatureMatrix,
    labels: &[Option<bool>],
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for i in matrix.complete_row_indices() {
        if let Some(Some(up)) = labels.get(i) {
            rows.push(matrix.row(i).values);
            targets.push(if *up { 1.0 } else { 0.0 });
        }
    }
    (rows, targets)
}
