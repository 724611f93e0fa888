//! Stacking meta-model: a small logistic head over component predictor
//! probabilities, fit with the same deterministic gradient descent the
//! base predictors use.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use market_core::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingMeta {
    /// Component order; predictions are assembled into this layout.
    pub model_order: Vec<String>,
    /// Intercept in slot 0, then one weight per component.
    weights: Option<Vec<f64>>,
    pub learning_rate: f64,
    pub iterations: usize,
}

impl StackingMeta {
    pub fn new(model_order: Vec<String>) -> Self {
        Self {
            model_order,
            weights: None,
            learning_rate: 0.5,
            iterations: 400,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.weights.is_some()
    }

    /// Fit from historical `(component probabilities, outcome)` samples.
    /// Sample vectors must match `model_order` in length and order.
    pub fn train(&mut self, samples: &[(Vec<f64>, bool)]) -> CoreResult<()> {
        let k = self.model_order.len();
        if samples.is_empty() || k == 0 {
            return Err(CoreError::InsufficientData {
                model_id: "stacking-meta".into(),
                rows: samples.len(),
                need: 1,
            });
        }
        if samples.iter().any(|(x, _)| x.len() != k) {
            return Err(CoreError::InvalidData(
                "stacking sample width does not match model order".into(),
            ));
        }

        let n = samples.len() as f64;
        let mut w = vec![0.0; k + 1];
        for _ in 0..self.iterations {
            let mut grad = vec![0.0; k + 1];
            for (x, up) in samples {
                let mut z = w[0];
                for (j, v) in x.iter().enumerate() {
                    // centre the inputs so an uninformative component
                    // contributes nothing
                    z += w[j + 1] * (v - 0.5);
                }
                let err = sigmoid(z) - if *up { 1.0 } else { 0.0 };
                grad[0] += err;
                for (j, v) in x.iter().enumerate() {
                    grad[j + 1] += err * (v - 0.5);
                }
            }
            for (wj, gj) in w.iter_mut().zip(grad.iter()) {
                *wj -= self.learning_rate * gj / n;
            }
        }
        if w.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::TrainingFailed {
                model_id: "stacking-meta".into(),
                reason: "meta weights diverged".into(),
            });
        }
        self.weights = Some(w);
        Ok(())
    }

    /// Predict from per-model probabilities. Components missing from the
    /// map impute to 0.5 (no opinion).
    pub fn predict(&self, by_model: &HashMap<&str, f64>) -> f64 {
        let Some(w) = &self.weights else {
            return 0.5;
        };
        let mut z = w[0];
        for (j, id) in self.model_order.iter().enumerate() {
            let p = by_model.get(id.as_str()).copied().unwrap_or(0.5);
            z += w[j + 1] * (p - 0.5);
        }
        sigmoid(z).clamp(0.0, 1.0)
    }
}

#[inline]
fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untrained_meta_is_noncommittal() {
        let meta = StackingMeta::new(vec!["a".into(), "b".into()]);
        assert_eq!(meta.predict(&HashMap::new()), 0.5);
    }

    #[test]
    fn learns_to_trust_the_informative_component() {
        let mut meta = StackingMeta::new(vec!["good".into(), "noise".into()]);
        // "good" predicts the outcome, "noise" alternates meaninglessly
        let samples: Vec<(Vec<f64>, bool)> = (0..200)
            .map(|i| {
                let up = i % 3 != 0;
                let good = if up { 0.8 } else { 0.2 };
                let noise = if i % 2 == 0 { 0.7 } else { 0.3 };
                (vec![good, noise], up)
            })
            .collect();
        meta.train(&samples).unwrap();

        let mut up_case = HashMap::new();
        up_case.insert("good", 0.8);
        up_case.insert("noise", 0.3);
        assert!(meta.predict(&up_case) > 0.6);

        let mut down_case = HashMap::new();
        down_case.insert("good", 0.2);
        down_case.insert("noise", 0.7);
        assert!(meta.predict(&down_case) < 0.4);
    }

    #[test]
    fn missing_component_imputes_to_half() {
        let mut meta = StackingMeta::new(vec!["a".into()]);
        meta.train(&[(vec![0.9], true), (vec![0.1], false), (vec![0.8], true), (vec![0.2], false)])
            .unwrap();
        // with no inputs the centred features vanish, leaving the intercept
        let p = meta.predict(&HashMap::new());
        assert!((p - meta.predict(&HashMap::new())).abs() < 1e-12);
    }

    #[test]
    fn mismatched_sample_width_is_rejected() {
        let mut meta = StackingMeta::new(vec!["a".into(), "b".into()]);
        assert!(meta.train(&[(vec![0.5], true)]).is_err());
    }

    #[test]
    fn serde_round_trip() {
        let mut meta = StackingMeta::new(vec!["a".into()]);
        meta.train(&[(vec![0.9], true), (vec![0.1], false)]).unwrap();
        let json = serde_json::to_string(&meta).unwrap();
        let restored: StackingMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, restored);
    }
}
