//! Shared numeric plumbing for the predictors: standardisation, imputation
//! and the deterministic logistic fit.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use market_core::{CoreError, CoreResult};

#[inline]
pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Per-column mean/std learned from training data. Missing values at
/// predict-time impute to the column mean (zero after standardisation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Standardizer {
    /// Fit over rows, skipping NaN cells per column.
    pub fn fit(rows: &[Vec<f64>], cols: usize) -> Self {
        let mut means = vec![0.0; cols];
        let mut stds = vec![1.0; cols];
        for c in 0..cols {
            let vals: Vec<f64> = rows
                .iter()
                .map(|r| r[c])
                .filter(|v| v.is_finite())
                .collect();
            if vals.is_empty() {
                continue;
            }
            let mean = vals.iter().sum::<f64>() / vals.len() as f64;
            let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / vals.len() as f64;
            means[c] = mean;
            let std = var.sqrt();
            stds[c] = if std > 1e-12 { std } else { 1.0 };
        }
        Self { means, stds }
    }

    /// Standardise one row in place, imputing NaN to the column mean.
    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(c, v)| {
                let v = if v.is_finite() { *v } else { self.means[c] };
                (v - self.means[c]) / self.stds[c]
            })
            .collect()
    }
}

/// Deterministic full-batch gradient descent on L2-regularised logistic
/// loss. Weights start at zero; `deadline` bounds wall-clock (checked per
/// iteration, training itself is uninterruptible between checks).
///
/// Returns the weight vector with the intercept in slot 0.
pub fn fit_logistic(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    l2: f64,
    learning_rate: f64,
    iterations: usize,
    deadline: Option<Instant>,
) -> CoreResult<DVector<f64>> {
    let n = x.nrows();
    let k = x.ncols();
    if n == 0 || k == 0 {
        return Err(CoreError::InvalidData("empty design matrix".into()));
    }

    let mut w = DVector::zeros(k + 1);
    let n_f = n as f64;

    for iter in 0..iterations {
        if let Some(d) = deadline {
            if Instant::now() > d {
                return Err(CoreError::TrainingTimedOut {
                    model_id: String::new(),
                    seconds: 0,
                });
            }
        }

        // predictions
        let mut grad = DVector::zeros(k + 1);
        for i in 0..n {
            let mut z = w[0];
            for j in 0..k {
                z += w[j + 1] * x[(i, j)];
            }
            let err = sigmoid(z) - y[i];
            grad[0] += err;
            for j in 0..k {
                grad[j + 1] += err * x[(i, j)];
            }
        }
        grad /= n_f;
        // no penalty on the intercept
        for j in 1..k + 1 {
            grad[j] += l2 * w[j];
        }

        w -= learning_rate * &grad;

        if w.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::TrainingFailed {
                model_id: String::new(),
                reason: format!("weights diverged at iteration {iter}"),
            });
        }
    }

    Ok(w)
}

/// Apply a fitted weight vector (intercept in slot 0) to one row.
pub fn apply_logistic(w: &DVector<f64>, row: &[f64]) -> f64 {
    let mut z = w[0];
    for (j, v) in row.iter().enumerate() {
        z += w[j + 1] * v;
    }
    sigmoid(z).clamp(0.0, 1.0)
}
