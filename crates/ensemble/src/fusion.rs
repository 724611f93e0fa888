//! Per-timeframe fusion of predictor outputs into one probability.

use std::collections::HashMap;

use market_core::{CoreError, CoreResult, EnsembleMethod};

use crate::stacking::StackingMeta;

/// One surviving predictor output entering the fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub model_id: String,
    pub probability: f64,
}

/// The fused result for one timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedSignal {
    pub probability: f64,
    pub confidence: f64,
    pub method: EnsembleMethod,
    /// Renormalised weights actually applied, by model id.
    pub weights: HashMap<String, f64>,
}

/// Fuse predictor outputs under the tracker's weight vector.
///
/// Outputs whose model carries zero (or no) weight are dropped, after
/// which the remaining weights are renormalised to sum to 1. With nothing
/// left the call fails with `NoActivePredictors`.
pub fn fuse(
    method: EnsembleMethod,
    ticker: &str,
    outputs: &[ModelOutput],
    tracker_weights: &HashMap<String, f64>,
    stacker: Option<&StackingMeta>,
) -> CoreResult<FusedSignal> {
    let mut survivors: Vec<(&ModelOutput, f64)> = outputs
        .iter()
        .filter_map(|o| {
            let w = tracker_weights.get(&o.model_id).copied().unwrap_or(0.0);
            if w > 0.0 {
                Some((o, w))
            } else {
                None
            }
        })
        .collect();

    // With no tracked weight anywhere, fall back to equal weighting over
    // whatever predicted; staleness must never block inference.
    if survivors.is_empty() && !outputs.is_empty() {
        let w = 1.0 / outputs.len() as f64;
        survivors = outputs.iter().map(|o| (o, w)).collect();
    }
    if survivors.is_empty() {
        return Err(CoreError::NoActivePredictors(ticker.to_string()));
    }

    let total: f64 = survivors.iter().map(|(_, w)| w).sum();
    let normalised: Vec<(&ModelOutput, f64)> =
        survivors.into_iter().map(|(o, w)| (o, w / total)).collect();

    let result = match method {
        EnsembleMethod::WeightedAverage => weighted_average(&normalised),
        EnsembleMethod::MajorityVote => majority_vote(&normalised),
        EnsembleMethod::Stacking => match stacker.filter(|s| s.is_trained()) {
            Some(s) => stacked(s, &normalised),
            None => {
                tracing::warn!(ticker, "stacking meta-model unavailable, using weighted average");
                weighted_average(&normalised)
            }
        },
    };

    debug_assert!((result.weights.values().sum::<f64>() - 1.0).abs() < 1e-9);
    Ok(result)
}

fn weight_map(normalised: &[(&ModelOutput, f64)]) -> HashMap<String, f64> {
    normalised
        .iter()
        .map(|(o, w)| (o.model_id.clone(), *w))
        .collect()
}

/// Weighted mean probability; confidence shrinks with weighted spread.
fn weighted_average(normalised: &[(&ModelOutput, f64)]) -> FusedSignal {
    let p_bar: f64 = normalised.iter().map(|(o, w)| w * o.probability).sum();
    let variance: f64 = normalised
        .iter()
        .map(|(o, w)| w * (o.probability - p_bar).powi(2))
        .sum();
    let confidence = (1.0 - 2.0 * variance.sqrt()).clamp(0.0, 1.0);

    FusedSignal {
        probability: p_bar.clamp(0.0, 1.0),
        confidence,
        method: EnsembleMethod::WeightedAverage,
        weights: weight_map(normalised),
    }
}

/// Each output votes at the 0.5 line; the majority side wins and the
/// majority fraction becomes the confidence.
fn majority_vote(normalised: &[(&ModelOutput, f64)]) -> FusedSignal {
    let ups: Vec<&ModelOutput> = normalised
        .iter()
        .filter(|(o, _)| o.probability >= 0.5)
        .map(|(o, _)| *o)
        .collect();
    let downs: Vec<&ModelOutput> = normalised
        .iter()
        .filter(|(o, _)| o.probability < 0.5)
        .map(|(o, _)| *o)
        .collect();
    let n = normalised.len() as f64;

    let (probability, confidence) = if ups.len() == downs.len() {
        // deadlock: report the overall mean at even odds
        let mean = normalised.iter().map(|(o, _)| o.probability).sum::<f64>() / n;
        (mean, 0.5)
    } else {
        let majority = if ups.len() > downs.len() { &ups } else { &downs };
        let mean = majority.iter().map(|o| o.probability).sum::<f64>() / majority.len() as f64;
        (mean, majority.len() as f64 / n)
    };

    FusedSignal {
        probability: probability.clamp(0.0, 1.0),
        confidence,
        method: EnsembleMethod::MajorityVote,
        weights: weight_map(normalised),
    }
}

/// Learned meta-model over component probabilities.
fn stacked(stacker: &StackingMeta, normalised: &[(&ModelOutput, f64)]) -> FusedSignal {
    let by_id: HashMap<&str, f64> = normalised
        .iter()
        .map(|(o, _)| (o.model_id.as_str(), o.probability))
        .collect();
    let probability = stacker.predict(&by_id);

    // spread of the components still drives the confidence
    let n = normalised.len() as f64;
    let mean = normalised.iter().map(|(o, _)| o.probability).sum::<f64>() / n;
    let variance = normalised
        .iter()
        .map(|(o, _)| (o.probability - mean).powi(2))
        .sum::<f64>()
        / n;
    let confidence = (1.0 - 2.0 * variance.sqrt()).clamp(0.0, 1.0);

    FusedSignal {
        probability,
        confidence,
        method: EnsembleMethod::Stacking,
        weights: weight_map(normalised),
    }
}
