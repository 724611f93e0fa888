//! Multi-timeframe consensus: blend per-timeframe fusions into the final
//! probability and corroboration-weighted confidence.

use market_core::{CoreError, CoreResult, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeframeSignal {
    pub timeframe: Timeframe,
    pub probability: f64,
    pub confidence: f64,
}

/// Final consensus over the configured timeframes.
///
/// Probability is the weight-blended mean of per-timeframe probabilities
/// (weights renormalised over the timeframes that actually produced a
/// signal). Confidence is the minimum per-timeframe confidence scaled by
/// the alignment bonus: the fraction of timeframes sitting on the same
/// side of 0.5 as the blended result.
pub fn consensus(
    ticker: &str,
    signals: &[TimeframeSignal],
    configured: &[(Timeframe, f64)],
) -> CoreResult<(f64, f64)> {
    if signals.is_empty() {
        return Err(CoreError::NoActivePredictors(format!(
            "{ticker}: no timeframe produced a signal"
        )));
    }

    let mut weighted = Vec::with_capacity(signals.len());
    for s in signals {
        let w = configured
            .iter()
            .find(|(tf, _)| *tf == s.timeframe)
            .map(|(_, w)| *w)
            .unwrap_or(0.0);
        weighted.push((s, w));
    }

    let total: f64 = weighted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return Err(CoreError::InvalidConfig(format!(
            "{ticker}: configured timeframe weights cover none of the produced signals"
        )));
    }

    let probability: f64 = weighted
        .iter()
        .map(|(s, w)| (w / total) * s.probability)
        .sum();

    let min_confidence = signals
        .iter()
        .map(|s| s.confidence)
        .fold(f64::INFINITY, f64::min);

    let final_up = probability >= 0.5;
    let aligned = signals
        .iter()
        .filter(|s| (s.probability >= 0.5) == final_up)
        .count();
    let alignment_bonus = aligned as f64 / signals.len() as f64;

    Ok((
        probability.clamp(0.0, 1.0),
        (min_confidence * alignment_bonus).clamp(0.0, 1.0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(tf: Timeframe, p: f64, c: f64) -> TimeframeSignal {
        TimeframeSignal {
            timeframe: tf,
            probability: p,
            confidence: c,
        }
    }

    fn configured() -> Vec<(Timeframe, f64)> {
        vec![
            (Timeframe::Min15, 0.25),
            (Timeframe::Hour1, 0.35),
            (Timeframe::Daily, 0.40),
        ]
    }

    #[test]
    fn aligned_timeframes_keep_min_confidence() {
        let signals = vec![
            sig(Timeframe::Min15, 0.7, 0.9),
            sig(Timeframe::Hour1, 0.65, 0.8),
            sig(Timeframe::Daily, 0.72, 0.6),
        ];
        let (p, c) = consensus("X", &signals, &configured()).unwrap();
        assert!(p > 0.6);
        // all aligned: bonus = 1.0, confidence = min = 0.6
        assert!((c - 0.6).abs() < 1e-9);
    }

    #[test]
    fn disagreeing_timeframe_cuts_the_bonus() {
        let signals = vec![
            sig(Timeframe::Min15, 0.7, 0.9),
            sig(Timeframe::Hour1, 0.8, 0.9),
            sig(Timeframe::Daily, 0.3, 0.9),
        ];
        let (p, c) = consensus("X", &signals, &configured()).unwrap();
        assert!(p > 0.5);
        assert!((c - 0.9 * (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn missing_timeframes_renormalise() {
        let signals = vec![sig(Timeframe::Daily, 0.8, 0.7)];
        let (p, c) = consensus("X", &signals, &configured()).unwrap();
        assert!((p - 0.8).abs() < 1e-9);
        assert!((c - 0.7).abs() < 1e-9);
    }

    #[test]
    fn empty_signals_fail() {
        assert!(consensus("X", &[], &configured()).is_err());
    }

    #[test]
    fn unconfigured_timeframes_fail() {
        let signals = vec![sig(Timeframe::Min5, 0.8, 0.7)];
        assert!(consensus("X", &signals, &configured()).is_err());
    }
}
