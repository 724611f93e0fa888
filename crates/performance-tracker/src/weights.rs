//! Ensemble weight derivation from rolling metrics.

use std::collections::HashMap;

use market_core::RollingMetrics;

/// Weights proportional to `max(0, accuracy − 0.5) · ln(1 + count)`,
/// normalised to sum to 1. Models without usable metrics (or with edge
/// ≤ 0) contribute 0; if nothing carries weight, every active model gets
/// an equal share.
pub fn derive_weights(
    active: &[String],
    metrics: &HashMap<String, RollingMetrics>,
) -> HashMap<String, f64> {
    if active.is_empty() {
        return HashMap::new();
    }

    let raw: Vec<(String, f64)> = active
        .iter()
        .map(|id| {
            let w = metrics
                .get(id)
                .map(|m| (m.accuracy - 0.5).max(0.0) * (1.0 + m.sample_count as f64).ln())
                .unwrap_or(0.0);
            (id.clone(), w)
        })
        .collect();

    let total: f64 = raw.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        let equal = 1.0 / active.len() as f64;
        return active.iter().map(|id| (id.clone(), equal)).collect();
    }
    raw.into_iter().map(|(id, w)| (id, w / total)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(accuracy: f64, count: usize) -> RollingMetrics {
        RollingMetrics {
            accuracy,
            win_rate: accuracy,
            sharpe: 0.0,
            sample_count: count,
            window_days: 30,
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn better_models_get_more_weight() {
        let active = ids(&["good", "poor"]);
        let mut m = HashMap::new();
        m.insert("good".to_string(), metrics(0.65, 100));
        m.insert("poor".to_string(), metrics(0.55, 100));
        let w = derive_weights(&active, &m);
        assert!(w["good"] > w["poor"]);
        assert!((w.values().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sub_coinflip_models_get_zero() {
        let active = ids(&["good", "bad"]);
        let mut m = HashMap::new();
        m.insert("good".to_string(), metrics(0.6, 50));
        m.insert("bad".to_string(), metrics(0.4, 50));
        let w = derive_weights(&active, &m);
        assert_eq!(w["bad"], 0.0);
        assert!((w["good"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_usable_metrics_falls_back_to_equal() {
        let active = ids(&["a", "b", "c"]);
        let w = derive_weights(&active, &HashMap::new());
        for id in &active {
            assert!((w[id] - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn sample_count_breaks_accuracy_ties() {
        let active = ids(&["many", "few"]);
        let mut m = HashMap::new();
        m.insert("many".to_string(), metrics(0.6, 200));
        m.insert("few".to_string(), metrics(0.6, 10));
        let w = derive_weights(&active, &m);
        assert!(w["many"] > w["few"]);
    }

    #[test]
    fn empty_active_set_is_empty() {
        assert!(derive_weights(&[], &HashMap::new()).is_empty());
    }
}
