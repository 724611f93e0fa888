//! Versioned feature schema.
//!
//! The schema is the contract between the feature engine and every trained
//! model: a fixed, ordered list of feature names plus the lookback each one
//! needs. Changing any definition in `v1()` requires a new version tag;
//! models are bound to the version they were trained against.

use serde::{Deserialize, Serialize};

/// One declared feature: stable name plus trailing-bar lookback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: &'static str,
    /// Bars of history (beyond the current bar) needed before the value is defined.
    pub lookback: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: String,
    pub features: Vec<FeatureSpec>,
}

impl FeatureSchema {
    /// The v1 feature set. Order is load-bearing: matrices and serialized
    /// model weights are indexed by position.
    pub fn v1() -> Self {
        let features = vec![
            // single-period returns over multiple horizons
            FeatureSpec { name: "ret_1", lookback: 1 },
            FeatureSpec { name: "ret_2", lookback: 2 },
            FeatureSpec { name: "ret_3", lookback: 3 },
            FeatureSpec { name: "ret_5", lookback: 5 },
            FeatureSpec { name: "ret_10", lookback: 10 },
            FeatureSpec { name: "ret_20", lookback: 20 },
            // realised volatility
            FeatureSpec { name: "vol_5", lookback: 6 },
            FeatureSpec { name: "vol_10", lookback: 11 },
            FeatureSpec { name: "vol_20", lookback: 21 },
            // close relative to simple moving averages
            FeatureSpec { name: "sma_5_ratio", lookback: 4 },
            FeatureSpec { name: "sma_10_ratio", lookback: 9 },
            FeatureSpec { name: "sma_20_ratio", lookback: 19 },
            FeatureSpec { name: "sma_50_ratio", lookback: 49 },
            // close relative to exponential moving averages
            FeatureSpec { name: "ema_9_ratio", lookback: 8 },
            FeatureSpec { name: "ema_12_ratio", lookback: 11 },
            FeatureSpec { name: "ema_21_ratio", lookback: 20 },
            FeatureSpec { name: "ema_26_ratio", lookback: 25 },
            FeatureSpec { name: "ema_50_ratio", lookback: 49 },
            // MACD(12,26,9), close-normalised
            FeatureSpec { name: "macd_line", lookback: 25 },
            FeatureSpec { name: "macd_signal", lookback: 33 },
            FeatureSpec { name: "macd_histogram", lookback: 33 },
            // RSI
            FeatureSpec { name: "rsi_7", lookback: 7 },
            FeatureSpec { name: "rsi_14", lookback: 14 },
            FeatureSpec { name: "rsi_21", lookback: 21 },
            // Bollinger(20, 2)
            FeatureSpec { name: "bb_width", lookback: 19 },
            FeatureSpec { name: "bb_position", lookback: 19 },
            FeatureSpec { name: "bb_mid_ratio", lookback: 19 },
            FeatureSpec { name: "bb_upper_ratio", lookback: 19 },
            FeatureSpec { name: "bb_lower_ratio", lookback: 19 },
            // volatility / trend strength
            FeatureSpec { name: "atr_pct", lookback: 14 },
            FeatureSpec { name: "adx_14", lookback: 28 },
            // oscillators
            FeatureSpec { name: "stoch_k", lookback: 13 },
            FeatureSpec { name: "stoch_d", lookback: 15 },
            FeatureSpec { name: "williams_r", lookback: 13 },
            FeatureSpec { name: "cci_20", lookback: 19 },
            // rate of change
            FeatureSpec { name: "roc_5", lookback: 5 },
            FeatureSpec { name: "roc_10", lookback: 10 },
            FeatureSpec { name: "roc_20", lookback: 20 },
            // volume
            FeatureSpec { name: "obv_z_20", lookback: 19 },
            FeatureSpec { name: "volume_z_20", lookback: 19 },
            // Ichimoku(9, 26), price-relative
            FeatureSpec { name: "ichimoku_conversion", lookback: 8 },
            FeatureSpec { name: "ichimoku_base", lookback: 25 },
            FeatureSpec { name: "ichimoku_leading_a", lookback: 25 },
            FeatureSpec { name: "ichimoku_lagging", lookback: 26 },
            // moving-average cross ratios
            FeatureSpec { name: "ma_cross_5_20", lookback: 19 },
            FeatureSpec { name: "ma_cross_20_50", lookback: 49 },
            FeatureSpec { name: "ema_cross_12_26", lookback: 25 },
            // price position within rolling range
            FeatureSpec { name: "range_pos_20", lookback: 19 },
            FeatureSpec { name: "range_pos_50", lookback: 49 },
        ];
        Self {
            version: "v1".to_string(),
            features,
        }
    }

    /// Resolve a schema by version tag.
    pub fn for_version(version: &str) -> Option<Self> {
        match version {
            "v1" => Some(Self::v1()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.features.iter().map(|f| f.name).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|f| f.name == name)
    }

    /// Minimum series length before every feature is defined.
    pub fn warmup(&self) -> usize {
        self.features.iter().map(|f| f.lookback).max().unwrap_or(0) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_has_stable_shape() {
        let schema = FeatureSchema::v1();
        assert_eq!(schema.version, "v1");
        assert_eq!(schema.len(), 49);
        assert_eq!(schema.warmup(), 50);
    }

    #[test]
    fn v1_names_are_unique() {
        let schema = FeatureSchema::v1();
        let mut names = schema.names();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), schema.len());
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert!(FeatureSchema::for_version("v99").is_none());
    }
}
