//! Bulk feature materialisation.
//!
//! `FeatureEngine` turns an ordered OHLCV series into a column-major
//! `FeatureMatrix`. Every kernel is trailing-window only, so the row at
//! index `i` depends exclusively on bars `0..=i`.

use chrono::{DateTime, Utc};
use market_core::{validate_series, Bar, CoreError, CoreResult};
use serde::{Deserialize, Serialize};

use crate::indicators as ind;
use crate::schema::FeatureSchema;

/// One dense feature row bound to a schema version. NaN marks a feature
/// still inside its warmup window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
}

impl FeatureRow {
    pub fn is_complete(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Column-major feature matrix with a schema header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub schema_version: String,
    pub names: Vec<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    /// columns[k][i] = feature k at row i
    pub columns: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn cols(&self) -> usize {
        self.columns.len()
    }

    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.columns[col][row]
    }

    pub fn row(&self, i: usize) -> FeatureRow {
        FeatureRow {
            schema_version: self.schema_version.clone(),
            timestamp: self.timestamps[i],
            values: self.columns.iter().map(|c| c[i]).collect(),
        }
    }

    pub fn last_row(&self) -> Option<FeatureRow> {
        if self.rows() == 0 {
            None
        } else {
            Some(self.row(self.rows() - 1))
        }
    }

    /// Rows where every feature is defined (outside all warmup windows).
    pub fn complete_row_indices(&self) -> Vec<usize> {
        (0..self.rows())
            .filter(|&i| self.columns.iter().all(|c| c[i].is_finite()))
            .collect()
    }
}

/// Deterministic feature materialiser for one schema version.
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    schema: FeatureSchema,
}

impl FeatureEngine {
    pub fn new(schema: FeatureSchema) -> Self {
        Self { schema }
    }

    pub fn for_version(version: &str) -> CoreResult<Self> {
        let schema = FeatureSchema::for_version(version).ok_or_else(|| {
            CoreError::InvalidConfig(format!("unknown feature set version {version}"))
        })?;
        Ok(Self::new(schema))
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn warmup(&self) -> usize {
        self.schema.warmup()
    }

    /// Materialise the full N×K matrix for a validated series.
    pub fn materialize(&self, symbol: &str, bars: &[Bar]) -> CoreResult<FeatureMatrix> {
        validate_series(bars)?;
        if bars.len() < self.warmup() {
            return Err(CoreError::InsufficientHistory {
                symbol: symbol.to_string(),
                have: bars.len(),
                need: self.warmup(),
            });
        }

        let columns = self.compute_columns(bars);
        debug_assert_eq!(columns.len(), self.schema.len());

        Ok(FeatureMatrix {
            schema_version: self.schema.version.clone(),
            names: self.schema.names().iter().map(|s| s.to_string()).collect(),
            timestamps: bars.iter().map(|b| b.timestamp).collect(),
            columns,
        })
    }

    /// The feature row for the final bar of the series.
    pub fn latest_row(&self, symbol: &str, bars: &[Bar]) -> CoreResult<FeatureRow> {
        let matrix = self.materialize(symbol, bars)?;
        matrix
            .last_row()
            .ok_or_else(|| CoreError::InvalidData(format!("empty series for {symbol}")))
    }

    fn compute_columns(&self, bars: &[Bar]) -> Vec<Vec<f64>> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let mut columns = Vec::with_capacity(self.schema.len());

        // returns
        for h in [1usize, 2, 3, 5, 10, 20] {
            columns.push(ind::returns(&closes, h));
        }
        // realised volatility
        for w in [5usize, 10, 20] {
            columns.push(ind::realised_vol(&closes, w));
        }
        // SMA ratios
        for p in [5usize, 10, 20, 50] {
            columns.push(ind::ratio(&closes, &ind::sma(&closes, p)));
        }
        // EMA ratios
        for p in [9usize, 12, 21, 26, 50] {
            columns.push(ind::ratio(&closes, &ind::ema(&closes, p)));
        }
        // MACD, close-normalised so models see scale-free inputs
        let macd = ind::macd(&closes, 12, 26, 9);
        columns.push(normalise_by(&macd.line, &closes));
        columns.push(normalise_by(&macd.signal, &closes));
        columns.push(normalise_by(&macd.histogram, &closes));
        // RSI
        for p in [7usize, 14, 21] {
            columns.push(ind::rsi(&closes, p));
        }
        // Bollinger
        let bb = ind::bollinger(&closes, 20, 2.0);
        columns.push(bb.width.clone());
        columns.push(bb.position.clone());
        columns.push(ind::ratio(&closes, &bb.middle));
        columns.push(ind::ratio(&closes, &bb.upper));
        columns.push(ind::ratio(&closes, &bb.lower));
        // ATR as a fraction of close
        columns.push(normalise_by(&ind::atr(bars, 14), &closes));
        // ADX
        columns.push(ind::adx(bars, 14).adx);
        // oscillators
        let stoch = ind::stochastic(bars, 14, 3);
        columns.push(stoch.k);
        columns.push(stoch.d);
        columns.push(ind::williams_r(bars, 14));
        columns.push(ind::cci(bars, 20));
        // rate of change
        for p in [5usize, 10, 20] {
            columns.push(ind::roc(&closes, p));
        }
        // volume
        columns.push(ind::zscore(&ind::obv(bars), 20));
        columns.push(ind::zscore(&volumes, 20));
        // Ichimoku, price-relative
        let ichi = ind::ichimoku(bars, 9, 26, 26);
        columns.push(ind::ratio(&closes, &ichi.conversion));
        columns.push(ind::ratio(&closes, &ichi.base));
        columns.push(ind::ratio(&closes, &ichi.leading_a));
        columns.push(ichi.lagging);
        // MA cross ratios
        columns.push(ind::ratio(&ind::sma(&closes, 5), &ind::sma(&closes, 20)));
        columns.push(ind::ratio(&ind::sma(&closes, 20), &ind::sma(&closes, 50)));
        columns.push(ind::ratio(&ind::ema(&closes, 12), &ind::ema(&closes, 26)));
        // price position within rolling range
        columns.push(ind::range_position(bars, 20));
        columns.push(ind::range_position(bars, 50));

        columns
    }
}

/// Divide an aligned series by a reference series, NaN-propagating.
fn normalise_by(series: &[f64], reference: &[f64]) -> Vec<f64> {
    series
        .iter()
        .zip(reference.iter())
        .map(|(v, r)| {
            if v.is_finite() && r.is_finite() && *r != 0.0 {
                v / r
            } else if v.is_finite() {
                0.0
            } else {
                f64::NAN
            }
        })
        .collect()
}
