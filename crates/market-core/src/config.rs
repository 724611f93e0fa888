use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult, EnsembleMethod, Timeframe};

/// Level constants per trading style: (k_sl, k_t1, k_t2) multiples of ATR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelStyle {
    Intraday,
    Swing,
    Position,
}

impl LevelStyle {
    pub fn multipliers(&self) -> (f64, f64, f64) {
        match self {
            LevelStyle::Intraday => (1.0, 1.5, 2.5),
            LevelStyle::Swing => (1.5, 2.0, 3.5),
            LevelStyle::Position => (2.0, 3.0, 5.0),
        }
    }

    pub fn parse(s: &str) -> Option<LevelStyle> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intraday" => Some(LevelStyle::Intraday),
            "swing" => Some(LevelStyle::Swing),
            "position" => Some(LevelStyle::Position),
            _ => None,
        }
    }
}

/// Probability / confidence cut-offs for the label mapping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelThresholds {
    pub strong_buy_prob: f64,
    pub buy_prob: f64,
    pub sell_prob: f64,
    pub strong_sell_prob: f64,
    pub strong_confidence: f64,
}

impl Default for LabelThresholds {
    fn default() -> Self {
        Self {
            strong_buy_prob: 0.70,
            buy_prob: 0.55,
            sell_prob: 0.45,
            strong_sell_prob: 0.30,
            strong_confidence: 0.60,
        }
    }
}

/// All recognised configuration, env-driven with defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where persisted state lives (registry/, predictions.log, snapshots.db, cache/)
    pub data_dir: PathBuf,
    pub feature_set_version: String,

    // Ensemble
    pub timeframes: Vec<Timeframe>,
    /// Must sum to 1.0, same length as `timeframes`
    pub timeframe_weights: Vec<f64>,
    pub ensemble_method: EnsembleMethod,
    pub label_thresholds: LabelThresholds,
    pub level_style: LevelStyle,
    pub min_confidence: f64,
    /// Horizon, in bars of the trained timeframe, for direction labels.
    pub label_horizon_bars: usize,

    // Market data cache
    pub cache_ttl: Duration,
    pub cache_capacity: usize,

    // Snapshotter
    pub snapshot_interval: Duration,
    pub session_end_time: NaiveTime,
    /// Snapshots older than this many days are pruned.
    pub snapshot_retention_days: u32,

    // Performance tracker
    pub tracker_window_days: u32,
    pub min_observations: usize,

    // Order router
    pub paper_slippage_bps: f64,
    pub max_order_quantity: u64,
    pub max_position_value: f64,

    // Paper book seed
    pub paper_starting_cash: f64,

    // Training
    pub training_timeout_secs: u64,

    // API bind address
    pub bind_addr: String,

    /// Instruments the process tracks by default: streamed, tradable,
    /// and settled in the background.
    pub watchlist: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            feature_set_version: "v1".to_string(),
            timeframes: vec![Timeframe::Min15, Timeframe::Hour1, Timeframe::Daily],
            timeframe_weights: vec![0.25, 0.35, 0.40],
            ensemble_method: EnsembleMethod::WeightedAverage,
            label_thresholds: LabelThresholds::default(),
            level_style: LevelStyle::Swing,
            min_confidence: 0.60,
            label_horizon_bars: 5,
            cache_ttl: Duration::from_secs(5),
            cache_capacity: 2048,
            snapshot_interval: Duration::from_secs(15 * 60),
            session_end_time: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            snapshot_retention_days: 365,
            tracker_window_days: 30,
            min_observations: 20,
            paper_slippage_bps: 5.0,
            max_order_quantity: 10_000,
            max_position_value: 1_000_000.0,
            paper_starting_cash: 1_000_000.0,
            training_timeout_secs: 120,
            bind_addr: "127.0.0.1:8080".to_string(),
            watchlist: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> CoreResult<T> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| CoreError::InvalidConfig(format!("{key}={v} is not valid"))),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load from environment (with `.env` support), then validate.
    pub fn from_env() -> CoreResult<Self> {
        dotenvy::dotenv().ok();
        let d = AppConfig::default();

        let timeframes = match env::var("TIMEFRAMES") {
            Ok(v) => v
                .split(',')
                .map(|s| {
                    Timeframe::parse(s)
                        .ok_or_else(|| CoreError::InvalidConfig(format!("unknown timeframe {s}")))
                })
                .collect::<CoreResult<Vec<_>>>()?,
            Err(_) => d.timeframes.clone(),
        };

        let timeframe_weights = match env::var("TIMEFRAME_WEIGHTS") {
            Ok(v) => v
                .split(',')
                .map(|s| {
                    s.trim().parse::<f64>().map_err(|_| {
                        CoreError::InvalidConfig(format!("bad timeframe weight {s}"))
                    })
                })
                .collect::<CoreResult<Vec<_>>>()?,
            Err(_) => d.timeframe_weights.clone(),
        };

        let ensemble_method = match env::var("ENSEMBLE_METHOD") {
            Ok(v) => EnsembleMethod::parse(&v)
                .ok_or_else(|| CoreError::InvalidConfig(format!("unknown ensemble method {v}")))?,
            Err(_) => d.ensemble_method,
        };

        let level_style = match env::var("LEVEL_STYLE") {
            Ok(v) => LevelStyle::parse(&v)
                .ok_or_else(|| CoreError::InvalidConfig(format!("unknown level style {v}")))?,
            Err(_) => d.level_style,
        };

        let session_end_time = match env::var("SESSION_END_TIME") {
            Ok(v) => NaiveTime::parse_from_str(&v, "%H:%M")
                .map_err(|_| CoreError::InvalidConfig(format!("bad SESSION_END_TIME {v}")))?,
            Err(_) => d.session_end_time,
        };

        let thresholds = LabelThresholds {
            strong_buy_prob: env_parse("LABEL_STRONG_BUY_PROB", d.label_thresholds.strong_buy_prob)?,
            buy_prob: env_parse("LABEL_BUY_PROB", d.label_thresholds.buy_prob)?,
            sell_prob: env_parse("LABEL_SELL_PROB", d.label_thresholds.sell_prob)?,
            strong_sell_prob: env_parse(
                "LABEL_STRONG_SELL_PROB",
                d.label_thresholds.strong_sell_prob,
            )?,
            strong_confidence: env_parse(
                "LABEL_STRONG_CONFIDENCE",
                d.label_thresholds.strong_confidence,
            )?,
        };

        let config = Self {
            data_dir: PathBuf::from(
                env::var("DATA_DIR").unwrap_or_else(|_| d.data_dir.display().to_string()),
            ),
            feature_set_version: env::var("FEATURE_SET_VERSION")
                .unwrap_or_else(|_| d.feature_set_version.clone()),
            timeframes,
            timeframe_weights,
            ensemble_method,
            label_thresholds: thresholds,
            level_style,
            min_confidence: env_parse("MIN_CONFIDENCE", d.min_confidence)?,
            label_horizon_bars: env_parse("LABEL_HORIZON_BARS", d.label_horizon_bars)?,
            cache_ttl: Duration::from_millis(env_parse(
                "CACHE_TTL_MS",
                d.cache_ttl.as_millis() as u64,
            )?),
            cache_capacity: env_parse("CACHE_CAPACITY", d.cache_capacity)?,
            snapshot_interval: Duration::from_secs(env_parse(
                "SNAPSHOT_INTERVAL_SECS",
                d.snapshot_interval.as_secs(),
            )?),
            session_end_time,
            snapshot_retention_days: env_parse(
                "SNAPSHOT_RETENTION_DAYS",
                d.snapshot_retention_days,
            )?,
            tracker_window_days: env_parse("TRACKER_WINDOW_DAYS", d.tracker_window_days)?,
            min_observations: env_parse("MIN_OBSERVATIONS", d.min_observations)?,
            paper_slippage_bps: env_parse("PAPER_SLIPPAGE_BPS", d.paper_slippage_bps)?,
            max_order_quantity: env_parse("MAX_ORDER_QUANTITY", d.max_order_quantity)?,
            max_position_value: env_parse("MAX_POSITION_VALUE", d.max_position_value)?,
            paper_starting_cash: env_parse("PAPER_STARTING_CASH", d.paper_starting_cash)?,
            training_timeout_secs: env_parse("TRAINING_TIMEOUT_SECS", d.training_timeout_secs)?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| d.bind_addr.clone()),
            watchlist: match env::var("WATCHLIST") {
                Ok(v) => v
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                Err(_) => d.watchlist.clone(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run under.
    pub fn validate(&self) -> CoreResult<()> {
        if self.timeframes.is_empty() {
            return Err(CoreError::InvalidConfig("timeframes is empty".into()));
        }
        if self.timeframes.len() != self.timeframe_weights.len() {
            return Err(CoreError::InvalidConfig(format!(
                "{} timeframes but {} weights",
                self.timeframes.len(),
                self.timeframe_weights.len()
            )));
        }
        if self.timeframe_weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(CoreError::InvalidConfig(
                "timeframe weights must be finite and non-negative".into(),
            ));
        }
        let sum: f64 = self.timeframe_weights.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(CoreError::InvalidConfig(format!(
                "timeframe weights sum to {sum}, expected 1.0"
            )));
        }
        let t = &self.label_thresholds;
        if !(t.strong_sell_prob < t.sell_prob
            && t.sell_prob < t.buy_prob
            && t.buy_prob < t.strong_buy_prob)
        {
            return Err(CoreError::InvalidConfig(
                "label thresholds must be ordered strong_sell < sell < buy < strong_buy".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(CoreError::InvalidConfig(format!(
                "min_confidence {} outside [0,1]",
                self.min_confidence
            )));
        }
        if self.label_horizon_bars == 0 {
            return Err(CoreError::InvalidConfig("label_horizon_bars must be > 0".into()));
        }
        if self.cache_capacity == 0 {
            return Err(CoreError::InvalidConfig("cache_capacity must be > 0".into()));
        }
        if self.max_order_quantity == 0 {
            return Err(CoreError::InvalidConfig("max_order_quantity must be > 0".into()));
        }
        if self.paper_slippage_bps < 0.0 {
            return Err(CoreError::InvalidConfig("paper_slippage_bps must be >= 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut cfg = AppConfig::default();
        cfg.timeframe_weights = vec![0.5, 0.2, 0.2];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn weight_count_must_match_timeframes() {
        let mut cfg = AppConfig::default();
        cfg.timeframe_weights = vec![0.5, 0.5];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut cfg = AppConfig::default();
        cfg.label_thresholds.buy_prob = 0.40; // below sell_prob
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn level_style_multipliers_are_ordered() {
        for style in [LevelStyle::Intraday, LevelStyle::Swing, LevelStyle::Position] {
            let (k_sl, k_t1, k_t2) = style.multipliers();
            assert!(k_sl > 0.0);
            assert!(k_t1 < k_t2);
        }
    }
}
