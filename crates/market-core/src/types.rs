use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Reject non-finite or negative fields.
    pub fn validate(&self) -> CoreResult<()> {
        let fields = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ];
        for (name, v) in fields {
            if !v.is_finite() {
                return Err(CoreError::InvalidData(format!(
                    "bar at {} has non-finite {name}",
                    self.timestamp
                )));
            }
            if v < 0.0 {
                return Err(CoreError::InvalidData(format!(
                    "bar at {} has negative {name}",
                    self.timestamp
                )));
            }
        }
        Ok(())
    }
}

/// Check a series is valid bar-by-bar, strictly ascending and unique by timestamp.
pub fn validate_series(bars: &[Bar]) -> CoreResult<()> {
    for bar in bars {
        bar.validate()?;
    }
    for pair in bars.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(CoreError::InvalidData(format!(
                "bars out of order: {} then {}",
                pair[0].timestamp, pair[1].timestamp
            )));
        }
    }
    Ok(())
}

/// Supported trading timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    /// 5-minute bars
    Min5,
    /// 15-minute bars
    Min15,
    /// 1-hour bars
    Hour1,
    /// Daily bars
    Daily,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::Min5 => 5,
            Timeframe::Min15 => 15,
            Timeframe::Hour1 => 60,
            Timeframe::Daily => 1440,
        }
    }

    pub fn to_duration(&self) -> Duration {
        Duration::minutes(self.to_minutes())
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Timeframe::Min5 => "5min",
            Timeframe::Min15 => "15min",
            Timeframe::Hour1 => "1hour",
            Timeframe::Daily => "daily",
        }
    }

    pub fn parse(s: &str) -> Option<Timeframe> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5min" | "5m" => Some(Timeframe::Min5),
            "15min" | "15m" => Some(Timeframe::Min15),
            "1hour" | "1h" | "60min" => Some(Timeframe::Hour1),
            "daily" | "1d" | "day" => Some(Timeframe::Daily),
            _ => None,
        }
    }

    /// Bars per NSE session (~6.25 trading hours), used to size lookbacks.
    pub fn bars_per_session(&self) -> i64 {
        match self {
            Timeframe::Min5 => 75,
            Timeframe::Min15 => 25,
            Timeframe::Hour1 => 7,
            Timeframe::Daily => 1,
        }
    }
}

/// Latest quote for one instrument, as cached from the feed or REST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteEntry {
    pub instrument_key: String,
    pub last_trade_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub received_ts: DateTime<Utc>,
    pub source_ts: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
}

impl QuoteEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.ttl_deadline
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Discrete trading decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalLabel {
    StrongSell,
    Sell,
    Hold,
    Buy,
    StrongBuy,
}

impl SignalLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalLabel::StrongSell => "STRONG_SELL",
            SignalLabel::Sell => "SELL",
            SignalLabel::Hold => "HOLD",
            SignalLabel::Buy => "BUY",
            SignalLabel::StrongBuy => "STRONG_BUY",
        }
    }

    pub fn is_buy_side(&self) -> bool {
        matches!(self, SignalLabel::Buy | SignalLabel::StrongBuy)
    }

    pub fn is_sell_side(&self) -> bool {
        matches!(self, SignalLabel::Sell | SignalLabel::StrongSell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Realised,
    Expired,
}

/// Entry / stop / target levels derived from ATR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeLevels {
    pub entry: f64,
    pub stop_loss: f64,
    pub target_1: f64,
    pub target_2: f64,
}

/// Ensemble fusion method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMethod {
    WeightedAverage,
    MajorityVote,
    Stacking,
}

impl EnsembleMethod {
    pub fn parse(s: &str) -> Option<EnsembleMethod> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weighted_average" => Some(EnsembleMethod::WeightedAverage),
            "majority_vote" => Some(EnsembleMethod::MajorityVote),
            "stacking" => Some(EnsembleMethod::Stacking),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EnsembleMethod::WeightedAverage => "weighted_average",
            EnsembleMethod::MajorityVote => "majority_vote",
            EnsembleMethod::Stacking => "stacking",
        }
    }
}

/// One model's contribution to a signal, or the reason it was excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDiagnostic {
    pub model_id: String,
    pub error_kind: String,
    pub message: String,
}

/// The final per-ticker signal record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub ticker: String,
    pub as_of_ts: DateTime<Utc>,
    pub label: SignalLabel,
    pub probability: f64,
    pub confidence: f64,
    /// Absent for HOLD signals with no actionable direction.
    pub levels: Option<TradeLevels>,
    pub per_model_predictions: HashMap<String, f64>,
    pub ensemble_method: EnsembleMethod,
    pub component_weights: HashMap<String, f64>,
    pub status: SignalStatus,
    #[serde(default)]
    pub diagnostics: Vec<SignalDiagnostic>,
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Predictor families the registry can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Logistic,
    Gbdt,
    Sequence,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Logistic => "logistic",
            ModelKind::Gbdt => "gbdt",
            ModelKind::Sequence => "sequence",
        }
    }
}

/// A single immutable model prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_id: String,
    pub ticker: String,
    pub as_of_ts: DateTime<Utc>,
    pub probability_up: f64,
    pub model_version: u32,
    pub feature_version: String,
}

/// Rolling evaluation metrics for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub accuracy: f64,
    pub win_rate: f64,
    pub sharpe: f64,
    pub sample_count: usize,
    pub window_days: u32,
}

/// Registry metadata for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub kind: ModelKind,
    pub version: u32,
    pub feature_set_version: String,
    pub training_window: usize,
    pub hyperparameters: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub rolling_metrics: Option<RollingMetrics>,
}

/// Realised direction of a prediction horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    pub fn from_return(ret: f64) -> Direction {
        if ret > 0.0 {
            Direction::Up
        } else if ret < 0.0 {
            Direction::Down
        } else {
            Direction::Flat
        }
    }
}

/// One scored prediction outcome, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceObservation {
    pub model_id: String,
    pub prediction_ts: DateTime<Utc>,
    pub realised_ts: DateTime<Utc>,
    pub predicted_prob: f64,
    pub realised_direction: Direction,
    pub realised_return: f64,
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub last_price: Decimal,
    pub unrealised_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub snapshot_ts: DateTime<Utc>,
    pub cash: Decimal,
    pub total_value: Decimal,
    pub holdings: Vec<Holding>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<TradingMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Some(TradingMode::Paper),
            "live" => Some(TradingMode::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Accepted,
    Working,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub quantity: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub mode: TradingMode,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_trigger: Option<Decimal>,
    pub state: OrderState,
    pub fills: Vec<Fill>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
}

impl Order {
    pub fn filled_quantity(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }
}
