//! The broker seam: everything the core needs from an upstream broker,
//! behind one async trait with well-typed error returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use market_core::{Bar, CoreError, OrderSide, OrderType, Timeframe};

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    /// Worth retrying with backoff.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("permanent broker error: {0}")]
    Permanent(String),

    #[error("broker authentication error: {0}")]
    Auth(String),

    #[error("broker rate limit: {0}")]
    RateLimited(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_) | AdapterError::RateLimited(_))
    }
}

impl From<AdapterError> for CoreError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(m) => CoreError::UpstreamTransient(m),
            AdapterError::Permanent(m) => CoreError::UpstreamPermanent(m),
            AdapterError::Auth(m) => CoreError::AuthFailed(m),
            AdapterError::RateLimited(m) => CoreError::RateLimited(m),
        }
    }
}

/// One quote event off the streaming feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteTick {
    pub instrument_key: String,
    pub ltp: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub source_ts: DateTime<Utc>,
}

/// Broker-bound order request (already validated by the router).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: u64,
    pub limit_price: Option<f64>,
    pub stop_trigger: Option<f64>,
    /// Client tag, echoed back on fills for correlation.
    pub tag: String,
}

/// Fields a working order may change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPatch {
    pub quantity: Option<u64>,
    pub limit_price: Option<f64>,
    pub stop_trigger: Option<f64>,
}

/// Everything the core consumes from a broker.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Idempotent historical fetch; callers retry transient failures with
    /// bounded backoff.
    async fn get_historical_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> AdapterResult<Vec<Bar>>;

    /// Snapshot quote over REST, used when the cache misses between
    /// stream updates.
    async fn get_quote(&self, instrument_key: &str) -> AdapterResult<QuoteTick>;

    /// Open one streaming subscription. The receiver closing signals the
    /// feed dropped; reconnect policy belongs to the caller.
    async fn subscribe_quotes(
        &self,
        instrument_keys: &[String],
    ) -> AdapterResult<mpsc::Receiver<QuoteTick>>;

    async fn place_order(&self, order: &BrokerOrderRequest) -> AdapterResult<String>;

    async fn modify_order(&self, broker_order_id: &str, patch: &OrderPatch) -> AdapterResult<()>;

    async fn cancel_order(&self, broker_order_id: &str) -> AdapterResult<()>;

    fn name(&self) -> &str;
}
