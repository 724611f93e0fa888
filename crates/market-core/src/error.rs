use chrono::{DateTime, Utc};
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    // Input errors — returned to the caller, no state mutation
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("insufficient history for {symbol}: have {have} bars, need {need}")]
    InsufficientHistory {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("confirmation required to enter {0} mode")]
    ConfirmationRequired(String),

    // Data errors — transient kinds are retried at the adapter boundary
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("upstream permanent failure: {0}")]
    UpstreamPermanent(String),

    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("upstream authentication failed: {0}")]
    AuthFailed(String),

    // Model errors — exclude the offending model from the current call
    #[error("insufficient data to train {model_id}: {rows} labelled rows, need {need}")]
    InsufficientData {
        model_id: String,
        rows: usize,
        need: usize,
    },

    #[error("training failed for {model_id}: {reason}")]
    TrainingFailed { model_id: String, reason: String },

    #[error("training timed out for {model_id} after {seconds}s")]
    TrainingTimedOut { model_id: String, seconds: u64 },

    #[error("prediction failed for {model_id}: {reason}")]
    PredictionFailed { model_id: String, reason: String },

    #[error("feature schema mismatch for {model_id}: model expects {expected}, engine provides {actual}")]
    SchemaMismatch {
        model_id: String,
        expected: String,
        actual: String,
    },

    // Consistency errors — fail loudly
    #[error("stale write for {model_id}: {attempted} does not advance {latest}")]
    StaleWrite {
        model_id: String,
        attempted: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error("registry corruption: {0}")]
    RegistryCorruption(String),

    #[error("invalid levels for {symbol}: entry={entry} stop={stop_loss} t1={target_1} t2={target_2}")]
    InvalidLevels {
        symbol: String,
        entry: f64,
        stop_loss: f64,
        target_1: f64,
        target_2: f64,
    },

    // Resource errors — callers decide whether to degrade or retry
    #[error("deadline exceeded in {0}")]
    Timeout(String),

    #[error("cancelled during {0}")]
    Cancelled(String),

    #[error("no active predictors for {0}")]
    NoActivePredictors(String),

    #[error("insufficient samples for {model_id}: {have} observations, need {need}")]
    InsufficientSamples {
        model_id: String,
        have: usize,
        need: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no signal ready for {0}")]
    NotReady(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("persisted state unreadable: {0}")]
    UnreadableState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl CoreError {
    /// Stable machine-readable code for API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidSymbol(_) => "InvalidSymbol",
            CoreError::InvalidOrder(_) => "InvalidOrder",
            CoreError::InsufficientHistory { .. } => "InsufficientHistory",
            CoreError::ConfirmationRequired(_) => "ConfirmationRequired",
            CoreError::UpstreamTransient(_) => "UpstreamTransient",
            CoreError::UpstreamPermanent(_) => "UpstreamPermanent",
            CoreError::RateLimited(_) => "RateLimited",
            CoreError::AuthFailed(_) => "AuthFailed",
            CoreError::InsufficientData { .. } => "InsufficientData",
            CoreError::TrainingFailed { .. } => "TrainingFailed",
            CoreError::TrainingTimedOut { .. } => "TrainingTimedOut",
            CoreError::PredictionFailed { .. } => "PredictionFailed",
            CoreError::SchemaMismatch { .. } => "SchemaMismatch",
            CoreError::StaleWrite { .. } => "StaleWrite",
            CoreError::RegistryCorruption(_) => "RegistryCorruption",
            CoreError::InvalidLevels { .. } => "InvalidLevels",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Cancelled(_) => "Cancelled",
            CoreError::NoActivePredictors(_) => "NoActivePredictors",
            CoreError::InsufficientSamples { .. } => "InsufficientSamples",
            CoreError::NotFound(_) => "NotFound",
            CoreError::NotReady(_) => "NotReady",
            CoreError::InvalidData(_) => "InvalidData",
            CoreError::InvalidConfig(_) => "InvalidConfig",
            CoreError::UnreadableState(_) => "UnreadableState",
            CoreError::Io(_) => "Io",
            CoreError::Persistence(_) => "Persistence",
        }
    }

    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::UpstreamTransient(_) | CoreError::RateLimited(_)
        )
    }
}
