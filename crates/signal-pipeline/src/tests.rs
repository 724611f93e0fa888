use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use broker_adapter::FakeBroker;
use feature_engine::{direction_labels, FeatureMatrix, FeatureRow};
use market_core::{
    AppConfig, Bar, CoreError, CoreResult, ModelKind, ModelMetadata, SignalLabel, SignalStatus,
    Timeframe,
};
use market_data::HistoryProvider;
use model_registry::{LogisticPredictor, ModelRegistry, Predictor, TrainOptions};
use performance_tracker::PerformanceTracker;

use crate::pipeline::SignalPipeline;

const TICKER: &str = "NSE_EQ|RELIANCE";

/// Daily bars ending just before now, mildly trending with a ripple so
/// every indicator stays defined.
fn daily_bars(n: usize) -> Vec<Bar> {
    daily_bars_ending(n, Utc::now() - chrono::Duration::minutes(1))
}

fn daily_bars_ending(n: usize, end: chrono::DateTime<Utc>) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let age = (n - 1 - i) as i64;
            let close = 2_400.0 + i as f64 * 1.4 + (i as f64 * 0.6).sin() * 12.0;
            Bar {
                timestamp: end - chrono::Duration::days(age),
                open: close - 4.0,
                high: close + 18.0,
                low: close - 18.0,
                close,
                volume: 4_000_000.0 + (i as f64 * 1.1).cos().abs() * 150_000.0,
            }
        })
        .collect()
}

fn test_config() -> AppConfig {
    AppConfig {
        timeframes: vec![Timeframe::Daily],
        timeframe_weights: vec![1.0],
        ..AppConfig::default()
    }
}

struct Harness {
    pipeline: SignalPipeline,
    broker: Arc<FakeBroker>,
}

async fn harness_with_bars(bars: Vec<Bar>) -> Harness {
    let broker = Arc::new(FakeBroker::new());
    broker.set_bars(TICKER, Timeframe::Daily, bars);
    let history = Arc::new(HistoryProvider::new(broker.clone()));
    let registry = Arc::new(ModelRegistry::in_memory());
    let tracker = Arc::new(PerformanceTracker::in_memory(30, 5));
    let pipeline = SignalPipeline::new(test_config(), history, registry, tracker).unwrap();
    Harness { pipeline, broker }
}

fn metadata(id: &str, kind: ModelKind) -> ModelMetadata {
    ModelMetadata {
        model_id: id.to_string(),
        kind,
        version: 1,
        feature_set_version: "v1".to_string(),
        training_window: 300,
        hyperparameters: serde_json::json!({}),
        active: true,
        created_at: Utc::now(),
        last_evaluated_at: None,
        rolling_metrics: None,
    }
}

async fn register_trained_logistic(harness: &Harness) {
    let engine = harness.pipeline.feature_engine().clone();
    let bars = harness
        .pipeline
        .fetch_bars(TICKER, Timeframe::Daily, 300)
        .await
        .unwrap();
    let matrix = engine.materialize(TICKER, &bars).unwrap();
    let labels = direction_labels(&bars, 5);
    let mut model = LogisticPredictor::new("logistic", "v1");
    model
        .train(&matrix, &labels, &TrainOptions::default())
        .unwrap();
    harness
        .pipeline
        .registry()
        .register(Box::new(model), metadata("logistic", ModelKind::Logistic))
        .await
        .unwrap();
}

/// A registered predictor whose `predict` always fails.
struct BrokenPredictor;

impl Predictor for BrokenPredictor {
    fn model_id(&self) -> &str {
        "broken"
    }
    fn kind(&self) -> ModelKind {
        ModelKind::Gbdt
    }
    fn feature_set_version(&self) -> &str {
        "v1"
    }
    fn is_trained(&self) -> bool {
        true
    }
    fn train(
        &mut self,
        _matrix: &FeatureMatrix,
        _labels: &[Option<bool>],
        _opts: &TrainOptions,
    ) -> CoreResult<()> {
        Ok(())
    }
    fn predict(&self, _row: &FeatureRow) -> CoreResult<f64> {
        Err(CoreError::PredictionFailed {
            model_id: "broken".into(),
            reason: "synthetic failure".into(),
        })
    }
    fn serialize(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

#[tokio::test]
async fn single_logistic_signal_end_to_end() {
    let harness = harness_with_bars(daily_bars(300)).await;
    register_trained_logistic(&harness).await;

    let record = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(record.ticker, TICKER);
    assert!((0.0..=1.0).contains(&record.probability));
    assert!((0.0..=1.0).contains(&record.confidence));
    assert_eq!(record.status, SignalStatus::Pending);
    // the only model carries the whole weight
    assert_eq!(record.component_weights.len(), 1);
    assert!((record.component_weights["logistic"] - 1.0).abs() < 1e-9);
    assert!(record.per_model_predictions.contains_key("logistic"));
    assert!(record.diagnostics.is_empty());
    // non-HOLD signals must carry ordered levels
    if let Some(levels) = record.levels {
        if record.label.is_buy_side() {
            assert!(levels.stop_loss < levels.entry);
            assert!(levels.entry < levels.target_1);
            assert!(levels.target_1 <= levels.target_2);
        }
    } else {
        assert_eq!(record.label, SignalLabel::Hold);
    }
}

#[tokio::test]
async fn failing_predictor_is_excluded_with_diagnostics() {
    let harness = harness_with_bars(daily_bars(300)).await;
    register_trained_logistic(&harness).await;
    harness
        .pipeline
        .registry()
        .register(Box::new(BrokenPredictor), metadata("broken", ModelKind::Gbdt))
        .await
        .unwrap();

    let record = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(10))
        .await
        .unwrap();

    assert!(!record.component_weights.contains_key("broken"));
    assert!((record.component_weights["logistic"] - 1.0).abs() < 1e-9);
    let diag = record
        .diagnostics
        .iter()
        .find(|d| d.model_id == "broken")
        .expect("diagnostics must name the excluded model");
    assert_eq!(diag.error_kind, "PredictionFailed");
}

#[tokio::test]
async fn short_history_is_insufficient() {
    let harness = harness_with_bars(daily_bars(30)).await;
    register_trained_logistic_or_skip(&harness).await;

    let err = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InsufficientHistory { .. }));
    // no signal state was left behind
    assert!(harness.pipeline.tracker().latest_signal(TICKER).await.is_none());
}

/// Registers a logistic trained on a private long series, so the harness
/// symbol itself can stay short.
async fn register_trained_logistic_or_skip(harness: &Harness) {
    let engine = harness.pipeline.feature_engine().clone();
    let bars = daily_bars(300);
    let matrix = engine.materialize(TICKER, &bars).unwrap();
    let labels = direction_labels(&bars, 5);
    let mut model = LogisticPredictor::new("logistic", "v1");
    model
        .train(&matrix, &labels, &TrainOptions::default())
        .unwrap();
    harness
        .pipeline
        .registry()
        .register(Box::new(model), metadata("logistic", ModelKind::Logistic))
        .await
        .unwrap();
}

#[tokio::test]
async fn no_active_predictors_is_an_error() {
    let harness = harness_with_bars(daily_bars(300)).await;
    let err = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoActivePredictors(_)));
}

#[tokio::test]
async fn signal_is_persisted_and_predictions_recorded() {
    let harness = harness_with_bars(daily_bars(300)).await;
    register_trained_logistic(&harness).await;

    let record = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(10))
        .await
        .unwrap();

    let latest = harness
        .pipeline
        .tracker()
        .latest_signal(TICKER)
        .await
        .unwrap();
    assert_eq!(latest.as_of_ts, record.as_of_ts);
    assert_eq!(
        harness
            .pipeline
            .tracker()
            .open_prediction_count("logistic")
            .await,
        1
    );
}

#[tokio::test]
async fn settle_realises_predictions_once_horizon_passes() {
    // the series ends in the past so the horizon bars can "arrive" later
    // while still being fetchable
    let bars = daily_bars_ending(300, Utc::now() - chrono::Duration::days(10));
    let harness = harness_with_bars(bars.clone()).await;
    register_trained_logistic(&harness).await;

    harness
        .pipeline
        .generate(TICKER, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        harness
            .pipeline
            .tracker()
            .open_prediction_count("logistic")
            .await,
        1
    );

    // the horizon cannot be realised yet
    assert_eq!(harness.pipeline.settle(TICKER).await.unwrap(), 0);

    // more sessions arrive, carrying the horizon bar
    let mut extended = bars;
    let last_ts = extended.last().unwrap().timestamp;
    let last_close = extended.last().unwrap().close;
    for i in 1..=6 {
        extended.push(Bar {
            timestamp: last_ts + chrono::Duration::days(i),
            open: last_close,
            high: last_close + 20.0,
            low: last_close - 20.0,
            close: last_close + i as f64,
            volume: 4_000_000.0,
        });
    }
    harness.broker.set_bars(TICKER, Timeframe::Daily, extended);

    let settled = harness.pipeline.settle(TICKER).await.unwrap();
    assert_eq!(settled, 1);
    assert_eq!(
        harness
            .pipeline
            .tracker()
            .open_prediction_count("logistic")
            .await,
        0
    );
}

#[tokio::test]
async fn train_models_bootstraps_the_stack() {
    let harness = harness_with_bars(daily_bars(500)).await;
    let active = harness.pipeline.train_models(TICKER).await.unwrap();

    assert!(active.contains(&"logistic".to_string()));
    // with 500 clean bars the optional kinds should fit too
    assert!(active.contains(&"gbdt".to_string()));
    assert!(active.contains(&"sequence".to_string()));

    let record = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(record.per_model_predictions.len(), active.len());
    let weight_sum: f64 = record.component_weights.values().sum();
    assert!((weight_sum - 1.0).abs() < 1e-9);
}

fn hourly_bars(n: usize) -> Vec<Bar> {
    let end = Utc::now() - chrono::Duration::minutes(1);
    (0..n)
        .map(|i| {
            let age = (n - 1 - i) as i64;
            let close = 2_400.0 + i as f64 * 0.2 + (i as f64 * 0.4).cos() * 5.0;
            Bar {
                timestamp: end - chrono::Duration::hours(age),
                open: close - 1.0,
                high: close + 6.0,
                low: close - 6.0,
                close,
                volume: 500_000.0,
            }
        })
        .collect()
}

#[tokio::test]
async fn multi_timeframe_consensus_blends_both_frames() {
    let broker = Arc::new(FakeBroker::new());
    broker.set_bars(TICKER, Timeframe::Daily, daily_bars(300));
    broker.set_bars(TICKER, Timeframe::Hour1, hourly_bars(300));
    let history = Arc::new(HistoryProvider::new(broker.clone()));
    let registry = Arc::new(ModelRegistry::in_memory());
    let tracker = Arc::new(PerformanceTracker::in_memory(30, 5));
    let config = AppConfig {
        timeframes: vec![Timeframe::Hour1, Timeframe::Daily],
        timeframe_weights: vec![0.4, 0.6],
        ..AppConfig::default()
    };
    let pipeline = SignalPipeline::new(config, history, registry, tracker).unwrap();
    let harness = Harness { pipeline, broker };
    register_trained_logistic_or_skip(&harness).await;

    let record = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(20))
        .await
        .unwrap();

    assert!((0.0..=1.0).contains(&record.probability));
    assert!((0.0..=1.0).contains(&record.confidence));
    // as_of anchors on the primary (highest-weight) timeframe: daily
    let daily_last = harness
        .pipeline
        .fetch_bars(TICKER, Timeframe::Daily, 100)
        .await
        .unwrap()
        .last()
        .unwrap()
        .timestamp;
    assert_eq!(record.as_of_ts, daily_last);
}

#[tokio::test]
async fn one_dead_timeframe_degrades_instead_of_failing() {
    let broker = Arc::new(FakeBroker::new());
    broker.set_bars(TICKER, Timeframe::Daily, daily_bars(300));
    // Hour1 is seeded far too short to materialise
    broker.set_bars(TICKER, Timeframe::Hour1, hourly_bars(10));
    let history = Arc::new(HistoryProvider::new(broker.clone()));
    let registry = Arc::new(ModelRegistry::in_memory());
    let tracker = Arc::new(PerformanceTracker::in_memory(30, 5));
    let config = AppConfig {
        timeframes: vec![Timeframe::Hour1, Timeframe::Daily],
        timeframe_weights: vec![0.4, 0.6],
        ..AppConfig::default()
    };
    let pipeline = SignalPipeline::new(config, history, registry, tracker).unwrap();
    let harness = Harness { pipeline, broker };
    register_trained_logistic_or_skip(&harness).await;

    // the daily frame alone carries the consensus
    let record = harness
        .pipeline
        .generate(TICKER, Duration::from_secs(20))
        .await
        .unwrap();
    assert!((0.0..=1.0).contains(&record.probability));
}

#[tokio::test]
async fn generate_respects_deadline() {
    let broker = Arc::new(FakeBroker::new().with_fetch_delay(Duration::from_secs(5)));
    broker.set_bars(TICKER, Timeframe::Daily, daily_bars(300));
    let history = Arc::new(HistoryProvider::new(broker.clone()));
    let registry = Arc::new(ModelRegistry::in_memory());
    let tracker = Arc::new(PerformanceTracker::in_memory(30, 5));
    let pipeline = SignalPipeline::new(test_config(), history, registry, tracker).unwrap();

    let harness = Harness { pipeline, broker };
    register_trained_logistic_or_skip(&harness).await;

    let err = harness
        .pipeline
        .generate(TICKER, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));
}
