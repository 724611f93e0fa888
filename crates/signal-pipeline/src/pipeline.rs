use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::RwLock;

use ensemble::{compute_levels, consensus, fuse, map_label, ModelOutput, StackingMeta, TimeframeSignal};
use feature_engine::{indicators, FeatureEngine, FeatureRow};
use market_core::{
    AppConfig, Bar, CoreError, CoreResult, Prediction, SignalDiagnostic, SignalLabel,
    SignalRecord, SignalStatus, Timeframe,
};
use market_data::HistoryProvider;
use model_registry::ModelRegistry;
use performance_tracker::PerformanceTracker;

/// Trailing rows handed to `predict_window` (the sequence kind's input).
pub(crate) const SEQUENCE_WINDOW: usize = 10;

/// Extra bars beyond warmup fetched per timeframe so the ATR and window
/// paths always have slack.
const FETCH_MARGIN_BARS: usize = 40;

/// Open predictions older than `horizon × EXPIRY_FACTOR` bar-widths are
/// expired rather than kept pending forever.
const EXPIRY_FACTOR: usize = 6;

pub struct SignalPipeline {
    config: AppConfig,
    history: Arc<HistoryProvider>,
    engine: FeatureEngine,
    registry: Arc<ModelRegistry>,
    tracker: Arc<PerformanceTracker>,
    pub(crate) stacker: RwLock<Option<StackingMeta>>,
}

/// Outcome of evaluating one timeframe.
struct TimeframeEvaluation {
    signal: TimeframeSignal,
    outputs: Vec<ModelOutput>,
    applied_weights: HashMap<String, f64>,
    diagnostics: Vec<SignalDiagnostic>,
    last_close: f64,
    atr: f64,
    as_of: DateTime<Utc>,
}

impl SignalPipeline {
    pub fn new(
        config: AppConfig,
        history: Arc<HistoryProvider>,
        registry: Arc<ModelRegistry>,
        tracker: Arc<PerformanceTracker>,
    ) -> CoreResult<Self> {
        let engine = FeatureEngine::for_version(&config.feature_set_version)?;
        Ok(Self {
            config,
            history,
            engine,
            registry,
            tracker,
            stacker: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    pub(crate) fn feature_engine(&self) -> &FeatureEngine {
        &self.engine
    }

    /// The timeframe that dominates the consensus (highest weight wins,
    /// first on ties). Levels, recorded predictions and the signal's
    /// `as_of_ts` all anchor here.
    pub(crate) fn primary_timeframe(&self) -> Timeframe {
        let mut best = (self.config.timeframes[0], f64::MIN);
        for (tf, w) in self
            .config
            .timeframes
            .iter()
            .zip(self.config.timeframe_weights.iter())
        {
            if *w > best.1 {
                best = (*tf, *w);
            }
        }
        best.0
    }

    fn lookback_days(&self, timeframe: Timeframe, bars_needed: usize) -> i64 {
        let sessions = (bars_needed as i64).div_ceil(timeframe.bars_per_session());
        // calendar days ≈ trading sessions × 7/5, plus slack for holidays
        sessions * 7 / 5 + 10
    }

    pub(crate) async fn fetch_bars(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        bars_needed: usize,
    ) -> CoreResult<Vec<Bar>> {
        let end = Utc::now();
        let start = end - chrono::Duration::days(self.lookback_days(timeframe, bars_needed));
        self.history.get(ticker, start, end, timeframe).await
    }

    /// Generate a signal with a hard deadline. Hitting the deadline
    /// cancels every outstanding sub-operation for the request.
    pub async fn generate(&self, ticker: &str, deadline: Duration) -> CoreResult<SignalRecord> {
        tokio::time::timeout(deadline, self.generate_inner(ticker))
            .await
            .map_err(|_| CoreError::Timeout(format!("signal generation for {ticker}")))?
    }

    async fn generate_inner(&self, ticker: &str) -> CoreResult<SignalRecord> {
        let active = self.registry.list_active().await;
        if active.is_empty() {
            return Err(CoreError::NoActivePredictors(ticker.to_string()));
        }
        let now = Utc::now();
        let tracker_weights = self.tracker.weights_for(&active, now).await;

        tracing::info!(
            ticker,
            models = active.len(),
            horizon_bars = self.config.label_horizon_bars,
            method = self.config.ensemble_method.name(),
            "generating signal"
        );

        // evaluate every configured timeframe concurrently
        let evaluations = join_all(self.config.timeframes.iter().map(|tf| {
            self.evaluate_timeframe(ticker, *tf, &active, &tracker_weights)
        }))
        .await;

        let mut succeeded: Vec<TimeframeEvaluation> = Vec::new();
        let mut first_error: Option<CoreError> = None;
        for result in evaluations {
            match result {
                Ok(eval) => succeeded.push(eval),
                Err(e) => {
                    tracing::warn!(ticker, error = %e, "timeframe evaluation failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if succeeded.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| CoreError::NoActivePredictors(ticker.to_string())));
        }

        let tf_signals: Vec<TimeframeSignal> = succeeded.iter().map(|e| e.signal).collect();
        let configured: Vec<(Timeframe, f64)> = self
            .config
            .timeframes
            .iter()
            .copied()
            .zip(self.config.timeframe_weights.iter().copied())
            .collect();
        let (probability, confidence) = consensus(ticker, &tf_signals, &configured)?;

        let mut label = map_label(probability, confidence, &self.config.label_thresholds);
        if label != SignalLabel::Hold && confidence < self.config.min_confidence {
            tracing::debug!(
                ticker,
                confidence,
                floor = self.config.min_confidence,
                "confidence below floor, downgrading to HOLD"
            );
            label = SignalLabel::Hold;
        }

        // primary timeframe anchors levels, record bookkeeping and as_of
        let primary_tf = self.primary_timeframe();
        let primary = succeeded
            .iter()
            .find(|e| e.signal.timeframe == primary_tf)
            .unwrap_or(&succeeded[0]);

        let levels = compute_levels(
            ticker,
            label,
            primary.last_close,
            primary.atr,
            self.config.level_style,
        )?;

        // persist each surviving prediction for later scoring
        for output in &primary.outputs {
            let prediction = Prediction {
                model_id: output.model_id.clone(),
                ticker: ticker.to_string(),
                as_of_ts: primary.as_of,
                probability_up: output.probability,
                model_version: self
                    .registry
                    .get_metadata(&output.model_id)
                    .await
                    .map(|m| m.version)
                    .unwrap_or(0),
                feature_version: self.config.feature_set_version.clone(),
            };
            match self.tracker.record_prediction(prediction).await {
                Ok(()) => {}
                Err(CoreError::StaleWrite { model_id, .. }) => {
                    tracing::warn!(ticker, model_id, "stale prediction write skipped");
                }
                Err(e) => return Err(e),
            }
        }

        let mut diagnostics: Vec<SignalDiagnostic> = Vec::new();
        for eval in &succeeded {
            diagnostics.extend(eval.diagnostics.iter().cloned());
        }

        let record = SignalRecord {
            ticker: ticker.to_string(),
            as_of_ts: primary.as_of,
            label,
            probability,
            confidence,
            levels,
            per_model_predictions: primary
                .outputs
                .iter()
                .map(|o| (o.model_id.clone(), o.probability))
                .collect(),
            ensemble_method: self.config.ensemble_method,
            component_weights: primary.applied_weights.clone(),
            status: SignalStatus::Pending,
            diagnostics,
        };
        self.tracker.record_signal(record.clone()).await?;

        tracing::info!(
            ticker,
            label = record.label.as_str(),
            probability = record.probability,
            confidence = record.confidence,
            "signal generated"
        );
        Ok(record)
    }

    async fn evaluate_timeframe(
        &self,
        ticker: &str,
        timeframe: Timeframe,
        active: &[String],
        tracker_weights: &HashMap<String, f64>,
    ) -> CoreResult<TimeframeEvaluation> {
        let bars_needed = self.engine.warmup() + SEQUENCE_WINDOW + FETCH_MARGIN_BARS;
        let bars = self.fetch_bars(ticker, timeframe, bars_needed).await?;
        let matrix = self.engine.materialize(ticker, &bars)?;

        let window_start = matrix.rows().saturating_sub(SEQUENCE_WINDOW);
        let window: Vec<FeatureRow> = (window_start..matrix.rows())
            .map(|i| matrix.row(i))
            .collect();

        let mut outputs = Vec::new();
        let mut diagnostics = Vec::new();
        for model_id in active {
            match self.registry.predict_window(model_id, &window).await {
                Ok(p) => outputs.push(ModelOutput {
                    model_id: model_id.clone(),
                    probability: p,
                }),
                Err(e) => {
                    tracing::warn!(
                        ticker,
                        model_id,
                        timeframe = timeframe.name(),
                        error = %e,
                        "predictor excluded from ensemble"
                    );
                    diagnostics.push(SignalDiagnostic {
                        model_id: model_id.clone(),
                        error_kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let stacker = self.stacker.read().await;
        let fused = fuse(
            self.config.ensemble_method,
            ticker,
            &outputs,
            tracker_weights,
            stacker.as_ref(),
        )?;
        drop(stacker);

        let atr_series = indicators::atr(&bars, 14);
        let atr = atr_series.last().copied().unwrap_or(f64::NAN);
        let last = bars.last().expect("materialize rejects empty series");

        Ok(TimeframeEvaluation {
            signal: TimeframeSignal {
                timeframe,
                probability: fused.probability,
                confidence: fused.confidence,
            },
            applied_weights: fused.weights,
            outputs,
            diagnostics,
            last_close: last.close,
            atr,
            as_of: last.timestamp,
        })
    }

    /// Generate signals for many tickers concurrently. Failures come back
    /// per ticker rather than poisoning the batch.
    pub async fn generate_many(
        &self,
        tickers: &[String],
        deadline: Duration,
    ) -> Vec<(String, CoreResult<SignalRecord>)> {
        join_all(tickers.iter().map(|t| async move {
            (t.clone(), self.generate(t, deadline).await)
        }))
        .await
    }

    /// Match open predictions for `ticker` against realised closes, feed
    /// fresh rolling metrics back to the registry, and expire anything
    /// past the bounded horizon. Returns how many predictions settled.
    pub async fn settle(&self, ticker: &str) -> CoreResult<usize> {
        let timeframe = self.primary_timeframe();
        let horizon = self.config.label_horizon_bars;
        let bars = self
            .fetch_bars(ticker, timeframe, self.engine.warmup() + horizon + FETCH_MARGIN_BARS)
            .await?;

        let mut settled = 0;
        for metadata in self.registry.list_metadata().await {
            let model_id = metadata.model_id;
            for prediction in self.tracker.open_predictions(&model_id).await {
                if prediction.ticker != ticker {
                    continue;
                }
                let Some(idx) = bars
                    .iter()
                    .position(|b| b.timestamp == prediction.as_of_ts)
                else {
                    continue;
                };
                let Some(realised_bar) = bars.get(idx + horizon) else {
                    continue; // horizon not yet realised
                };
                self.tracker
                    .realise(
                        &model_id,
                        prediction.as_of_ts,
                        realised_bar.timestamp,
                        bars[idx].close,
                        realised_bar.close,
                    )
                    .await?;
                settled += 1;
            }

            // refresh registry metrics from what just settled
            if let Ok(metrics) = self.tracker.rolling_metrics(&model_id, Utc::now()).await {
                if let Err(e) = self.registry.update_metrics(&model_id, metrics).await {
                    tracing::warn!(model_id, error = %e, "metrics update failed");
                }
            }
        }

        let expiry_cutoff = Utc::now()
            - timeframe.to_duration() * (horizon * EXPIRY_FACTOR) as i32;
        self.tracker.expire_before(expiry_cutoff).await?;

        tracing::info!(
            ticker,
            settled,
            horizon_bars = horizon,
            "prediction settlement pass complete"
        );
        Ok(settled)
    }
}
