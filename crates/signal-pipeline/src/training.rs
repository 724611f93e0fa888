//! Model training bootstrap: fit (or refit) every predictor kind for a
//! ticker's primary timeframe and the stacking meta-model on top.

use std::time::{Duration, Instant};

use chrono::Utc;

use ensemble::StackingMeta;
use feature_engine::direction_labels;
use market_core::{CoreError, CoreResult, ModelKind, ModelMetadata};
use model_registry::{
    GbdtPredictor, LogisticPredictor, Predictor, SequencePredictor, TrainOptions,
};

use crate::pipeline::{SignalPipeline, SEQUENCE_WINDOW};

/// Bars of labelled history targeted for a training run, beyond warmup.
const TRAINING_BARS: usize = 400;

impl SignalPipeline {
    fn train_options(&self) -> TrainOptions {
        TrainOptions {
            deadline: Some(
                Instant::now() + Duration::from_secs(self.config().training_timeout_secs),
            ),
            ..TrainOptions::default()
        }
    }

    fn metadata_for(&self, model_id: &str, kind: ModelKind, hyper: serde_json::Value, rows: usize) -> ModelMetadata {
        ModelMetadata {
            model_id: model_id.to_string(),
            kind,
            version: 1,
            feature_set_version: self.config().feature_set_version.clone(),
            training_window: rows,
            hyperparameters: hyper,
            active: true,
            created_at: Utc::now(),
            last_evaluated_at: None,
            rolling_metrics: None,
        }
    }

    /// Train the full predictor stack for `ticker`. The logistic baseline
    /// must succeed; the optional kinds are skipped (with a diagnostic
    /// log line) when they cannot fit. Returns the ids that are active
    /// after the run.
    pub async fn train_models(&self, ticker: &str) -> CoreResult<Vec<String>> {
        let timeframe = self.primary_timeframe();
        let horizon = self.config().label_horizon_bars;
        let bars_needed = self.feature_engine().warmup() + horizon + TRAINING_BARS;
        let bars = self.fetch_bars(ticker, timeframe, bars_needed).await?;

        let matrix = self.feature_engine().materialize(ticker, &bars)?;
        let labels = direction_labels(&bars, horizon);
        let opts = self.train_options();
        let feature_version = self.config().feature_set_version.clone();

        tracing::info!(
            ticker,
            timeframe = timeframe.name(),
            rows = matrix.rows(),
            horizon_bars = horizon,
            "training predictor stack"
        );

        // baseline: always present, failure here fails the run
        {
            let mut model = LogisticPredictor::new("logistic", &feature_version);
            model.train(&matrix, &labels, &opts)?;
            let hyper = model.hyperparams_json();
            self.install("logistic", Box::new(model), ModelKind::Logistic, hyper, matrix.rows())
                .await?;
        }

        // optional kinds: absence is not an error
        {
            let mut model = GbdtPredictor::new("gbdt", &feature_version);
            match model.train(&matrix, &labels, &opts) {
                Ok(()) => {
                    let hyper = model.hyperparams_json();
                    self.install("gbdt", Box::new(model), ModelKind::Gbdt, hyper, matrix.rows())
                        .await?;
                }
                Err(e) => tracing::warn!(ticker, error = %e, "gbdt predictor skipped"),
            }
        }
        {
            let mut model = SequencePredictor::new("sequence", &feature_version);
            match model.train(&matrix, &labels, &opts) {
                Ok(()) => {
                    let hyper = model.hyperparams_json();
                    self.install("sequence", Box::new(model), ModelKind::Sequence, hyper, matrix.rows())
                        .await?;
                }
                Err(e) => tracing::warn!(ticker, error = %e, "sequence predictor skipped"),
            }
        }

        let active = self.registry().list_active().await;

        // stacking meta-model over in-sample component predictions
        if let Err(e) = self.train_stacker(&matrix, &labels, &active).await {
            tracing::warn!(ticker, error = %e, "stacking meta-model skipped");
        }

        Ok(active)
    }

    /// Register a freshly trained predictor, replacing any prior model
    /// under the same id (a retrain is a new registration, not an edit).
    async fn install(
        &self,
        model_id: &str,
        predictor: Box<dyn Predictor>,
        kind: ModelKind,
        hyper: serde_json::Value,
        rows: usize,
    ) -> CoreResult<()> {
        if self.registry().get_metadata(model_id).await.is_ok() {
            self.registry().remove(model_id).await?;
        }
        let metadata = self.metadata_for(model_id, kind, hyper, rows);
        self.registry().register(predictor, metadata).await?;
        Ok(())
    }

    async fn train_stacker(
        &self,
        matrix: &feature_engine::FeatureMatrix,
        labels: &[Option<bool>],
        active: &[String],
    ) -> CoreResult<()> {
        if active.len() < 2 {
            // nothing to stack over a single component
            return Ok(());
        }

        let mut samples: Vec<(Vec<f64>, bool)> = Vec::new();
        for i in matrix.complete_row_indices() {
            let Some(Some(up)) = labels.get(i) else {
                continue;
            };
            let window_start = (i + 1).saturating_sub(SEQUENCE_WINDOW);
            let window: Vec<feature_engine::FeatureRow> =
                (window_start..=i).map(|j| matrix.row(j)).collect();

            let mut component_ps = Vec::with_capacity(active.len());
            let mut usable = true;
            for model_id in active {
                match self.registry().predict_window(model_id, &window).await {
                    Ok(p) => component_ps.push(p),
                    Err(_) => {
                        usable = false;
                        break;
                    }
                }
            }
            if usable {
                samples.push((component_ps, *up));
            }
        }

        if samples.is_empty() {
            return Err(CoreError::InsufficientData {
                model_id: "stacking-meta".into(),
                rows: 0,
                need: 1,
            });
        }

        let mut meta = StackingMeta::new(active.to_vec());
        meta.train(&samples)?;
        *self.stacker.write().await = Some(meta);
        tracing::info!(samples = samples.len(), "stacking meta-model trained");
        Ok(())
    }
}
