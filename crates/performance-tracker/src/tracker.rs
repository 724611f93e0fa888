//! Prediction bookkeeping: append-only recording, outcome realisation,
//! rolling metrics, and the weight vector handed to the ensemble.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use market_core::{
    CoreError, CoreResult, Direction, PerformanceObservation, Prediction, RollingMetrics,
    SignalRecord, SignalStatus,
};

use crate::journal::{JournalEntry, PredictionJournal};
use crate::weights::derive_weights;

type PredictionKey = (String, DateTime<Utc>);

#[derive(Default)]
struct TrackerState {
    /// Unrealised predictions per model, ordered by prediction_ts.
    open: HashMap<String, BTreeMap<DateTime<Utc>, Prediction>>,
    /// Highest prediction_ts ever accepted per model (append-only order).
    latest_ts: HashMap<String, DateTime<Utc>>,
    observations: HashMap<String, Vec<PerformanceObservation>>,
    observed: HashSet<PredictionKey>,
    latest_signals: HashMap<String, SignalRecord>,
}

impl TrackerState {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Prediction(p) => {
                let ts = p.as_of_ts;
                let model = p.model_id.clone();
                self.open.entry(model.clone()).or_default().insert(ts, p);
                let latest = self.latest_ts.entry(model).or_insert(ts);
                if ts > *latest {
                    *latest = ts;
                }
            }
            JournalEntry::Observation(o) => {
                let key = (o.model_id.clone(), o.prediction_ts);
                if let Some(open) = self.open.get_mut(&o.model_id) {
                    open.remove(&o.prediction_ts);
                }
                if self.observed.insert(key) {
                    self.observations
                        .entry(o.model_id.clone())
                        .or_default()
                        .push(o);
                }
            }
            JournalEntry::Expiry {
                model_id,
                prediction_ts,
            } => {
                if let Some(open) = self.open.get_mut(&model_id) {
                    open.remove(&prediction_ts);
                }
            }
            JournalEntry::Signal(s) => {
                let keep = match self.latest_signals.get(&s.ticker) {
                    Some(existing) => s.as_of_ts >= existing.as_of_ts,
                    None => true,
                };
                if keep {
                    self.latest_signals.insert(s.ticker.clone(), s);
                }
            }
        }
    }
}

pub struct PerformanceTracker {
    state: RwLock<TrackerState>,
    journal: Option<Mutex<PredictionJournal>>,
    window_days: u32,
    min_observations: usize,
}

impl PerformanceTracker {
    pub fn in_memory(window_days: u32, min_observations: usize) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            journal: None,
            window_days,
            min_observations,
        }
    }

    /// Open the durable tracker, replaying `predictions.log`.
    pub fn open(
        path: impl AsRef<Path>,
        window_days: u32,
        min_observations: usize,
    ) -> CoreResult<Self> {
        let (journal, entries) = PredictionJournal::open(path)?;
        let mut state = TrackerState::default();
        let replayed = entries.len();
        for entry in entries {
            state.apply(entry);
        }
        tracing::info!(entries = replayed, "replayed prediction journal");
        Ok(Self {
            state: RwLock::new(state),
            journal: Some(Mutex::new(journal)),
            window_days,
            min_observations,
        })
    }

    async fn journal_append(&self, entry: &JournalEntry) -> CoreResult<()> {
        if let Some(journal) = &self.journal {
            journal.lock().await.append(entry)?;
        }
        Ok(())
    }

    /// Record one immutable prediction. The idempotency key is
    /// `(model_id, prediction_ts)`: duplicates are dropped defensively,
    /// writes that regress the per-model timeline fail with `StaleWrite`.
    pub async fn record_prediction(&self, prediction: Prediction) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let model = prediction.model_id.clone();
        let ts = prediction.as_of_ts;

        let key = (model.clone(), ts);
        let already_open = state
            .open
            .get(&model)
            .map(|m| m.contains_key(&ts))
            .unwrap_or(false);
        if already_open || state.observed.contains(&key) {
            tracing::debug!(model_id = %model, %ts, "dropping duplicate prediction");
            return Ok(());
        }
        if let Some(latest) = state.latest_ts.get(&model) {
            if ts < *latest {
                return Err(CoreError::StaleWrite {
                    model_id: model,
                    attempted: ts,
                    latest: *latest,
                });
            }
        }

        self.journal_append(&JournalEntry::Prediction(prediction.clone()))
            .await?;
        state.apply(JournalEntry::Prediction(prediction));
        Ok(())
    }

    /// Persist the latest signal record for a ticker.
    pub async fn record_signal(&self, record: SignalRecord) -> CoreResult<()> {
        self.journal_append(&JournalEntry::Signal(record.clone()))
            .await?;
        let mut state = self.state.write().await;
        state.apply(JournalEntry::Signal(record));
        Ok(())
    }

    pub async fn latest_signal(&self, ticker: &str) -> Option<SignalRecord> {
        self.state.read().await.latest_signals.get(ticker).cloned()
    }

    /// Score an open prediction against realised closes. Replaying the
    /// same key is a no-op (`Ok(None)`).
    pub async fn realise(
        &self,
        model_id: &str,
        prediction_ts: DateTime<Utc>,
        realised_ts: DateTime<Utc>,
        close_then: f64,
        close_now: f64,
    ) -> CoreResult<Option<PerformanceObservation>> {
        if close_then <= 0.0 || !close_then.is_finite() || !close_now.is_finite() {
            return Err(CoreError::InvalidData(format!(
                "bad closes {close_then}/{close_now} realising {model_id}"
            )));
        }

        let mut state = self.state.write().await;
        let key = (model_id.to_string(), prediction_ts);
        if state.observed.contains(&key) {
            return Ok(None);
        }
        let prediction = state
            .open
            .get(model_id)
            .and_then(|m| m.get(&prediction_ts))
            .cloned()
            .ok_or_else(|| {
                CoreError::NotFound(format!("open prediction {model_id}@{prediction_ts}"))
            })?;

        let realised_return = close_now / close_then - 1.0;
        let observation = PerformanceObservation {
            model_id: model_id.to_string(),
            prediction_ts,
            realised_ts,
            predicted_prob: prediction.probability_up,
            realised_direction: Direction::from_return(realised_return),
            realised_return,
        };

        self.journal_append(&JournalEntry::Observation(observation.clone()))
            .await?;
        state.apply(JournalEntry::Observation(observation.clone()));
        Ok(Some(observation))
    }

    /// Expire open predictions older than the cutoff (horizon passed with
    /// no realisable data). Returns how many were expired.
    pub async fn expire_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let mut state = self.state.write().await;
        let mut expired: Vec<(String, DateTime<Utc>)> = Vec::new();
        for (model, open) in &state.open {
            for ts in open.keys().take_while(|ts| **ts < cutoff) {
                expired.push((model.clone(), *ts));
            }
        }
        for (model_id, prediction_ts) in &expired {
            self.journal_append(&JournalEntry::Expiry {
                model_id: model_id.clone(),
                prediction_ts: *prediction_ts,
            })
            .await?;
            state.apply(JournalEntry::Expiry {
                model_id: model_id.clone(),
                prediction_ts: *prediction_ts,
            });
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired stale predictions");
        }
        Ok(expired.len())
    }

    /// Open (unrealised) predictions for one model, oldest first.
    pub async fn open_predictions(&self, model_id: &str) -> Vec<Prediction> {
        self.state
            .read()
            .await
            .open
            .get(model_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn open_prediction_count(&self, model_id: &str) -> usize {
        self.state
            .read()
            .await
            .open
            .get(model_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Rolling metrics over the configured window ending at `as_of`.
    pub async fn rolling_metrics(
        &self,
        model_id: &str,
        as_of: DateTime<Utc>,
    ) -> CoreResult<RollingMetrics> {
        self.rolling_metrics_windowed(model_id, self.window_days, as_of)
            .await
    }

    pub async fn rolling_metrics_windowed(
        &self,
        model_id: &str,
        window_days: u32,
        as_of: DateTime<Utc>,
    ) -> CoreResult<RollingMetrics> {
        let state = self.state.read().await;
        let cutoff = as_of - Duration::days(window_days as i64);
        let window: Vec<&PerformanceObservation> = state
            .observations
            .get(model_id)
            .map(|obs| {
                obs.iter()
                    .filter(|o| o.realised_ts >= cutoff && o.realised_ts <= as_of)
                    .collect()
            })
            .unwrap_or_default();

        if window.len() < self.min_observations {
            return Err(CoreError::InsufficientSamples {
                model_id: model_id.to_string(),
                have: window.len(),
                need: self.min_observations,
            });
        }

        let total = window.len();
        let non_flat: Vec<&&PerformanceObservation> = window
            .iter()
            .filter(|o| o.realised_direction != Direction::Flat)
            .collect();
        let correct = non_flat
            .iter()
            .filter(|o| (o.predicted_prob > 0.5) == (o.realised_direction == Direction::Up))
            .count();

        let accuracy = correct as f64 / total as f64;
        let win_rate = if non_flat.is_empty() {
            0.0
        } else {
            correct as f64 / non_flat.len() as f64
        };

        // unit stake in the predicted direction per prediction
        let signed: Vec<f64> = window
            .iter()
            .map(|o| {
                if o.predicted_prob > 0.5 {
                    o.realised_return
                } else {
                    -o.realised_return
                }
            })
            .collect();
        let mean = signed.iter().sum::<f64>() / signed.len() as f64;
        let var = signed.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / signed.len() as f64;
        let std = var.sqrt();
        let sharpe = if std > 1e-12 { mean / std } else { 0.0 };

        Ok(RollingMetrics {
            accuracy,
            win_rate,
            sharpe,
            sample_count: total,
            window_days,
        })
    }

    /// The weight vector for the ensemble. Models without enough samples
    /// simply contribute nothing; if that leaves nobody, the fallback is
    /// equal weights, so staleness never blocks inference.
    pub async fn weights_for(
        &self,
        active: &[String],
        as_of: DateTime<Utc>,
    ) -> HashMap<String, f64> {
        let mut metrics = HashMap::new();
        for model_id in active {
            if let Ok(m) = self.rolling_metrics(model_id, as_of).await {
                metrics.insert(model_id.clone(), m);
            }
        }
        derive_weights(active, &metrics)
    }

    /// Mark a stored signal realised or expired.
    pub async fn set_signal_status(&self, ticker: &str, status: SignalStatus) -> CoreResult<()> {
        let updated = {
            let state = self.state.read().await;
            let mut record = state
                .latest_signals
                .get(ticker)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("signal for {ticker}")))?;
            record.status = status;
            record
        };
        self.record_signal(updated).await
    }
}
