//! The process-wide model registry: owns every predictor and its metadata,
//! exclusive-writer / shared-reader, optionally durable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;

use feature_engine::{FeatureMatrix, FeatureRow, FeatureSchema};
use market_core::{CoreError, CoreResult, ModelMetadata, RollingMetrics};

use crate::predictor::{deserialize_predictor, Predictor, TrainOptions};
use crate::store::RegistryStore;

struct ModelSlot {
    metadata: ModelMetadata,
    predictor: Box<dyn Predictor>,
}

pub struct ModelRegistry {
    inner: RwLock<HashMap<String, ModelSlot>>,
    store: Option<RegistryStore>,
    read_only: AtomicBool,
}

impl ModelRegistry {
    /// In-memory registry (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            store: None,
            read_only: AtomicBool::new(false),
        }
    }

    /// Open a durable registry, loading any persisted models.
    pub fn open(store: RegistryStore) -> CoreResult<Self> {
        let mut models = HashMap::new();
        for (metadata, payload) in store.load_all()? {
            let predictor = deserialize_predictor(&metadata.model_id, metadata.kind, &payload)?;
            tracing::info!(
                model_id = %metadata.model_id,
                kind = metadata.kind.as_str(),
                active = metadata.active,
                "loaded model from registry store"
            );
            models.insert(metadata.model_id.clone(), ModelSlot {
                metadata,
                predictor,
            });
        }
        Ok(Self {
            inner: RwLock::new(models),
            store: Some(store),
            read_only: AtomicBool::new(false),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Called when on-disk state is found inconsistent at runtime; every
    /// subsequent mutation fails until an operator intervenes.
    pub fn mark_read_only(&self) {
        self.read_only.store(true, Ordering::SeqCst);
        tracing::error!("registry marked read-only after corruption");
    }

    fn guard_writable(&self) -> CoreResult<()> {
        if self.is_read_only() {
            return Err(CoreError::RegistryCorruption(
                "registry is read-only pending operator intervention".into(),
            ));
        }
        Ok(())
    }

    fn persist(&self, slot: &ModelSlot) -> CoreResult<()> {
        if let Some(store) = &self.store {
            let payload = slot.predictor.serialize()?;
            store.save(&slot.metadata, &payload)?;
        }
        Ok(())
    }

    /// Register a predictor. Fails on id collision or an unknown
    /// feature-set version; on success the model starts in the state
    /// carried by `metadata.active`.
    pub async fn register(
        &self,
        predictor: Box<dyn Predictor>,
        metadata: ModelMetadata,
    ) -> CoreResult<String> {
        self.guard_writable()?;
        if FeatureSchema::for_version(&metadata.feature_set_version).is_none() {
            return Err(CoreError::InvalidConfig(format!(
                "unknown feature set version {}",
                metadata.feature_set_version
            )));
        }
        if predictor.feature_set_version() != metadata.feature_set_version {
            return Err(CoreError::SchemaMismatch {
                model_id: metadata.model_id.clone(),
                expected: metadata.feature_set_version.clone(),
                actual: predictor.feature_set_version().to_string(),
            });
        }

        let mut inner = self.inner.write().await;
        if inner.contains_key(&metadata.model_id) {
            return Err(CoreError::InvalidData(format!(
                "model id {} already registered",
                metadata.model_id
            )));
        }

        let model_id = metadata.model_id.clone();
        let slot = ModelSlot {
            metadata,
            predictor,
        };
        self.persist(&slot)?;
        tracing::info!(model_id = %model_id, "registered model");
        inner.insert(model_id.clone(), slot);
        Ok(model_id)
    }

    pub async fn activate(&self, model_id: &str) -> CoreResult<()> {
        self.set_active(model_id, true).await
    }

    /// A deactivated model is never consulted by the ensemble but remains
    /// addressable for inspection.
    pub async fn deactivate(&self, model_id: &str) -> CoreResult<()> {
        self.set_active(model_id, false).await
    }

    async fn set_active(&self, model_id: &str, active: bool) -> CoreResult<()> {
        self.guard_writable()?;
        let mut inner = self.inner.write().await;
        let slot = inner
            .get_mut(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        slot.metadata.active = active;
        self.persist(slot)?;
        Ok(())
    }

    pub async fn remove(&self, model_id: &str) -> CoreResult<()> {
        self.guard_writable()?;
        let mut inner = self.inner.write().await;
        if inner.remove(model_id).is_none() {
            return Err(CoreError::NotFound(format!("model {model_id}")));
        }
        if let Some(store) = &self.store {
            store.delete(model_id)?;
        }
        Ok(())
    }

    pub async fn list_active(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .values()
            .filter(|s| s.metadata.active && s.predictor.is_trained())
            .map(|s| s.metadata.model_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn list_metadata(&self) -> Vec<ModelMetadata> {
        let inner = self.inner.read().await;
        let mut all: Vec<ModelMetadata> =
            inner.values().map(|s| s.metadata.clone()).collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        all
    }

    pub async fn get_metadata(&self, model_id: &str) -> CoreResult<ModelMetadata> {
        let inner = self.inner.read().await;
        inner
            .get(model_id)
            .map(|s| s.metadata.clone())
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))
    }

    pub async fn predict(&self, model_id: &str, row: &FeatureRow) -> CoreResult<f64> {
        let inner = self.inner.read().await;
        let slot = inner
            .get(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        slot.predictor.predict(row)
    }

    pub async fn predict_window(&self, model_id: &str, rows: &[FeatureRow]) -> CoreResult<f64> {
        let inner = self.inner.read().await;
        let slot = inner
            .get(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        slot.predictor.predict_window(rows)
    }

    /// Train one model in place. Writers exclude readers for the duration;
    /// callers bound the run with `TrainOptions::deadline`. A failed run
    /// leaves both the in-memory and persisted state untouched.
    pub async fn train(
        &self,
        model_id: &str,
        matrix: &FeatureMatrix,
        labels: &[Option<bool>],
        opts: &TrainOptions,
    ) -> CoreResult<()> {
        self.guard_writable()?;
        let mut inner = self.inner.write().await;
        let slot = inner
            .get_mut(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;

        slot.predictor.train(matrix, labels, opts)?;
        slot.metadata.version += 1;
        self.persist(slot)?;
        tracing::info!(
            model_id = %model_id,
            version = slot.metadata.version,
            rows = matrix.rows(),
            "trained model"
        );
        Ok(())
    }

    /// Record fresh rolling metrics from the performance tracker.
    pub async fn update_metrics(
        &self,
        model_id: &str,
        metrics: RollingMetrics,
    ) -> CoreResult<()> {
        self.guard_writable()?;
        let mut inner = self.inner.write().await;
        let slot = inner
            .get_mut(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        slot.metadata.last_evaluated_at = Some(Utc::now());
        slot.metadata.rolling_metrics = Some(metrics);
        self.persist(slot)?;
        Ok(())
    }
}
