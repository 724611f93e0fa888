//! Durable registry state: one versioned JSON file per model under
//! `registry/`, written new-then-renamed so a crash mid-write leaves the
//! previous state intact.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use market_core::{CoreError, CoreResult, ModelMetadata};

const MAGIC: &str = "TWMR";
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    magic: String,
    schema_version: u32,
    metadata: ModelMetadata,
    predictor: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    pub fn open(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, model_id: &str) -> PathBuf {
        self.dir.join(format!("{model_id}.json"))
    }

    /// Persist one model atomically (write temp, fsync, rename over).
    pub fn save(&self, metadata: &ModelMetadata, predictor: &serde_json::Value) -> CoreResult<()> {
        let file = ModelFile {
            magic: MAGIC.to_string(),
            schema_version: SCHEMA_VERSION,
            metadata: metadata.clone(),
            predictor: predictor.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| CoreError::Persistence(format!("encode {}: {e}", metadata.model_id)))?;

        let tmp = self.dir.join(format!(".{}.tmp", metadata.model_id));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.path_for(&metadata.model_id))?;
        Ok(())
    }

    pub fn delete(&self, model_id: &str) -> CoreResult<()> {
        let path = self.path_for(model_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Load every persisted model. Unknown magic or schema version is an
    /// `UnreadableState` (operator upgraded/downgraded the binary); a file
    /// that does not parse at all is `RegistryCorruption`.
    pub fn load_all(&self) -> CoreResult<Vec<(ModelMetadata, serde_json::Value)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }

            let bytes = fs::read(&path)?;
            let file: ModelFile = serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::RegistryCorruption(format!("{}: {e}", path.display()))
            })?;
            if file.magic != MAGIC {
                return Err(CoreError::UnreadableState(format!(
                    "{}: magic {:?}, expected {MAGIC:?}",
                    path.display(),
                    file.magic
                )));
            }
            if file.schema_version != SCHEMA_VERSION {
                return Err(CoreError::UnreadableState(format!(
                    "{}: schema version {}, expected {SCHEMA_VERSION}",
                    path.display(),
                    file.schema_version
                )));
            }
            out.push((file.metadata, file.predictor));
        }
        // stable order regardless of directory iteration order
        out.sort_by(|a, b| a.0.model_id.cmp(&b.0.model_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use market_core::ModelKind;

    fn metadata(id: &str) -> ModelMetadata {
        ModelMetadata {
            model_id: id.to_string(),
            kind: ModelKind::Logistic,
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

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path().join("registry")).unwrap();
        store
            .save(&metadata("m1"), &serde_json::json!({"w": [1.0, 2.0]}))
            .unwrap();
        store.save(&metadata("m2"), &serde_json::json!({})).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0.model_id, "m1");
        assert_eq!(loaded[1].0.model_id, "m2");
    }

    #[test]
    fn unknown_schema_version_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        store.save(&metadata("m1"), &serde_json::json!({})).unwrap();

        // bump the version on disk
        let path = dir.path().join("m1.json");
        let mut v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        v["schema_version"] = serde_json::json!(42);
        std::fs::write(&path, serde_json::to_vec(&v).unwrap()).unwrap();

        assert!(matches!(
            store.load_all().unwrap_err(),
            CoreError::UnreadableState(_)
        ));
    }

    #[test]
    fn garbage_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"not json").unwrap();
        assert!(matches!(
            store.load_all().unwrap_err(),
            CoreError::RegistryCorruption(_)
        ));
    }

    #[test]
    fn overwrite_replaces_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        store.save(&metadata("m1"), &serde_json::json!({"v": 1})).unwrap();
        store.save(&metadata("m1"), &serde_json::json!({"v": 2})).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1["v"], 2);
    }
}
