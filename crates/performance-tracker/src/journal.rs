//! Append-only JSON-lines journal backing the performance tracker
//! (`predictions.log` in the data directory). The first line is a
//! versioned header; readers refuse unknown versions.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use market_core::{
    CoreError, CoreResult, PerformanceObservation, Prediction, SignalRecord,
};

const MAGIC: &str = "TWPL";
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: String,
    schema_version: u32,
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    Prediction(Prediction),
    Observation(PerformanceObservation),
    Signal(SignalRecord),
    Expiry {
        model_id: String,
        prediction_ts: chrono::DateTime<chrono::Utc>,
    },
}

#[derive(Debug)]
pub struct PredictionJournal {
    path: PathBuf,
    file: File,
}

impl PredictionJournal {
    /// Open (or create) the journal, returning the replayable entries.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        let exists = path.exists();
        if exists {
            let reader = BufReader::new(File::open(&path)?);
            let mut lines = reader.lines();

            let header_line = lines
                .next()
                .transpose()?
                .ok_or_else(|| CoreError::UnreadableState(format!("{}: empty journal", path.display())))?;
            let header: Header = serde_json::from_str(&header_line).map_err(|e| {
                CoreError::UnreadableState(format!("{}: bad header: {e}", path.display()))
            })?;
            if header.magic != MAGIC {
                return Err(CoreError::UnreadableState(format!(
                    "{}: magic {:?}, expected {MAGIC:?}",
                    path.display(),
                    header.magic
                )));
            }
            if header.schema_version != SCHEMA_VERSION {
                return Err(CoreError::UnreadableState(format!(
                    "{}: schema version {}, expected {SCHEMA_VERSION}",
                    path.display(),
                    header.schema_version
                )));
            }

            for (lineno, line) in lines.enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: JournalEntry = serde_json::from_str(&line).map_err(|e| {
                    CoreError::Persistence(format!(
                        "{} line {}: {e}",
                        path.display(),
                        lineno + 2
                    ))
                })?;
                entries.push(entry);
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !exists {
            let header = Header {
                magic: MAGIC.to_string(),
                schema_version: SCHEMA_VERSION,
            };
            writeln!(file, "{}", serde_json::to_string(&header).unwrap())?;
            file.sync_data()?;
        }

        Ok((Self { path, file }, entries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &JournalEntry) -> CoreResult<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| CoreError::Persistence(format!("encode journal entry: {e}")))?;
        writeln!(self.file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn prediction(model: &str, minute: i64) -> Prediction {
        Prediction {
            model_id: model.to_string(),
            ticker: "RELIANCE".to_string(),
            as_of_ts: Utc::now() + chrono::Duration::minutes(minute),
            probability_up: 0.6,
            model_version: 1,
            feature_version: "v1".to_string(),
        }
    }

    #[test]
    fn journal_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.log");

        {
            let (mut journal, entries) = PredictionJournal::open(&path).unwrap();
            assert!(entries.is_empty());
            journal
                .append(&JournalEntry::Prediction(prediction("m1", 0)))
                .unwrap();
            journal
                .append(&JournalEntry::Prediction(prediction("m1", 5)))
                .unwrap();
        }

        let (_, entries) = PredictionJournal::open(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], JournalEntry::Prediction(_)));
    }

    #[test]
    fn bad_header_is_unreadable_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.log");
        std::fs::write(&path, "{\"magic\":\"XXXX\",\"schema_version\":1}\n").unwrap();
        assert!(matches!(
            PredictionJournal::open(&path).unwrap_err(),
            CoreError::UnreadableState(_)
        ));
    }

    #[test]
    fn future_schema_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.log");
        std::fs::write(&path, "{\"magic\":\"TWPL\",\"schema_version\":9}\n").unwrap();
        assert!(matches!(
            PredictionJournal::open(&path).unwrap_err(),
            CoreError::UnreadableState(_)
        ));
    }
}
