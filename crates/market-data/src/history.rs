//! Historical OHLCV through the broker adapter: bounded-backoff retry on
//! transient failures plus an optional on-disk cache keyed by
//! `(symbol, start, end, bar_size)`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use broker_adapter::{with_retry, BrokerAdapter};
use market_core::{validate_series, Bar, CoreResult, Timeframe};

const MAGIC: &str = "TWHC";
const SCHEMA_VERSION: u32 = 1;
const RETRY_ATTEMPTS: u32 = 4;
const RETRY_INITIAL: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(4);

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    magic: String,
    schema_version: u32,
    symbol: String,
    timeframe: Timeframe,
    bars: Vec<Bar>,
}

pub struct HistoryProvider {
    adapter: Arc<dyn BrokerAdapter>,
    cache_dir: Option<PathBuf>,
}

impl HistoryProvider {
    pub fn new(adapter: Arc<dyn BrokerAdapter>) -> Self {
        Self {
            adapter,
            cache_dir: None,
        }
    }

    /// Enable the on-disk fallback under `dir` (the data directory's
    /// `cache/`).
    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        self.cache_dir = Some(dir);
        Ok(self)
    }

    fn cache_path(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        // instrument keys carry '|' and ':'; keep filenames portable
        let safe: String = symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Some(dir.join(format!(
            "{safe}_{}_{}_{}.json",
            start.timestamp(),
            end.timestamp(),
            timeframe.name()
        )))
    }

    fn read_cache(&self, path: &Path) -> Option<Vec<Bar>> {
        let bytes = std::fs::read(path).ok()?;
        let file: CacheFile = serde_json::from_slice(&bytes).ok()?;
        if file.magic != MAGIC || file.schema_version != SCHEMA_VERSION {
            tracing::warn!(path = %path.display(), "stale history cache version, refetching");
            return None;
        }
        Some(file.bars)
    }

    fn write_cache(&self, path: &Path, symbol: &str, timeframe: Timeframe, bars: &[Bar]) {
        let file = CacheFile {
            magic: MAGIC.to_string(),
            schema_version: SCHEMA_VERSION,
            symbol: symbol.to_string(),
            timeframe,
            bars: bars.to_vec(),
        };
        match serde_json::to_vec(&file) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    tracing::warn!(path = %path.display(), error = %e, "history cache write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "history cache encode failed"),
        }
    }

    /// Fetch a validated ascending series, preferring the on-disk cache.
    pub async fn get(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> CoreResult<Vec<Bar>> {
        let cache_path = self.cache_path(symbol, start, end, timeframe);
        if let Some(path) = &cache_path {
            if let Some(bars) = self.read_cache(path) {
                tracing::debug!(symbol, timeframe = timeframe.name(), "history cache hit");
                return Ok(bars);
            }
        }

        let adapter = &self.adapter;
        let bars = with_retry(
            "historical ohlcv",
            RETRY_ATTEMPTS,
            RETRY_INITIAL,
            RETRY_MAX,
            || adapter.get_historical_ohlcv(symbol, start, end, timeframe),
        )
        .await?;

        validate_series(&bars)?;

        if let Some(path) = &cache_path {
            self.write_cache(path, symbol, timeframe, &bars);
        }
        Ok(bars)
    }
}
