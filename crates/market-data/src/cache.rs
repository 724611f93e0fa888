//! Bounded TTL quote cache with singleflight miss coalescing.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use broker_adapter::QuoteTick;
use market_core::{CoreError, CoreResult, QuoteEntry};

/// Result shape shared with coalesced waiters. `CoreError` is not Clone,
/// so waiters reconstruct the upstream failure from its parts.
type SharedResult = Result<QuoteEntry, (String, String)>;

pub struct QuoteCache {
    entries: DashMap<String, QuoteEntry>,
    inflight: Mutex<HashMap<String, broadcast::Sender<SharedResult>>>,
    ttl: Duration,
    capacity: usize,
}

impl QuoteCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Fresh cached entry, if any. Entry replacement is a single map
    /// insert, so readers never observe a torn quote.
    pub fn get_fresh(&self, instrument_key: &str) -> Option<QuoteEntry> {
        let now = Utc::now();
        self.entries
            .get(instrument_key)
            .filter(|e| e.is_fresh(now))
            .map(|e| e.clone())
    }

    /// Number of live entries (test hook).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a streamed tick, stamping the TTL.
    pub fn apply_tick(&self, tick: &QuoteTick) {
        let now = Utc::now();
        let entry = QuoteEntry {
            instrument_key: tick.instrument_key.clone(),
            last_trade_price: tick.ltp,
            open: tick.open,
            high: tick.high,
            low: tick.low,
            close: tick.close,
            volume: tick.volume,
            received_ts: now,
            source_ts: tick.source_ts,
            ttl_deadline: now + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
        };
        self.insert(entry);
    }

    fn insert(&self, entry: QuoteEntry) {
        self.entries.insert(entry.instrument_key.clone(), entry);
        if self.entries.len() > self.capacity {
            self.evict();
        }
    }

    /// Expired entries go first, oldest-received first; if everything is
    /// still fresh, the oldest entries make room anyway.
    fn evict(&self) {
        let now = Utc::now();
        let overflow = self.entries.len().saturating_sub(self.capacity);
        if overflow == 0 {
            return;
        }

        let mut candidates: Vec<(String, bool, chrono::DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.is_fresh(now), e.received_ts))
            .collect();
        // expired (fresh == false) sort ahead, then by age
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        for (key, _, _) in candidates.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
    }

    /// Read through the cache. On a miss, concurrent callers for the same
    /// key coalesce onto one upstream fetch and all receive its result.
    pub async fn get_or_fetch<F, Fut>(&self, instrument_key: &str, fetch: F) -> CoreResult<QuoteEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<QuoteEntry>>,
    {
        if let Some(entry) = self.get_fresh(instrument_key) {
            return Ok(entry);
        }

        // join an in-flight fetch if one exists, otherwise become the leader
        let mut waiter = {
            let mut inflight = self.inflight.lock().await;
            if let Some(tx) = inflight.get(instrument_key) {
                Some(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(instrument_key.to_string(), tx);
                None
            }
        };

        if let Some(rx) = waiter.as_mut() {
            return match rx.recv().await {
                Ok(Ok(entry)) => Ok(entry),
                Ok(Err((kind, msg))) => Err(CoreError::UpstreamTransient(format!(
                    "coalesced fetch failed ({kind}): {msg}"
                ))),
                Err(_) => Err(CoreError::Cancelled(format!(
                    "quote fetch for {instrument_key}"
                ))),
            };
        }

        // the cache owns freshness: successful fetches are stamped with
        // this cache's TTL regardless of what the fetcher set
        let result = fetch().await.map(|mut entry| {
            let now = Utc::now();
            entry.received_ts = now;
            entry.ttl_deadline = now + chrono::Duration::from_std(self.ttl).unwrap_or_default();
            entry
        });

        let shared: SharedResult = match &result {
            Ok(entry) => {
                self.insert(entry.clone());
                Ok(entry.clone())
            }
            Err(e) => Err((e.kind().to_string(), e.to_string())),
        };
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(tx) = inflight.remove(instrument_key) {
                let _ = tx.send(shared);
            }
        }
        result
    }
}
