//! Live-price stream manager: one upstream subscription fanned out to
//! process-local consumers over a bounded broadcast channel.
//!
//! Delivery is at-least-once and conflated: a slow consumer that lags the
//! channel drops intermediate updates but always sees the latest. All
//! consumers dedupe by `(instrument_key, source_ts)`; the manager already
//! drops ticks that do not advance an instrument's source timestamp.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, Notify};

use broker_adapter::{BrokerAdapter, QuoteTick};

use crate::cache::QuoteCache;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub struct StreamManager {
    adapter: Arc<dyn BrokerAdapter>,
    cache: Arc<QuoteCache>,
    tx: broadcast::Sender<QuoteTick>,
    subscriptions: Mutex<HashSet<String>>,
    resubscribe: Notify,
    shutdown: Notify,
    max_backoff: Duration,
}

impl StreamManager {
    pub fn new(
        adapter: Arc<dyn BrokerAdapter>,
        cache: Arc<QuoteCache>,
        channel_capacity: usize,
        max_backoff: Duration,
    ) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self {
            adapter,
            cache,
            tx,
            subscriptions: Mutex::new(HashSet::new()),
            resubscribe: Notify::new(),
            shutdown: Notify::new(),
            max_backoff,
        }
    }

    /// New fan-out consumer.
    pub fn subscriber(&self) -> broadcast::Receiver<QuoteTick> {
        self.tx.subscribe()
    }

    /// Add instruments to the live subscription. The feed connection is
    /// cycled so the change takes effect immediately; the full set is
    /// replayed on every (re)connect.
    pub async fn subscribe(&self, instrument_keys: &[String]) {
        let mut subs = self.subscriptions.lock().await;
        let mut changed = false;
        for key in instrument_keys {
            changed |= subs.insert(key.clone());
        }
        drop(subs);
        if changed {
            self.resubscribe.notify_one();
        }
    }

    pub async fn unsubscribe(&self, instrument_keys: &[String]) {
        let mut subs = self.subscriptions.lock().await;
        for key in instrument_keys {
            subs.remove(key);
        }
        drop(subs);
        self.resubscribe.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Drive the stream until shutdown. Reconnects with exponential
    /// backoff capped at `max_backoff`; backoff resets after a session
    /// that actually delivered data.
    pub async fn run(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let keys: Vec<String> = {
                let subs = self.subscriptions.lock().await;
                subs.iter().cloned().collect()
            };

            if keys.is_empty() {
                // nothing to stream; wait for a subscription or shutdown
                tokio::select! {
                    _ = self.resubscribe.notified() => continue,
                    _ = self.shutdown.notified() => return,
                }
            }

            match self.pump(&keys).await {
                PumpExit::Shutdown => return,
                PumpExit::Resubscribe => {
                    backoff = INITIAL_BACKOFF;
                }
                PumpExit::Delivered => {
                    backoff = INITIAL_BACKOFF;
                    tracing::warn!("quote feed dropped, reconnecting");
                }
                PumpExit::Failed => {
                    tracing::warn!(
                        backoff_secs = backoff.as_secs(),
                        "quote feed unavailable, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.notified() => return,
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }

    async fn pump(&self, keys: &[String]) -> PumpExit {
        let mut rx = match self.adapter.subscribe_quotes(keys).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(error = %e, "quote subscription failed");
                return PumpExit::Failed;
            }
        };
        tracing::info!(instruments = keys.len(), "quote feed connected");

        let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut delivered = false;

        loop {
            tokio::select! {
                tick = rx.recv() => {
                    match tick {
                        Some(tick) => {
                            // drop anything that does not advance the source clock
                            if let Some(prev) = last_seen.get(&tick.instrument_key) {
                                if tick.source_ts <= *prev {
                                    continue;
                                }
                            }
                            last_seen.insert(tick.instrument_key.clone(), tick.source_ts);
                            self.cache.apply_tick(&tick);
                            // send fails only with zero receivers; that is fine
                            let _ = self.tx.send(tick);
                            delivered = true;
                        }
                        None => {
                            return if delivered { PumpExit::Delivered } else { PumpExit::Failed };
                        }
                    }
                }
                _ = self.resubscribe.notified() => return PumpExit::Resubscribe,
                _ = self.shutdown.notified() => return PumpExit::Shutdown,
            }
        }
    }
}

enum PumpExit {
    Shutdown,
    Resubscribe,
    Delivered,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_adapter::FakeBroker;
    use chrono::TimeZone;

    fn tick(key: &str, ltp: f64, second: u32) -> QuoteTick {
        QuoteTick {
            instrument_key: key.to_string(),
            ltp,
            open: ltp,
            high: ltp,
            low: ltp,
            close: ltp,
            volume: 1.0,
            source_ts: Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, second).unwrap(),
        }
    }

    fn manager_with(ticks: Vec<QuoteTick>) -> (Arc<StreamManager>, Arc<QuoteCache>) {
        let broker = FakeBroker::new();
        broker.set_ticks(ticks);
        let cache = Arc::new(QuoteCache::new(Duration::from_secs(60), 64));
        let manager = Arc::new(StreamManager::new(
            Arc::new(broker),
            cache.clone(),
            256,
            Duration::from_secs(30),
        ));
        (manager, cache)
    }

    #[tokio::test]
    async fn ticks_fan_out_and_warm_the_cache() {
        let (manager, cache) = manager_with(vec![
            tick("NSE_EQ|INFY", 1500.0, 1),
            tick("NSE_EQ|INFY", 1501.0, 2),
        ]);
        manager.subscribe(&["NSE_EQ|INFY".to_string()]).await;

        let mut rx = manager.subscriber();
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.ltp, 1500.0);
        assert_eq!(second.ltp, 1501.0);
        assert_eq!(cache.get_fresh("NSE_EQ|INFY").unwrap().last_trade_price, 1501.0);

        manager.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn duplicate_source_timestamps_are_dropped() {
        let (manager, _) = manager_with(vec![
            tick("NSE_EQ|TCS", 3900.0, 1),
            tick("NSE_EQ|TCS", 3999.0, 1), // same source_ts, must not fan out
            tick("NSE_EQ|TCS", 3905.0, 2),
        ]);
        manager.subscribe(&["NSE_EQ|TCS".to_string()]).await;

        let mut rx = manager.subscriber();
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        assert_eq!(rx.recv().await.unwrap().ltp, 3900.0);
        assert_eq!(rx.recv().await.unwrap().ltp, 3905.0);

        manager.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_without_subscriptions() {
        let (manager, _) = manager_with(vec![]);
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run() should exit on shutdown")
            .unwrap();
    }
}
