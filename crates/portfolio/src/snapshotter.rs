//! Periodic portfolio snapshotter with session-end forcing and retention
//! pruning.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, Utc};
use tokio::sync::Notify;

use market_core::{CoreResult, PortfolioSnapshot};
use order_router::OrderRouter;

use crate::store::SnapshotStore;

pub struct Snapshotter {
    router: Arc<OrderRouter>,
    store: SnapshotStore,
    interval: Duration,
    session_end: NaiveTime,
    retention_days: u32,
    shutdown: Notify,
}

impl Snapshotter {
    pub fn new(
        router: Arc<OrderRouter>,
        store: SnapshotStore,
        interval: Duration,
        session_end: NaiveTime,
        retention_days: u32,
    ) -> Self {
        Self {
            router,
            store,
            interval,
            session_end,
            retention_days,
            shutdown: Notify::new(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Read the holdings book, value it at the latest cached prices, and
    /// persist one snapshot.
    pub async fn snapshot_now(&self) -> CoreResult<PortfolioSnapshot> {
        let (cash, total_value, holdings) = self.router.holdings_valued().await;
        let snapshot = PortfolioSnapshot {
            snapshot_ts: Utc::now(),
            cash,
            total_value,
            holdings,
        };
        self.store.insert(&snapshot).await?;
        tracing::debug!(
            total = %snapshot.total_value,
            positions = snapshot.holdings.len(),
            "portfolio snapshot written"
        );
        Ok(snapshot)
    }

    async fn prune(&self) {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days as i64);
        match self.store.prune_before(cutoff).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(pruned = n, "old snapshots removed"),
            Err(e) => tracing::warn!(error = %e, "snapshot pruning failed"),
        }
    }

    /// Run until shutdown: one snapshot per interval, a forced snapshot
    /// the first tick at or past session end each day, and retention
    /// pruning along the way. A final snapshot is written on shutdown.
    pub async fn run(&self) {
        let mut session_end_done: Option<NaiveDate> = None;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.snapshot_now().await {
                        tracing::warn!(error = %e, "interval snapshot failed");
                    }

                    // session_end is configured as UTC wall time
                    let now = Utc::now();
                    let today = now.date_naive();
                    let past_session_end = now.time() >= self.session_end;
                    if past_session_end && session_end_done != Some(today) {
                        session_end_done = Some(today);
                        if let Err(e) = self.snapshot_now().await {
                            tracing::warn!(error = %e, "session-end snapshot failed");
                        } else {
                            tracing::info!("session-end snapshot forced");
                        }
                    }

                    self.prune().await;
                }
                _ = self.shutdown.notified() => {
                    // end-of-session snapshot is forced even on shutdown
                    if let Err(e) = self.snapshot_now().await {
                        tracing::warn!(error = %e, "shutdown snapshot failed");
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_adapter::{FakeBroker, QuoteTick};
    use market_core::{OrderSide, OrderType};
    use market_data::QuoteCache;
    use order_router::{OrderRequest, RouterConfig};
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<OrderRouter>, SnapshotStore) {
        let broker = Arc::new(FakeBroker::new());
        broker.set_ticks(vec![QuoteTick {
            instrument_key: "NSE_EQ|INFY".to_string(),
            ltp: 100.0,
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 10.0,
            source_ts: Utc::now(),
        }]);
        let cache = Arc::new(QuoteCache::new(Duration::from_secs(60), 64));
        let router = Arc::new(OrderRouter::new(
            RouterConfig {
                paper_slippage_bps: 0.0,
                max_order_quantity: 1_000,
                max_position_value: dec!(1_000_000),
                starting_cash: dec!(10_000),
            },
            broker,
            cache,
        ));
        router
            .register_instruments(&["NSE_EQ|INFY".to_string()])
            .await;
        let store = SnapshotStore::new("sqlite::memory:").await.unwrap();
        (router, store)
    }

    #[tokio::test]
    async fn snapshot_reflects_holdings_and_cash() {
        let (router, store) = setup().await;
        router
            .place(OrderRequest {
                symbol: "NSE_EQ|INFY".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: 10,
                limit_price: None,
                stop_trigger: None,
                idempotency_key: None,
            })
            .await
            .unwrap();

        let snapshotter = Snapshotter::new(
            router,
            store.clone(),
            Duration::from_secs(900),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            365,
        );
        let snapshot = snapshotter.snapshot_now().await.unwrap();
        assert_eq!(snapshot.cash, dec!(9_000));
        assert_eq!(snapshot.total_value, dec!(10_000));
        assert_eq!(snapshot.holdings.len(), 1);

        let stored = store.latest().await.unwrap().unwrap();
        assert_eq!(stored.holdings.len(), 1);
    }
}
