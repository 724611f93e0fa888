//! Deterministic in-memory broker for tests and offline development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use market_core::{Bar, Timeframe};

use crate::types::{
    AdapterError, AdapterResult, BrokerAdapter, BrokerOrderRequest, OrderPatch, QuoteTick,
};

#[derive(Default)]
struct FakeState {
    bars: HashMap<(String, Timeframe), Vec<Bar>>,
    ticks: Vec<QuoteTick>,
    placed: Vec<BrokerOrderRequest>,
    cancelled: Vec<String>,
    /// Errors to inject, consumed in order, before any real behaviour.
    fail_queue: Vec<AdapterError>,
}

pub struct FakeBroker {
    state: Mutex<FakeState>,
    order_seq: AtomicU64,
    pub historical_calls: AtomicUsize,
    pub quote_calls: AtomicUsize,
    /// Artificial latency applied to historical fetches, for coalescing tests.
    pub fetch_delay: std::time::Duration,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            order_seq: AtomicU64::new(1),
            historical_calls: AtomicUsize::new(0),
            quote_calls: AtomicUsize::new(0),
            fetch_delay: std::time::Duration::ZERO,
        }
    }

    pub fn with_fetch_delay(mut self, delay: std::time::Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn set_bars(&self, symbol: &str, timeframe: Timeframe, bars: Vec<Bar>) {
        self.state
            .lock()
            .unwrap()
            .bars
            .insert((symbol.to_string(), timeframe), bars);
    }

    pub fn set_ticks(&self, ticks: Vec<QuoteTick>) {
        self.state.lock().unwrap().ticks = ticks;
    }

    /// Queue an error; the next adapter call consumes and returns it.
    pub fn inject_failure(&self, err: AdapterError) {
        self.state.lock().unwrap().fail_queue.push(err);
    }

    pub fn placed_orders(&self) -> Vec<BrokerOrderRequest> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    fn take_injected(&self) -> Option<AdapterError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_queue.is_empty() {
            None
        } else {
            Some(state.fail_queue.remove(0))
        }
    }
}

#[async_trait]
impl BrokerAdapter for FakeBroker {
    async fn get_historical_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> AdapterResult<Vec<Bar>> {
        self.historical_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        if self.fetch_delay > std::time::Duration::ZERO {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let state = self.state.lock().unwrap();
        let bars = state
            .bars
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| AdapterError::Permanent(format!("no data seeded for {symbol}")))?;
        Ok(bars
            .iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect())
    }

    async fn get_quote(&self, instrument_key: &str) -> AdapterResult<QuoteTick> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        if self.fetch_delay > std::time::Duration::ZERO {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let state = self.state.lock().unwrap();
        state
            .ticks
            .iter()
            .rev()
            .find(|t| t.instrument_key == instrument_key)
            .cloned()
            .ok_or_else(|| AdapterError::Permanent(format!("no quote seeded for {instrument_key}")))
    }

    async fn subscribe_quotes(
        &self,
        instrument_keys: &[String],
    ) -> AdapterResult<mpsc::Receiver<QuoteTick>> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let wanted: Vec<String> = instrument_keys.to_vec();
        let ticks: Vec<QuoteTick> = self
            .state
            .lock()
            .unwrap()
            .ticks
            .iter()
            .filter(|t| wanted.contains(&t.instrument_key))
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for tick in ticks {
                if tx.send(tick).await.is_err() {
                    break;
                }
            }
            // sender drops here; the stream ends like a closed feed
        });
        Ok(rx)
    }

    async fn place_order(&self, order: &BrokerOrderRequest) -> AdapterResult<String> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let id = self.order_seq.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().placed.push(order.clone());
        Ok(format!("FAKE-{id:06}"))
    }

    async fn modify_order(&self, _broker_order_id: &str, _patch: &OrderPatch) -> AdapterResult<()> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> AdapterResult<()> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        self.state
            .lock()
            .unwrap()
            .cancelled
            .push(broker_order_id.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use market_core::{OrderSide, OrderType};

    fn bar(minute: i64) -> Bar {
        Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, 9, 15, 0).unwrap()
                + Duration::minutes(minute),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1000.0,
        }
    }

    #[tokio::test]
    async fn seeded_bars_filter_by_range() {
        let broker = FakeBroker::new();
        broker.set_bars("INFY", Timeframe::Min5, vec![bar(0), bar(5), bar(10)]);
        let start = bar(5).timestamp;
        let end = bar(10).timestamp;
        let bars = broker
            .get_historical_ohlcv("INFY", start, end, Timeframe::Min5)
            .await
            .unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let broker = FakeBroker::new();
        broker.set_bars("INFY", Timeframe::Min5, vec![bar(0)]);
        broker.inject_failure(AdapterError::Transient("blip".into()));

        let start = bar(0).timestamp;
        assert!(broker
            .get_historical_ohlcv("INFY", start, start, Timeframe::Min5)
            .await
            .is_err());
        assert!(broker
            .get_historical_ohlcv("INFY", start, start, Timeframe::Min5)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn placed_orders_are_recorded_with_unique_ids() {
        let broker = FakeBroker::new();
        let req = BrokerOrderRequest {
            symbol: "INFY".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 10,
            limit_price: None,
            stop_trigger: None,
            tag: "t1".into(),
        };
        let a = broker.place_order(&req).await.unwrap();
        let b = broker.place_order(&req).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(broker.placed_orders().len(), 2);
    }

    #[tokio::test]
    async fn subscription_replays_matching_ticks() {
        let broker = FakeBroker::new();
        broker.set_ticks(vec![
            QuoteTick {
                instrument_key: "NSE_EQ|INFY".into(),
                ltp: 1500.0,
                open: 1490.0,
                high: 1505.0,
                low: 1488.0,
                close: 1495.0,
                volume: 100.0,
                source_ts: Utc::now(),
            },
            QuoteTick {
                instrument_key: "NSE_EQ|TCS".into(),
                ltp: 3900.0,
                open: 3890.0,
                high: 3915.0,
                low: 3885.0,
                close: 3895.0,
                volume: 50.0,
                source_ts: Utc::now(),
            },
        ]);

        let mut rx = broker
            .subscribe_quotes(&["NSE_EQ|INFY".to_string()])
            .await
            .unwrap();
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.instrument_key, "NSE_EQ|INFY");
        assert!(rx.recv().await.is_none());
    }
}
