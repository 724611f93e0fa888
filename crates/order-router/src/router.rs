//! The order router: validates, risk-checks, and either simulates fills
//! against the quote cache (paper) or relays to the broker adapter (live).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use broker_adapter::{BrokerAdapter, BrokerOrderRequest, OrderPatch};
use market_core::{
    CoreError, CoreResult, Fill, Holding, Order, OrderSide, OrderState, OrderType, QuoteEntry,
    TradingMode,
};
use market_data::QuoteCache;

use crate::holdings::HoldingsBook;
use crate::mode::{ModeChange, ModeManager};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub paper_slippage_bps: f64,
    pub max_order_quantity: u64,
    pub max_position_value: Decimal,
    pub starting_cash: Decimal,
}

/// Fields a working order may change (HTTP body shape).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderModify {
    #[serde(default)]
    pub quantity: Option<u64>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_trigger: Option<Decimal>,
}

/// Inbound order payload (HTTP body shape).
#[derive(Debug, Clone, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: u64,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_trigger: Option<Decimal>,
    /// Client-supplied replay guard; the same key returns the same order.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

struct RouterState {
    orders: HashMap<String, Order>,
    creation_order: Vec<String>,
    idempotency: HashMap<String, String>,
    broker_ids: HashMap<String, String>,
    holdings: HoldingsBook,
    known_symbols: HashSet<String>,
}

pub struct OrderRouter {
    config: RouterConfig,
    mode: ModeManager,
    adapter: Arc<dyn BrokerAdapter>,
    cache: Arc<QuoteCache>,
    state: RwLock<RouterState>,
}

impl OrderRouter {
    pub fn new(
        config: RouterConfig,
        adapter: Arc<dyn BrokerAdapter>,
        cache: Arc<QuoteCache>,
    ) -> Self {
        let holdings = HoldingsBook::new(config.starting_cash);
        Self {
            config,
            mode: ModeManager::new(),
            adapter,
            cache,
            state: RwLock::new(RouterState {
                orders: HashMap::new(),
                creation_order: Vec::new(),
                idempotency: HashMap::new(),
                broker_ids: HashMap::new(),
                holdings,
                known_symbols: HashSet::new(),
            }),
        }
    }

    /// Seed the tradable universe; unknown symbols are rejected up front.
    pub async fn register_instruments(&self, symbols: &[String]) {
        let mut state = self.state.write().await;
        for s in symbols {
            state.known_symbols.insert(s.clone());
        }
    }

    pub async fn mode(&self) -> TradingMode {
        self.mode.current().await
    }

    pub async fn set_mode(
        &self,
        target: TradingMode,
        confirmation: Option<&str>,
    ) -> CoreResult<ModeChange> {
        self.mode.request(target, confirmation).await
    }

    async fn quote(&self, symbol: &str) -> CoreResult<QuoteEntry> {
        let adapter = self.adapter.clone();
        let key = symbol.to_string();
        self.cache
            .get_or_fetch(symbol, move || async move {
                adapter.get_quote(&key).await.map_err(CoreError::from).map(|tick| {
                    let now = Utc::now();
                    QuoteEntry {
                        instrument_key: tick.instrument_key,
                        last_trade_price: tick.ltp,
                        open: tick.open,
                        high: tick.high,
                        low: tick.low,
                        close: tick.close,
                        volume: tick.volume,
                        received_ts: now,
                        source_ts: tick.source_ts,
                        // the cache re-stamps on insert; mirror its TTL shape
                        ttl_deadline: now,
                    }
                })
            })
            .await
    }

    fn validate(&self, request: &OrderRequest, known: &HashSet<String>) -> CoreResult<()> {
        if !known.contains(&request.symbol) {
            return Err(CoreError::InvalidSymbol(request.symbol.clone()));
        }
        if request.quantity == 0 {
            return Err(CoreError::InvalidOrder("quantity must be positive".into()));
        }
        if request.quantity > self.config.max_order_quantity {
            return Err(CoreError::InvalidOrder(format!(
                "quantity {} exceeds cap {}",
                request.quantity, self.config.max_order_quantity
            )));
        }

        let has_limit = request.limit_price.is_some();
        let has_trigger = request.stop_trigger.is_some();
        let shape_ok = match request.order_type {
            OrderType::Market => !has_limit && !has_trigger,
            OrderType::Limit => has_limit && !has_trigger,
            OrderType::Stop => has_limit && has_trigger,
            OrderType::StopMarket => !has_limit && has_trigger,
        };
        if !shape_ok {
            return Err(CoreError::InvalidOrder(format!(
                "price fields inconsistent with {:?} order",
                request.order_type
            )));
        }
        if request.limit_price.is_some_and(|p| p <= Decimal::ZERO)
            || request.stop_trigger.is_some_and(|p| p <= Decimal::ZERO)
        {
            return Err(CoreError::InvalidOrder("prices must be positive".into()));
        }
        Ok(())
    }

    fn check_position_cap(&self, request: &OrderRequest, ltp: Decimal) -> CoreResult<()> {
        let reference = request.limit_price.unwrap_or(ltp);
        let value = reference * Decimal::from(request.quantity);
        if value > self.config.max_position_value {
            return Err(CoreError::InvalidOrder(format!(
                "order value {value} exceeds position cap {}",
                self.config.max_position_value
            )));
        }
        Ok(())
    }

    fn slipped(&self, ltp: Decimal, side: OrderSide) -> Decimal {
        let slip = Decimal::from_f64(self.config.paper_slippage_bps).unwrap_or_default()
            / dec!(10_000);
        let factor = match side {
            OrderSide::Buy => Decimal::ONE + slip,
            OrderSide::Sell => Decimal::ONE - slip,
        };
        (ltp * factor).round_dp(2)
    }

    fn new_order(request: &OrderRequest, mode: TradingMode) -> Order {
        let now = Utc::now();
        Order {
            order_id: Uuid::new_v4().to_string(),
            mode,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: Decimal::from(request.quantity),
            limit_price: request.limit_price,
            stop_trigger: request.stop_trigger,
            state: OrderState::Accepted,
            fills: Vec::new(),
            created_ts: now,
            updated_ts: now,
        }
    }

    /// Accept an order. Validation failures return an error and mutate
    /// nothing; accepted orders are recorded, and adapter failures leave
    /// the record in `rejected` with holdings untouched.
    pub async fn place(&self, request: OrderRequest) -> CoreResult<Order> {
        // replaying an idempotency key returns the original order
        if let Some(key) = &request.idempotency_key {
            let state = self.state.read().await;
            if let Some(order_id) = state.idempotency.get(key) {
                if let Some(order) = state.orders.get(order_id) {
                    tracing::debug!(order_id = %order.order_id, "idempotent order replay");
                    return Ok(order.clone());
                }
            }
        }

        {
            let state = self.state.read().await;
            self.validate(&request, &state.known_symbols)?;
        }

        let quote = self.quote(&request.symbol).await?;
        let ltp = Decimal::from_f64(quote.last_trade_price).ok_or_else(|| {
            CoreError::InvalidData(format!("non-finite quote for {}", request.symbol))
        })?;
        self.check_position_cap(&request, ltp)?;

        let mode = self.mode.current().await;
        let mut order = Self::new_order(&request, mode);

        let mut state = self.state.write().await;
        match mode {
            TradingMode::Paper => self.fill_paper(&mut state, &mut order, ltp),
            TradingMode::Live => {
                let broker_request = BrokerOrderRequest {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    order_type: order.order_type,
                    quantity: request.quantity,
                    limit_price: order.limit_price.and_then(|p| p.to_f64()),
                    stop_trigger: order.stop_trigger.and_then(|p| p.to_f64()),
                    tag: order.order_id.clone(),
                };
                match self.adapter.place_order(&broker_request).await {
                    Ok(broker_id) => {
                        state.broker_ids.insert(order.order_id.clone(), broker_id);
                        order.state = OrderState::Working;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, symbol = %order.symbol, "live order rejected by broker");
                        order.state = OrderState::Rejected;
                    }
                }
            }
        }

        order.updated_ts = Utc::now();
        if let Some(key) = &request.idempotency_key {
            state
                .idempotency
                .insert(key.clone(), order.order_id.clone());
        }
        state.creation_order.push(order.order_id.clone());
        state.orders.insert(order.order_id.clone(), order.clone());
        tracing::info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            state = ?order.state,
            mode = mode.as_str(),
            "order processed"
        );
        Ok(order)
    }

    /// Paper execution against the latest trade price.
    fn fill_paper(&self, state: &mut RouterState, order: &mut Order, ltp: Decimal) {
        let crossed = |limit: Decimal| match order.side {
            OrderSide::Buy => ltp <= limit,
            OrderSide::Sell => ltp >= limit,
        };
        let triggered = |trigger: Decimal| match order.side {
            OrderSide::Buy => ltp >= trigger,
            OrderSide::Sell => ltp <= trigger,
        };

        let fill_price = match order.order_type {
            OrderType::Market => Some(self.slipped(ltp, order.side)),
            OrderType::Limit => order.limit_price.filter(|l| crossed(*l)).map(|_| ltp),
            OrderType::StopMarket => order
                .stop_trigger
                .filter(|t| triggered(*t))
                .map(|_| self.slipped(ltp, order.side)),
            OrderType::Stop => match (order.stop_trigger, order.limit_price) {
                (Some(t), Some(l)) if triggered(t) && crossed(l) => Some(ltp),
                _ => None,
            },
        };

        match fill_price {
            Some(price) => {
                let result = match order.side {
                    OrderSide::Buy => {
                        state.holdings.apply_buy(&order.symbol, order.quantity, price)
                    }
                    OrderSide::Sell => {
                        state.holdings.apply_sell(&order.symbol, order.quantity, price)
                    }
                };
                match result {
                    Ok(()) => {
                        order.fills.push(Fill {
                            price,
                            quantity: order.quantity,
                            ts: Utc::now(),
                        });
                        order.state = OrderState::Filled;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "paper fill rejected by holdings book");
                        order.state = OrderState::Rejected;
                    }
                }
            }
            // resting order, picked up by poll_open_orders
            None => order.state = OrderState::Working,
        }
    }

    /// Re-evaluate resting paper orders against fresh cached quotes.
    /// Returns how many orders changed state.
    pub async fn poll_open_orders(&self) -> usize {
        let mut state = self.state.write().await;
        let working: Vec<String> = state
            .creation_order
            .iter()
            .filter(|id| {
                state
                    .orders
                    .get(*id)
                    .is_some_and(|o| o.mode == TradingMode::Paper && o.state == OrderState::Working)
            })
            .cloned()
            .collect();

        let mut changed = 0;
        for order_id in working {
            let Some(mut order) = state.orders.get(&order_id).cloned() else {
                continue;
            };
            let Some(quote) = self.cache.get_fresh(&order.symbol) else {
                continue;
            };
            let Some(ltp) = Decimal::from_f64(quote.last_trade_price) else {
                continue;
            };
            self.fill_paper(&mut state, &mut order, ltp);
            if order.state != OrderState::Working {
                order.updated_ts = Utc::now();
                changed += 1;
                state.orders.insert(order_id, order);
            }
        }
        changed
    }

    /// Amend a working order. Paper amendments re-evaluate immediately
    /// against the cached quote; live amendments relay to the broker.
    pub async fn modify(&self, order_id: &str, patch: OrderModify) -> CoreResult<Order> {
        if patch.quantity.is_some_and(|q| q == 0 || q > self.config.max_order_quantity) {
            return Err(CoreError::InvalidOrder(format!(
                "modified quantity outside (0, {}]",
                self.config.max_order_quantity
            )));
        }
        if patch.limit_price.is_some_and(|p| p <= Decimal::ZERO)
            || patch.stop_trigger.is_some_and(|p| p <= Decimal::ZERO)
        {
            return Err(CoreError::InvalidOrder("prices must be positive".into()));
        }

        let mut state = self.state.write().await;
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("order {order_id}")))?;
        if order.state != OrderState::Working {
            return Err(CoreError::InvalidOrder(format!(
                "order {order_id} is {:?}, only working orders can be modified",
                order.state
            )));
        }
        // a patch cannot add price fields the order type does not carry
        if (patch.limit_price.is_some() && order.limit_price.is_none())
            || (patch.stop_trigger.is_some() && order.stop_trigger.is_none())
        {
            return Err(CoreError::InvalidOrder(format!(
                "patch fields inconsistent with {:?} order",
                order.order_type
            )));
        }

        if order.mode == TradingMode::Live {
            if let Some(broker_id) = state.broker_ids.get(order_id).cloned() {
                let broker_patch = OrderPatch {
                    quantity: patch.quantity,
                    limit_price: patch.limit_price.and_then(|p| p.to_f64()),
                    stop_trigger: patch.stop_trigger.and_then(|p| p.to_f64()),
                };
                self.adapter
                    .modify_order(&broker_id, &broker_patch)
                    .await
                    .map_err(CoreError::from)?;
            }
        }

        let mut updated = order;
        if let Some(q) = patch.quantity {
            updated.quantity = Decimal::from(q);
        }
        if let Some(p) = patch.limit_price {
            updated.limit_price = Some(p);
        }
        if let Some(t) = patch.stop_trigger {
            updated.stop_trigger = Some(t);
        }
        updated.updated_ts = Utc::now();

        // a paper amendment may have become marketable
        if updated.mode == TradingMode::Paper {
            if let Some(quote) = self.cache.get_fresh(&updated.symbol) {
                if let Some(ltp) = Decimal::from_f64(quote.last_trade_price) {
                    self.fill_paper(&mut state, &mut updated, ltp);
                }
            }
        }

        state.orders.insert(order_id.to_string(), updated.clone());
        tracing::info!(order_id, state = ?updated.state, "order modified");
        Ok(updated)
    }

    pub async fn cancel(&self, order_id: &str) -> CoreResult<Order> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("order {order_id}")))?;

        if order.state.is_terminal() {
            return Err(CoreError::InvalidOrder(format!(
                "order {order_id} is already {:?}",
                order.state
            )));
        }

        if order.mode == TradingMode::Live {
            if let Some(broker_id) = state.broker_ids.get(order_id).cloned() {
                self.adapter
                    .cancel_order(&broker_id)
                    .await
                    .map_err(CoreError::from)?;
            }
        }

        let order = state.orders.get_mut(order_id).expect("checked above");
        order.state = OrderState::Cancelled;
        order.updated_ts = Utc::now();
        Ok(order.clone())
    }

    /// Relay a broker ack/fill back onto the order record (live mode).
    pub async fn apply_broker_update(
        &self,
        broker_order_id: &str,
        new_state: OrderState,
        fill: Option<Fill>,
    ) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let order_id = state
            .broker_ids
            .iter()
            .find(|(_, b)| b.as_str() == broker_order_id)
            .map(|(o, _)| o.clone())
            .ok_or_else(|| CoreError::NotFound(format!("broker order {broker_order_id}")))?;

        if let Some(fill) = &fill {
            // mirror live fills into the book so the snapshotter sees one
            // consistent view regardless of mode
            let (side, symbol) = {
                let order = state.orders.get(&order_id).expect("mapped order exists");
                (order.side, order.symbol.clone())
            };
            let result = match side {
                OrderSide::Buy => state.holdings.apply_buy(&symbol, fill.quantity, fill.price),
                OrderSide::Sell => state.holdings.apply_sell(&symbol, fill.quantity, fill.price),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "live fill could not be mirrored into holdings");
            }
        }

        let order = state.orders.get_mut(&order_id).expect("mapped order exists");
        if let Some(fill) = fill {
            order.fills.push(fill);
        }
        order.state = new_state;
        order.updated_ts = Utc::now();
        Ok(())
    }

    pub async fn get(&self, order_id: &str) -> CoreResult<Order> {
        let state = self.state.read().await;
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("order {order_id}")))
    }

    pub async fn list(&self) -> Vec<Order> {
        let state = self.state.read().await;
        state
            .creation_order
            .iter()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect()
    }

    /// Snapshot of the holdings book valued at cached last prices.
    pub async fn holdings_valued(&self) -> (Decimal, Decimal, Vec<Holding>) {
        let state = self.state.read().await;
        let mut prices = BTreeMap::new();
        for symbol in state.holdings.symbols() {
            if let Some(quote) = self.cache.get_fresh(&symbol) {
                if let Some(price) = Decimal::from_f64(quote.last_trade_price) {
                    prices.insert(symbol, price);
                }
            }
        }
        let (total, holdings) = state.holdings.valued(&prices);
        (state.holdings.cash(), total, holdings)
    }
}
