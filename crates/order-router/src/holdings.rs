//! The virtual holdings book behind paper trading. Only the order router
//! mutates it; everyone else reads cloned snapshots.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use market_core::{CoreError, CoreResult, Holding};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingsBook {
    cash: Decimal,
    positions: BTreeMap<String, Position>,
}

impl HoldingsBook {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            cash: starting_cash,
            positions: BTreeMap::new(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Buy at a fill price: debit cash, merge into the average entry.
    pub fn apply_buy(&mut self, symbol: &str, quantity: Decimal, price: Decimal) -> CoreResult<()> {
        let cost = quantity * price;
        if cost > self.cash {
            return Err(CoreError::InvalidOrder(format!(
                "insufficient cash: need {cost}, have {}",
                self.cash
            )));
        }
        self.cash -= cost;
        match self.positions.get_mut(symbol) {
            Some(pos) => {
                let total_qty = pos.quantity + quantity;
                pos.avg_price = (pos.avg_price * pos.quantity + cost) / total_qty;
                pos.quantity = total_qty;
            }
            None => {
                self.positions.insert(
                    symbol.to_string(),
                    Position {
                        quantity,
                        avg_price: price,
                    },
                );
            }
        }
        Ok(())
    }

    /// Sell from an existing position; no naked shorts in the paper book.
    pub fn apply_sell(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> CoreResult<()> {
        let pos = self.positions.get_mut(symbol).ok_or_else(|| {
            CoreError::InvalidOrder(format!("cannot sell {symbol}: no position"))
        })?;
        if quantity > pos.quantity {
            return Err(CoreError::InvalidOrder(format!(
                "cannot sell {quantity} of {symbol}: hold {}",
                pos.quantity
            )));
        }
        self.cash += quantity * price;
        pos.quantity -= quantity;
        if pos.quantity.is_zero() {
            self.positions.remove(symbol);
        }
        Ok(())
    }

    /// Value the book against last prices (missing prices fall back to
    /// the average entry, valuing the position at cost).
    pub fn valued(&self, last_prices: &BTreeMap<String, Decimal>) -> (Decimal, Vec<Holding>) {
        let mut holdings = Vec::with_capacity(self.positions.len());
        let mut total = self.cash;
        for (symbol, pos) in &self.positions {
            let last = last_prices.get(symbol).copied().unwrap_or(pos.avg_price);
            let market_value = pos.quantity * last;
            total += market_value;
            holdings.push(Holding {
                symbol: symbol.clone(),
                quantity: pos.quantity,
                avg_price: pos.avg_price,
                last_price: last,
                unrealised_pnl: market_value - pos.quantity * pos.avg_price,
            });
        }
        (total, holdings)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }
}
