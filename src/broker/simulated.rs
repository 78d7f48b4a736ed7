use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::broker::{Broker, HistoricalData, MarketData};
use crate::error::BrokerError;
use crate::models::{AccountSnapshot, Bar, BarSeries, Interval, Order, OrderType, Position, Side};

const QTY_EPSILON: f64 = 1e-9;

/// In-memory ledger. Every order fills immediately at the last-known price;
/// positions use weighted-average cost. Insufficient cash (or selling more than
/// is held) clamps the quantity and the clamp is recorded on the order.
pub struct SimulatedBroker {
    data: HistoricalData,
    cash: f64,
    positions: BTreeMap<String, Position>,
    last_prices: BTreeMap<String, f64>,
    /// Timestamp of the latest bar seen; used instead of Utc::now() for fills.
    pub sim_time: Option<DateTime<Utc>>,
    order_counter: u64,
    orders: Vec<Order>,
}

impl SimulatedBroker {
    pub fn new(data: HistoricalData, initial_cash: f64) -> Self {
        Self {
            data,
            cash: initial_cash,
            positions: BTreeMap::new(),
            last_prices: BTreeMap::new(),
            sim_time: None,
            order_counter: 0,
            orders: Vec::new(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.sim_time.unwrap_or_else(Utc::now)
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn equity(&self) -> f64 {
        self.cash + self.positions.values().map(|p| p.market_value()).sum::<f64>()
    }

    fn last_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.last_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::NoPrice {
                symbol: symbol.to_string(),
            })
    }

    fn next_id(&mut self) -> String {
        self.order_counter += 1;
        format!("sim-{:06}", self.order_counter)
    }

    fn fill_buy(&mut self, symbol: &str, requested: f64, order_type: OrderType) -> Result<Order, BrokerError> {
        let price = self.last_price(symbol)?;
        let now = self.now();

        let mut qty = requested;
        if qty * price > self.cash + 1e-9 {
            let affordable = floor8((self.cash / price).max(0.0));
            warn!(
                "Clamped buy {} {:.8} -> {:.8} (cash ${:.2} at ${:.4})",
                symbol, requested, affordable, self.cash, price
            );
            qty = affordable;
        }

        let id = self.next_id();
        let order = Order::filled(id, symbol, Side::Buy, requested, qty, order_type, price, now);
        if qty <= 0.0 {
            return Ok(order);
        }

        self.cash -= qty * price;
        let pos = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position {
                symbol: symbol.to_string(),
                quantity: 0.0,
                avg_entry_price: 0.0,
                realized_pnl: 0.0,
                market_price: price,
                opened_at: Some(now),
            });
        let new_qty = pos.quantity + qty;
        pos.avg_entry_price = (pos.avg_entry_price * pos.quantity + price * qty) / new_qty;
        pos.quantity = new_qty;
        pos.market_price = price;

        debug!("[SIM] BUY {} {:.8} @ {:.4}", symbol, qty, price);
        Ok(order)
    }

    fn fill_sell(&mut self, symbol: &str, requested: f64, order_type: OrderType) -> Result<Order, BrokerError> {
        let price = self.last_price(symbol)?;
        let now = self.now();
        let held = self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0.0);

        let mut qty = requested;
        if qty > held + QTY_EPSILON {
            warn!(
                "Clamped sell {} {:.8} -> {:.8} (held quantity)",
                symbol, requested, held
            );
            qty = held;
        } else if qty > held {
            qty = held;
        }

        let id = self.next_id();
        let order = Order::filled(id, symbol, Side::Sell, requested, qty, order_type, price, now);
        if qty <= 0.0 {
            return Ok(order);
        }

        self.cash += qty * price;
        let mut closed = false;
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.realized_pnl += (price - pos.avg_entry_price) * qty;
            pos.quantity -= qty;
            pos.market_price = price;
            closed = pos.quantity <= QTY_EPSILON;
        }
        if closed {
            if let Some(pos) = self.positions.remove(symbol) {
                debug!(
                    "[SIM] closed {} realized ${:+.2}",
                    symbol, pos.realized_pnl
                );
            }
        }

        debug!("[SIM] SELL {} {:.8} @ {:.4}", symbol, qty, price);
        Ok(order)
    }
}

#[async_trait]
impl MarketData for SimulatedBroker {
    async fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<BarSeries, BrokerError> {
        self.data.get_bars(symbol, start, end, interval).await
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.last_price(symbol)
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    async fn get_account(&mut self) -> Result<AccountSnapshot, BrokerError> {
        Ok(AccountSnapshot {
            cash: self.cash,
            equity: self.equity(),
            positions: self.positions.values().cloned().collect(),
            taken_at: self.now(),
        })
    }

    async fn get_position(&mut self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        Ok(self.positions.get(symbol).cloned())
    }

    async fn submit_order(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
    ) -> Result<Order, BrokerError> {
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(BrokerError::InvalidOrder {
                reason: format!("quantity {} for {}", quantity, symbol),
            });
        }
        let order = match side {
            Side::Buy => self.fill_buy(symbol, quantity, order_type)?,
            Side::Sell => self.fill_sell(symbol, quantity, order_type)?,
        };
        self.orders.push(order.clone());
        Ok(order)
    }

    async fn close_position(&mut self, symbol: &str) -> Result<Option<Order>, BrokerError> {
        let held = match self.positions.get(symbol) {
            Some(p) => p.quantity,
            None => return Ok(None),
        };
        let order = self
            .submit_order(symbol, Side::Sell, held, OrderType::Market)
            .await?;
        Ok(Some(order))
    }

    fn on_market_bar(&mut self, symbol: &str, bar: &Bar) {
        self.last_prices.insert(symbol.to_string(), bar.close);
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.market_price = bar.close;
        }
        if self.sim_time.map_or(true, |t| bar.timestamp > t) {
            self.sim_time = Some(bar.timestamp);
        }
        self.data.set_time(bar.timestamp);
    }
}

fn floor8(x: f64) -> f64 {
    (x * 1e8).floor() / 1e8
}
