pub mod cache;
pub mod historical;
pub mod live;
pub mod simulated;

pub use cache::{load_bars_file, CachedMarketData};
pub use historical::HistoricalData;
pub use live::LiveBroker;
pub use simulated::SimulatedBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BrokerError;
use crate::models::{AccountSnapshot, Bar, BarSeries, Interval, Order, OrderType, Position, Side};

/// Historical and live price source. Bars come back ascending; missing
/// sessions are absent, never interpolated.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<BarSeries, BrokerError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError>;
}

/// Uniform account/position/order surface shared by the simulated ledger and
/// the live adapter, so a strategy behaves the same against either.
#[async_trait]
pub trait Broker: MarketData {
    async fn get_account(&mut self) -> Result<AccountSnapshot, BrokerError>;

    async fn get_position(&mut self, symbol: &str) -> Result<Option<Position>, BrokerError>;

    async fn submit_order(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        order_type: OrderType,
    ) -> Result<Order, BrokerError>;

    /// Liquidate the whole position; `None` when nothing is held.
    async fn close_position(&mut self, symbol: &str) -> Result<Option<Order>, BrokerError>;

    /// New bar for `symbol`. Brokers that price from a live feed ignore it.
    fn on_market_bar(&mut self, _symbol: &str, _bar: &Bar) {}
}
