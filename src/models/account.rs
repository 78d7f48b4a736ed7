use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Long position in one symbol, weighted-average-cost basis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_entry_price: f64,
    /// Accumulated across partial closes of this position.
    pub realized_pnl: f64,
    pub market_price: f64,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn unrealized_pnl(&self) -> f64 {
        (self.market_price - self.avg_entry_price) * self.quantity
    }

    pub fn market_value(&self) -> f64 {
        self.market_price * self.quantity
    }

    /// Percent move of the market price against the average entry.
    pub fn pnl_pct(&self) -> f64 {
        if self.avg_entry_price > 0.0 {
            (self.market_price / self.avg_entry_price - 1.0) * 100.0
        } else {
            0.0
        }
    }
}

/// Point-in-time read of broker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub cash: f64,
    pub equity: f64,
    pub positions: Vec<Position>,
    pub taken_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }
}
