use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit { price: f64 },
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit { .. } => "limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    /// Quantity clamped all the way to zero; nothing traded.
    ClampedToZero,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }
}

/// An order as reported by a broker. Only brokers construct orders, and a
/// filled order has no mutators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    id: String,
    symbol: String,
    side: Side,
    quantity: f64,
    requested_quantity: f64,
    order_type: OrderType,
    fill_price: Option<f64>,
    filled_at: Option<DateTime<Utc>>,
    status: OrderStatus,
    #[serde(default)]
    clamped_from: Option<f64>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn filled(
        id: String,
        symbol: &str,
        side: Side,
        requested_quantity: f64,
        quantity: f64,
        order_type: OrderType,
        fill_price: f64,
        filled_at: DateTime<Utc>,
    ) -> Self {
        let clamped = (requested_quantity - quantity).abs() > 1e-12;
        let status = if quantity <= 0.0 {
            OrderStatus::ClampedToZero
        } else {
            OrderStatus::Filled
        };
        Self {
            id,
            symbol: symbol.to_string(),
            side,
            quantity,
            requested_quantity,
            order_type,
            fill_price: if quantity > 0.0 { Some(fill_price) } else { None },
            filled_at: if quantity > 0.0 { Some(filled_at) } else { None },
            status,
            clamped_from: if clamped { Some(requested_quantity) } else { None },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: String,
        symbol: &str,
        side: Side,
        requested_quantity: f64,
        quantity: f64,
        order_type: OrderType,
        fill_price: Option<f64>,
        filled_at: Option<DateTime<Utc>>,
        status: OrderStatus,
    ) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            side,
            quantity,
            requested_quantity,
            order_type,
            fill_price,
            filled_at,
            status,
            clamped_from: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Executed quantity (after any clamp).
    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn requested_quantity(&self) -> f64 {
        self.requested_quantity
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    pub fn fill_price(&self) -> Option<f64> {
        self.fill_price
    }

    pub fn filled_at(&self) -> Option<DateTime<Utc>> {
        self.filled_at
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Original requested quantity when the broker had to clamp it.
    pub fn clamped_from(&self) -> Option<f64> {
        self.clamped_from
    }

    pub fn notional(&self) -> f64 {
        self.fill_price.map(|p| p * self.quantity).unwrap_or(0.0)
    }
}
