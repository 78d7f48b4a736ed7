pub mod indicators;
pub mod script;
pub mod script_strategy;
pub mod template;

pub use indicators::{IndicatorSet, RollingIndicator};
pub use script_strategy::ScriptStrategy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StrategyError;
use crate::models::{AccountSnapshot, Bar, Position, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SingleAsset,
    Portfolio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Name of the rule that produced the signal.
    pub rule: String,
    /// Share of the open position to sell on an exit; full exit when `None`.
    #[serde(default)]
    pub fractional_exit: Option<f64>,
    /// Portfolio target weight. The harness turns it into a buy or a sell
    /// against current holdings, so `side` is ignored when this is set.
    #[serde(default)]
    pub target_weight: Option<f64>,
}

impl Signal {
    pub fn buy(symbol: &str, rule: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Buy,
            rule: rule.to_string(),
            fractional_exit: None,
            target_weight: None,
        }
    }

    pub fn sell(symbol: &str, rule: &str, fraction: Option<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Sell,
            rule: rule.to_string(),
            fractional_exit: fraction,
            target_weight: None,
        }
    }

    pub fn target(symbol: &str, rule: &str, weight: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Buy,
            rule: rule.to_string(),
            fractional_exit: None,
            target_weight: Some(weight),
        }
    }
}

/// What a strategy sees when asked for signals: the bars printed at
/// `timestamp` and the account state after they were applied.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Index of this trading step, starting at 0.
    pub step: usize,
    pub bars: BTreeMap<String, Bar>,
    pub account: AccountSnapshot,
}

impl MarketSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.account.position(symbol).filter(|p| p.quantity > 0.0)
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.bars.get(symbol).map(|b| b.close)
    }
}

/// The contract every executable strategy satisfies.
///
/// `on_bar` runs for every symbol's bar before `generate_signals` is called
/// for that step. Portfolio strategies also get `rebalance` every
/// `rebalance_every()` steps.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn symbols(&self) -> &[String];

    fn kind(&self) -> StrategyKind {
        StrategyKind::SingleAsset
    }

    /// One-time setup of indicator state. Called again, it starts over.
    fn initialize(&mut self) -> Result<(), StrategyError>;

    fn indicators_mut(&mut self) -> &mut IndicatorSet;

    fn on_bar(&mut self, symbol: &str, bar: &Bar, _timestamp: DateTime<Utc>) {
        self.indicators_mut().update(symbol, bar);
    }

    fn generate_signals(&mut self, snapshot: &MarketSnapshot) -> Result<Vec<Signal>, StrategyError>;

    /// Quantity to buy on an entry: equal weight across symbols, capped at cash.
    fn position_size(&self, symbol: &str, snapshot: &MarketSnapshot) -> f64 {
        let price = match snapshot.price(symbol) {
            Some(p) if p > 0.0 => p,
            _ => return 0.0,
        };
        let n = self.symbols().len().max(1) as f64;
        let notional = (snapshot.account.equity / n).min(snapshot.account.cash);
        (notional / price).max(0.0)
    }

    fn rebalance_every(&self) -> Option<usize> {
        None
    }

    /// Portfolio hook. Default: equal weight over symbols priced this step.
    fn rebalance(&mut self, snapshot: &MarketSnapshot) -> Result<Vec<Signal>, StrategyError> {
        let priced: Vec<&String> = self
            .symbols()
            .iter()
            .filter(|s| snapshot.price(s).is_some())
            .collect();
        if priced.is_empty() {
            return Ok(Vec::new());
        }
        let weight = 1.0 / priced.len() as f64;
        Ok(priced
            .into_iter()
            .map(|s| Signal::target(s, "rebalance", weight))
            .collect())
    }
}
