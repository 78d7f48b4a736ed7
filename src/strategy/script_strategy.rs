use tracing::debug;

use crate::error::{StrategyError, ValidationError};
use crate::models::{Bar, StrategyConfig};
use crate::strategy::script::{self, eval_rule, BarField, Budget, CompiledScript, Env, Source, StateVar, Value};
use crate::strategy::{IndicatorSet, MarketSnapshot, Signal, Strategy, StrategyKind};

/// A strategy defined by source text, interpreted rule by rule.
///
/// Per symbol and step: while a position is open the first exit rule that
/// fires sells (its fraction comes from the config's exit condition of the
/// same name); while flat the first entry rule that fires buys. Long only,
/// no pyramiding.
pub struct ScriptStrategy {
    config: StrategyConfig,
    compiled: CompiledScript,
    indicators: IndicatorSet,
    budget_limit: u64,
    budget: Budget,
    initialized: bool,
}

impl ScriptStrategy {
    pub fn new(source: &str, config: StrategyConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        let compiled = script::compile(source, &config)?;
        let indicators = IndicatorSet::new(&config.indicators);
        Ok(Self {
            config,
            compiled,
            indicators,
            budget_limit: u64::MAX,
            budget: Budget::unlimited(),
            initialized: false,
        })
    }

    /// Cap on evaluated expression nodes for the whole run.
    pub fn with_step_budget(mut self, limit: u64) -> Self {
        self.budget_limit = limit;
        self.budget = Budget::new(limit);
        self
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn steps_used(&self) -> u64 {
        self.budget.used()
    }

    fn fraction_for(&self, rule: &str) -> Option<f64> {
        let f = self.config.exit_fraction(rule);
        (f < 1.0).then_some(f)
    }

    fn first_firing<'r>(
        rules: &'r [script::CompiledRule],
        env: &ScriptEnv<'_>,
        budget: &mut Budget,
    ) -> Result<Option<&'r str>, StrategyError> {
        for rule in rules {
            if eval_rule(rule, env, budget)? {
                return Ok(Some(rule.name.as_str()));
            }
        }
        Ok(None)
    }

    fn env<'a>(&'a self, symbol: &'a str, snapshot: &'a MarketSnapshot) -> ScriptEnv<'a> {
        ScriptEnv {
            indicators: &self.indicators,
            symbol,
            snapshot,
        }
    }
}

impl Strategy for ScriptStrategy {
    fn name(&self) -> &str {
        &self.compiled.name
    }

    fn symbols(&self) -> &[String] {
        &self.config.symbols
    }

    fn kind(&self) -> StrategyKind {
        if self.config.symbols.len() > 1 && self.compiled.rebalance_every.is_some() {
            StrategyKind::Portfolio
        } else {
            StrategyKind::SingleAsset
        }
    }

    fn initialize(&mut self) -> Result<(), StrategyError> {
        self.indicators = IndicatorSet::new(&self.config.indicators);
        self.budget = Budget::new(self.budget_limit);
        self.initialized = true;
        debug!(
            "Initialized {} ({} entry, {} exit rules)",
            self.compiled.name,
            self.compiled.entries.len(),
            self.compiled.exits.len()
        );
        Ok(())
    }

    fn indicators_mut(&mut self) -> &mut IndicatorSet {
        &mut self.indicators
    }

    fn generate_signals(&mut self, snapshot: &MarketSnapshot) -> Result<Vec<Signal>, StrategyError> {
        if !self.initialized {
            return Err(StrategyError::NotInitialized);
        }
        let mut budget = std::mem::replace(&mut self.budget, Budget::unlimited());
        let out = self.collect_signals(snapshot, &mut budget);
        self.budget = budget;
        out
    }

    fn rebalance_every(&self) -> Option<usize> {
        match self.kind() {
            StrategyKind::Portfolio => self.compiled.rebalance_every,
            StrategyKind::SingleAsset => None,
        }
    }

    /// Equal weight over symbols that are either held with no exit firing or
    /// flat with an entry firing. Held symbols outside that set go to zero.
    fn rebalance(&mut self, snapshot: &MarketSnapshot) -> Result<Vec<Signal>, StrategyError> {
        if !self.initialized {
            return Err(StrategyError::NotInitialized);
        }
        let mut budget = std::mem::replace(&mut self.budget, Budget::unlimited());
        let out = self.select_holdings(snapshot, &mut budget);
        self.budget = budget;
        let (eligible, dropped) = out?;

        let mut signals = Vec::new();
        if !eligible.is_empty() {
            let weight = 1.0 / eligible.len() as f64;
            signals.extend(eligible.iter().map(|s| Signal::target(s, "rebalance", weight)));
        }
        signals.extend(dropped.iter().map(|s| Signal::target(s, "rebalance", 0.0)));
        Ok(signals)
    }
}

impl ScriptStrategy {
    fn collect_signals(
        &self,
        snapshot: &MarketSnapshot,
        budget: &mut Budget,
    ) -> Result<Vec<Signal>, StrategyError> {
        let portfolio = self.kind() == StrategyKind::Portfolio;
        let mut signals = Vec::new();
        for symbol in &self.config.symbols {
            if !snapshot.bars.contains_key(symbol) {
                continue;
            }
            let env = self.env(symbol, snapshot);
            if snapshot.position(symbol).is_some() {
                if let Some(rule) = Self::first_firing(&self.compiled.exits, &env, budget)? {
                    signals.push(Signal::sell(symbol, rule, self.fraction_for(rule)));
                }
            } else if !portfolio {
                // portfolio entries only happen through rebalance
                if let Some(rule) = Self::first_firing(&self.compiled.entries, &env, budget)? {
                    signals.push(Signal::buy(symbol, rule));
                }
            }
        }
        Ok(signals)
    }

    /// (symbols to hold, held symbols to liquidate)
    fn select_holdings(
        &self,
        snapshot: &MarketSnapshot,
        budget: &mut Budget,
    ) -> Result<(Vec<String>, Vec<String>), StrategyError> {
        let mut eligible = Vec::new();
        let mut dropped = Vec::new();
        for symbol in &self.config.symbols {
            if !snapshot.bars.contains_key(symbol) {
                continue;
            }
            let env = self.env(symbol, snapshot);
            let held = snapshot.position(symbol).is_some();
            let keep = if held {
                Self::first_firing(&self.compiled.exits, &env, budget)?.is_none()
            } else {
                Self::first_firing(&self.compiled.entries, &env, budget)?.is_some()
            };
            if keep {
                eligible.push(symbol.clone());
            } else if held {
                dropped.push(symbol.clone());
            }
        }
        Ok((eligible, dropped))
    }
}

struct ScriptEnv<'a> {
    indicators: &'a IndicatorSet,
    symbol: &'a str,
    snapshot: &'a MarketSnapshot,
}

fn field(bar: Option<&Bar>, f: BarField) -> Value {
    match bar {
        None => Value::Missing,
        Some(b) => Value::Num(match f {
            BarField::Open => b.open,
            BarField::High => b.high,
            BarField::Low => b.low,
            BarField::Close => b.close,
            BarField::Volume => b.volume,
        }),
    }
}

fn num(v: Option<f64>) -> Value {
    v.map_or(Value::Missing, Value::Num)
}

impl Env for ScriptEnv<'_> {
    fn load(&self, source: &Source) -> Value {
        match source {
            Source::Indicator(name) => num(self.indicators.value(self.symbol, name)),
            Source::Field(f) => {
                let bar = self
                    .snapshot
                    .bars
                    .get(self.symbol)
                    .or_else(|| self.indicators.last_bar(self.symbol));
                field(bar, *f)
            }
            Source::State(var) => {
                let pos = self.snapshot.position(self.symbol);
                match var {
                    StateVar::Position => Value::Num(pos.map_or(0.0, |p| p.quantity)),
                    StateVar::EntryPrice => num(pos.map(|p| p.avg_entry_price)),
                    StateVar::PnlPct => num(pos.map(|p| p.pnl_pct())),
                    StateVar::Cash => Value::Num(self.snapshot.account.cash),
                    StateVar::BarIndex => match self.indicators.bars_seen(self.symbol) {
                        0 => Value::Missing,
                        n => Value::Num((n - 1) as f64),
                    },
                }
            }
        }
    }

    fn prev(&self, source: &Source) -> Value {
        match source {
            Source::Indicator(name) => num(self.indicators.prev(self.symbol, name)),
            Source::Field(f) => field(self.indicators.prev_bar(self.symbol), *f),
            Source::State(_) => Value::Missing,
        }
    }
}
