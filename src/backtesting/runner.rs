use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{BrokerError, ExecutionError};
use crate::models::{Bar, BarSeries, DateRange, Interval, Order, OrderType, Side};
use crate::strategy::{MarketSnapshot, Signal, Strategy, StrategyKind};

use super::report::{BacktestResult, EquityPoint, Metrics, RoundTrip};

const QTY_EPSILON: f64 = 1e-9;

/// A round trip that has not gone flat yet.
#[derive(Debug, Clone)]
struct OpenTrip {
    opened_at: DateTime<Utc>,
    bought: f64,
    cost: f64,
    sold: f64,
    proceeds: f64,
    pnl: f64,
    exits: usize,
}

impl OpenTrip {
    fn new(opened_at: DateTime<Utc>) -> Self {
        Self {
            opened_at,
            bought: 0.0,
            cost: 0.0,
            sold: 0.0,
            proceeds: 0.0,
            pnl: 0.0,
            exits: 0,
        }
    }

    fn close(self, symbol: &str, closed_at: DateTime<Utc>) -> RoundTrip {
        RoundTrip {
            symbol: symbol.to_string(),
            opened_at: self.opened_at,
            closed_at,
            quantity: self.sold,
            avg_entry_price: if self.bought > 0.0 { self.cost / self.bought } else { 0.0 },
            avg_exit_price: if self.sold > 0.0 { self.proceeds / self.sold } else { 0.0 },
            pnl: self.pnl,
            exits: self.exits,
        }
    }
}

fn data_error(symbol: &str, e: BrokerError) -> ExecutionError {
    ExecutionError::Data {
        reason: format!("{}: {}", symbol, e),
    }
}

fn broker_error(e: BrokerError) -> ExecutionError {
    ExecutionError::Internal {
        reason: e.to_string(),
    }
}

/// Steps a strategy through historical bars against a broker, one
/// timestamp at a time, and scores the run.
///
/// Per step: every symbol's bar goes to the broker and then to
/// `Strategy::on_bar`; signals are collected from a fresh account snapshot;
/// exits are sold first, then rebalance targets (sells before buys), then
/// entries are bought. Positions still open at the end stay open.
pub struct BacktestHarness<'a, S: ?Sized, B: ?Sized> {
    strategy: &'a mut S,
    broker: &'a mut B,
    orders: Vec<Order>,
    trades: Vec<RoundTrip>,
    open: BTreeMap<String, OpenTrip>,
    clamped_orders: usize,
    signals_generated: usize,
}

impl<'a, S, B> BacktestHarness<'a, S, B>
where
    S: Strategy + ?Sized,
    B: Broker + ?Sized,
{
    pub fn new(strategy: &'a mut S, broker: &'a mut B) -> Self {
        Self {
            strategy,
            broker,
            orders: Vec::new(),
            trades: Vec::new(),
            open: BTreeMap::new(),
            clamped_orders: 0,
            signals_generated: 0,
        }
    }

    /// Run the full backtest over `range`.
    pub async fn run(
        mut self,
        symbols: &[String],
        range: DateRange,
        interval: Interval,
    ) -> Result<BacktestResult, ExecutionError> {
        self.strategy.initialize()?;

        let mut series: BTreeMap<String, BarSeries> = BTreeMap::new();
        for symbol in symbols {
            let bars = self
                .broker
                .get_bars(symbol, range.start, range.end, interval)
                .await
                .map_err(|e| data_error(symbol, e))?;
            if bars.is_empty() {
                warn!("No {} bars for {} in range", interval, symbol);
            }
            series.insert(symbol.clone(), bars);
        }

        let timestamps: BTreeSet<DateTime<Utc>> = series
            .values()
            .flat_map(|s| s.iter().map(|b| b.timestamp))
            .collect();
        if timestamps.is_empty() {
            return Err(ExecutionError::Data {
                reason: format!(
                    "no bars for {} between {} and {}",
                    symbols.join(","),
                    range.start.format("%Y-%m-%d"),
                    range.end.format("%Y-%m-%d")
                ),
            });
        }

        let initial = self.broker.get_account().await.map_err(broker_error)?;
        let initial_capital = initial.equity;
        let total_steps = timestamps.len();
        let log_interval = (total_steps / 10).max(1);

        info!("=== BACKTEST START ===");
        info!(
            "Strategy {} | {} to {} | {} steps of {} | {} symbol(s)",
            self.strategy.name(),
            range.start.format("%Y-%m-%d"),
            range.end.format("%Y-%m-%d"),
            total_steps,
            interval,
            symbols.len()
        );
        info!("Initial capital: ${:.2}", initial_capital);

        let rebalance_every = match self.strategy.kind() {
            StrategyKind::Portfolio => self.strategy.rebalance_every(),
            StrategyKind::SingleAsset => None,
        };

        let mut cursors: BTreeMap<&str, usize> = BTreeMap::new();
        let mut equity_curve = Vec::with_capacity(total_steps);
        let mut bars_processed = 0usize;

        for (step, &ts) in timestamps.iter().enumerate() {
            let mut day_bars: BTreeMap<String, Bar> = BTreeMap::new();
            for (symbol, bars) in &series {
                let idx = cursors.entry(symbol.as_str()).or_insert(0);
                if let Some(bar) = bars.as_slice().get(*idx).filter(|b| b.timestamp == ts) {
                    day_bars.insert(symbol.clone(), bar.clone());
                    *idx += 1;
                }
            }

            for (symbol, bar) in &day_bars {
                self.broker.on_market_bar(symbol, bar);
                self.strategy.on_bar(symbol, bar, ts);
                bars_processed += 1;
            }

            let account = self.broker.get_account().await.map_err(broker_error)?;
            let mut snapshot = MarketSnapshot {
                timestamp: ts,
                step,
                bars: day_bars,
                account,
            };

            let signals = self.strategy.generate_signals(&snapshot)?;
            let targets = match rebalance_every {
                Some(n) if step % n == 0 => self.strategy.rebalance(&snapshot)?,
                _ => Vec::new(),
            };
            self.signals_generated += signals.len() + targets.len();

            let (weighted, plain): (Vec<Signal>, Vec<Signal>) = signals
                .into_iter()
                .chain(targets)
                .partition(|s| s.target_weight.is_some());

            for signal in plain.iter().filter(|s| s.side == Side::Sell) {
                self.exit(signal, ts).await?;
            }

            if !weighted.is_empty() {
                snapshot.account = self.broker.get_account().await.map_err(broker_error)?;
                self.rebalance_to(&weighted, &snapshot).await?;
            }

            for signal in plain.iter().filter(|s| s.side == Side::Buy) {
                // sized against cash left by earlier fills this step
                snapshot.account = self.broker.get_account().await.map_err(broker_error)?;
                self.enter(signal, &snapshot).await?;
            }

            let equity = self.broker.get_account().await.map_err(broker_error)?.equity;
            equity_curve.push(EquityPoint {
                timestamp: ts,
                equity,
            });

            if (step + 1) % log_interval == 0 {
                info!(
                    "  Progress: {:.0}% | {} | Equity: ${:.2} | Trades: {} | Signals: {}",
                    (step + 1) as f64 / total_steps as f64 * 100.0,
                    ts.format("%Y-%m-%d %H:%M"),
                    equity,
                    self.trades.len(),
                    self.signals_generated,
                );
            }
        }

        let open_positions = self
            .broker
            .get_account()
            .await
            .map_err(broker_error)?
            .positions;
        let metrics = Metrics::compute(initial_capital, &equity_curve, &self.trades);

        info!("=== BACKTEST COMPLETE ===");
        info!(
            "Trades: {} | Return: {:+.2}% | Open positions: {}",
            metrics.total_trades,
            metrics.total_return * 100.0,
            open_positions.len()
        );

        Ok(BacktestResult {
            strategy: self.strategy.name().to_string(),
            start: range.start,
            end: range.end,
            initial_capital,
            orders: self.orders,
            equity_curve,
            trades: self.trades,
            metrics,
            open_positions,
            bars_processed,
            signals_generated: self.signals_generated,
            clamped_orders: self.clamped_orders,
        })
    }

    /// Sell `held × fraction`, or exactly `held` for a full exit.
    async fn exit(&mut self, signal: &Signal, ts: DateTime<Utc>) -> Result<(), ExecutionError> {
        let held = match self.broker.get_position(&signal.symbol).await.map_err(broker_error)? {
            Some(p) if p.quantity > QTY_EPSILON => p.quantity,
            _ => return Ok(()),
        };
        let qty = match signal.fractional_exit {
            Some(f) if f < 1.0 => held * f,
            _ => held,
        };
        debug!(
            "[BT {}] exit {} via {} ({:.8} of {:.8})",
            ts.format("%m-%d %H:%M"),
            signal.symbol,
            signal.rule,
            qty,
            held
        );
        self.submit(&signal.symbol, Side::Sell, qty, ts).await
    }

    async fn enter(&mut self, signal: &Signal, snapshot: &MarketSnapshot) -> Result<(), ExecutionError> {
        let holding = self
            .broker
            .get_position(&signal.symbol)
            .await
            .map_err(broker_error)?
            .is_some_and(|p| p.quantity > QTY_EPSILON);
        if holding {
            return Ok(());
        }
        let qty = self.strategy.position_size(&signal.symbol, snapshot);
        if !(qty.is_finite() && qty > QTY_EPSILON) {
            debug!("Skipping {} entry: size {}", signal.symbol, qty);
            return Ok(());
        }
        self.submit(&signal.symbol, Side::Buy, qty, snapshot.timestamp).await
    }

    /// Move holdings toward target weights of current equity.
    async fn rebalance_to(&mut self, targets: &[Signal], snapshot: &MarketSnapshot) -> Result<(), ExecutionError> {
        let equity = snapshot.account.equity;
        let mut sells = Vec::new();
        let mut buys = Vec::new();
        for signal in targets {
            let (Some(weight), Some(price)) = (signal.target_weight, snapshot.price(&signal.symbol)) else {
                continue;
            };
            if price <= 0.0 {
                continue;
            }
            let held = snapshot.position(&signal.symbol).map(|p| p.quantity).unwrap_or(0.0);
            if weight <= 0.0 {
                if held > QTY_EPSILON {
                    sells.push((signal.symbol.clone(), held));
                }
                continue;
            }
            let delta = equity * weight / price - held;
            if delta < -QTY_EPSILON {
                sells.push((signal.symbol.clone(), -delta));
            } else if delta > QTY_EPSILON {
                buys.push((signal.symbol.clone(), delta));
            }
        }

        for (symbol, qty) in sells {
            self.submit(&symbol, Side::Sell, qty, snapshot.timestamp).await?;
        }
        for (symbol, qty) in buys {
            self.submit(&symbol, Side::Buy, qty, snapshot.timestamp).await?;
        }
        Ok(())
    }

    async fn submit(
        &mut self,
        symbol: &str,
        side: Side,
        qty: f64,
        ts: DateTime<Utc>,
    ) -> Result<(), ExecutionError> {
        let avg_before = match side {
            Side::Sell => self
                .broker
                .get_position(symbol)
                .await
                .map_err(broker_error)?
                .map(|p| p.avg_entry_price),
            Side::Buy => None,
        };

        let order = self
            .broker
            .submit_order(symbol, side, qty, OrderType::Market)
            .await
            .map_err(broker_error)?;
        if order.clamped_from().is_some() {
            self.clamped_orders += 1;
        }
        let (Some(price), true) = (order.fill_price(), order.status().is_filled()) else {
            return Ok(());
        };
        let filled = order.quantity();

        match side {
            Side::Buy => {
                let trip = self
                    .open
                    .entry(symbol.to_string())
                    .or_insert_with(|| OpenTrip::new(ts));
                trip.bought += filled;
                trip.cost += filled * price;
            }
            Side::Sell => {
                if let Some(trip) = self.open.get_mut(symbol) {
                    trip.sold += filled;
                    trip.proceeds += filled * price;
                    trip.pnl += (price - avg_before.unwrap_or(price)) * filled;
                    trip.exits += 1;
                }
                let flat = self
                    .broker
                    .get_position(symbol)
                    .await
                    .map_err(broker_error)?
                    .map_or(true, |p| p.quantity <= QTY_EPSILON);
                if flat {
                    if let Some(trip) = self.open.remove(symbol) {
                        let rt = trip.close(symbol, ts);
                        debug!(
                            "[BT {}] {} round trip {} PnL ${:+.2}",
                            ts.format("%m-%d %H:%M"),
                            symbol,
                            if rt.is_win() { "WIN" } else { "LOSS" },
                            rt.pnl
                        );
                        self.trades.push(rt);
                    }
                }
            }
        }

        self.orders.push(order);
        Ok(())
    }
}
