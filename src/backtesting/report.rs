use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Order, Position};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

/// One open→flat cycle on a symbol. Partial exits add to the same trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTrip {
    pub symbol: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub avg_exit_price: f64,
    pub pnl: f64,
    /// Number of sell fills that closed this trip.
    pub exits: usize,
}

impl RoundTrip {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn return_pct(&self) -> f64 {
        if self.avg_entry_price > 0.0 {
            (self.avg_exit_price / self.avg_entry_price - 1.0) * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// `final / initial - 1`
    pub total_return: f64,
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline as a fraction of the peak.
    pub max_drawdown: f64,
    /// `wins / trades`; 0 with no trades.
    pub win_rate: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub final_equity: f64,
}

impl Metrics {
    pub fn compute(initial_capital: f64, equity_curve: &[EquityPoint], trades: &[RoundTrip]) -> Self {
        let final_equity = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);
        let total_return = if initial_capital > 0.0 {
            final_equity / initial_capital - 1.0
        } else {
            0.0
        };

        let total_trades = trades.len();
        let winning_trades = trades.iter().filter(|t| t.is_win()).count();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        Self {
            total_return,
            sharpe_ratio: compute_sharpe(equity_curve),
            max_drawdown: compute_max_drawdown(equity_curve),
            win_rate,
            total_trades,
            winning_trades,
            losing_trades: total_trades - winning_trades,
            final_equity,
        }
    }
}

/// Everything one backtest run produced. `metrics.total_trades == 0` is a
/// legitimate outcome, distinct from a run that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: f64,
    pub orders: Vec<Order>,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<RoundTrip>,
    pub metrics: Metrics,
    /// Positions still held when the data ran out; never force-closed.
    pub open_positions: Vec<Position>,
    pub bars_processed: usize,
    pub signals_generated: usize,
    pub clamped_orders: usize,
}

impl BacktestResult {
    pub fn has_trades(&self) -> bool {
        self.metrics.total_trades > 0
    }

    pub fn print_summary(&self) {
        let m = &self.metrics;
        let pnl = m.final_equity - self.initial_capital;
        let days = (self.end - self.start).num_hours() as f64 / 24.0;

        println!("\n{}", "=".repeat(70));
        println!("  BACKTEST REPORT: {}", self.strategy);
        println!("{}", "=".repeat(70));
        println!(
            "  Period:      {} to {} ({:.0} days)",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d"),
            days
        );
        println!();
        println!("  PERFORMANCE");
        println!("  ───────────────────────────────────");
        println!("  Initial:     ${:.2}", self.initial_capital);
        println!("  Final:       ${:.2}", m.final_equity);
        println!("  PnL:         ${:+.2}", pnl);
        println!("  Return:      {:+.2}%", m.total_return * 100.0);
        println!();
        println!("  TRADES");
        println!("  ───────────────────────────────────");
        println!("  Total:       {}", m.total_trades);
        println!("  Win/Loss:    {} / {}", m.winning_trades, m.losing_trades);
        println!("  Win Rate:    {:.1}%", m.win_rate * 100.0);
        if let Some(best) = self.trades.iter().map(|t| t.pnl).reduce(f64::max) {
            println!("  Best:        ${:+.2}", best);
        }
        if let Some(worst) = self.trades.iter().map(|t| t.pnl).reduce(f64::min) {
            println!("  Worst:       ${:+.2}", worst);
        }
        println!("  Orders:      {} ({} clamped)", self.orders.len(), self.clamped_orders);
        println!("  Signals:     {}", self.signals_generated);
        if !self.open_positions.is_empty() {
            println!("  Still open:  {}", self.open_positions.len());
        }
        println!();
        println!("  RISK");
        println!("  ───────────────────────────────────");
        println!("  Max DD:      {:.2}%", m.max_drawdown * 100.0);
        println!("  Sharpe:      {:.2}", m.sharpe_ratio);
        println!("  Bars:        {}", self.bars_processed);

        if m.total_trades == 0 {
            println!();
            println!("  No round trips completed in this period.");
        }
        println!("{}", "=".repeat(70));
    }
}

/// Annualized (252 periods) Sharpe over consecutive equity returns.
/// Zero when there are fewer than two returns or no variance.
pub fn compute_sharpe(equity_curve: &[EquityPoint]) -> f64 {
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| w[1].equity / w[0].equity - 1.0)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    if std_dev < 1e-12 {
        return 0.0;
    }
    mean / std_dev * 252.0_f64.sqrt()
}

pub fn compute_max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for p in equity_curve {
        if p.equity > peak {
            peak = p.equity;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - p.equity) / peak);
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::day;

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquityPoint {
                timestamp: day(i as i64),
                equity,
            })
            .collect()
    }

    fn trip(pnl: f64) -> RoundTrip {
        RoundTrip {
            symbol: "AAPL".into(),
            opened_at: day(0),
            closed_at: day(1),
            quantity: 1.0,
            avg_entry_price: 100.0,
            avg_exit_price: 100.0 + pnl,
            pnl,
            exits: 1,
        }
    }

    #[test]
    fn flat_curve_has_zero_sharpe_and_drawdown() {
        let c = curve(&[100.0, 100.0, 100.0, 100.0]);
        assert_eq!(compute_sharpe(&c), 0.0);
        assert_eq!(compute_max_drawdown(&c), 0.0);
    }

    #[test]
    fn sharpe_needs_two_returns() {
        assert_eq!(compute_sharpe(&curve(&[100.0, 110.0])), 0.0);
        assert_eq!(compute_sharpe(&[]), 0.0);
    }

    #[test]
    fn sharpe_sign_follows_mean_return() {
        assert!(compute_sharpe(&curve(&[100.0, 101.0, 103.0, 104.0])) > 0.0);
        assert!(compute_sharpe(&curve(&[100.0, 99.0, 97.0, 96.0])) < 0.0);
    }

    #[test]
    fn drawdown_is_largest_peak_to_trough_fraction() {
        let c = curve(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((compute_max_drawdown(&c) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn metrics_with_no_trades() {
        let m = Metrics::compute(10_000.0, &curve(&[10_000.0, 10_000.0]), &[]);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.final_equity, 10_000.0);
    }

    #[test]
    fn metrics_count_wins_and_losses() {
        let m = Metrics::compute(
            1_000.0,
            &curve(&[1_000.0, 1_100.0]),
            &[trip(10.0), trip(-5.0), trip(3.0), trip(0.0)],
        );
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 2);
        assert!((m.win_rate - 0.5).abs() < 1e-12);
        assert!((m.total_return - 0.1).abs() < 1e-12);
    }
}
