//! Conversion of results into plain JSON before they cross the process
//! boundary. Non-finite numbers are refused (serde_json would quietly turn
//! them into `null`) and floats are rounded to a fixed number of decimals.

use serde::Serialize;
use serde_json::{Number, Value};

use crate::backtesting::BacktestResult;
use crate::error::ExecutionError;

pub const DECIMALS: i32 = 8;

pub fn round_float(x: f64) -> f64 {
    let scale = 10f64.powi(DECIMALS);
    let rounded = (x * scale).round() / scale;
    if rounded.is_finite() {
        rounded
    } else {
        x
    }
}

/// Path of the first non-finite float in `result`, if any.
pub fn first_non_finite(result: &BacktestResult) -> Option<String> {
    let m = &result.metrics;
    let scalars = [
        ("initial_capital", result.initial_capital),
        ("metrics.total_return", m.total_return),
        ("metrics.sharpe_ratio", m.sharpe_ratio),
        ("metrics.max_drawdown", m.max_drawdown),
        ("metrics.win_rate", m.win_rate),
        ("metrics.final_equity", m.final_equity),
    ];
    if let Some((path, _)) = scalars.iter().find(|(_, v)| !v.is_finite()) {
        return Some(path.to_string());
    }
    if let Some(i) = result.equity_curve.iter().position(|p| !p.equity.is_finite()) {
        return Some(format!("equity_curve[{}]", i));
    }
    for (i, t) in result.trades.iter().enumerate() {
        if ![t.quantity, t.avg_entry_price, t.avg_exit_price, t.pnl]
            .iter()
            .all(|v| v.is_finite())
        {
            return Some(format!("trades[{}]", i));
        }
    }
    for (i, o) in result.orders.iter().enumerate() {
        let mut values = o.fill_price().into_iter().chain([o.quantity(), o.requested_quantity()]);
        if !values.all(f64::is_finite) {
            return Some(format!("orders[{}]", i));
        }
    }
    for (i, p) in result.open_positions.iter().enumerate() {
        if ![p.quantity, p.avg_entry_price, p.market_price, p.realized_pnl]
            .iter()
            .all(|v| v.is_finite())
        {
            return Some(format!("open_positions[{}]", i));
        }
    }
    None
}

/// Round every float inside `value` in place.
pub fn round_floats(value: &mut Value) {
    match value {
        Value::Number(n) if n.is_f64() => {
            if let Some(rounded) = n.as_f64().map(round_float).and_then(Number::from_f64) {
                *n = rounded;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(round_floats),
        Value::Object(map) => map.values_mut().for_each(round_floats),
        _ => {}
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ExecutionError> {
    serde_json::to_value(value).map_err(|e| ExecutionError::Internal {
        reason: format!("result is not serializable: {}", e),
    })
}

/// The JSON form of `result` that the worker sends back.
pub fn result_to_json(result: &BacktestResult) -> Result<Value, ExecutionError> {
    if let Some(path) = first_non_finite(result) {
        return Err(ExecutionError::Internal {
            reason: format!("non-finite number at {}", path),
        });
    }
    let mut value = to_value(result)?;
    round_floats(&mut value);
    Ok(value)
}

pub fn result_from_json(value: Value) -> Result<BacktestResult, ExecutionError> {
    serde_json::from_value(value).map_err(|e| ExecutionError::Internal {
        reason: format!("malformed result from worker: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtesting::{EquityPoint, Metrics};
    use crate::test_helpers::day;
    use serde_json::json;

    fn result(equity: &[f64]) -> BacktestResult {
        let curve: Vec<EquityPoint> = equity
            .iter()
            .enumerate()
            .map(|(i, &e)| EquityPoint {
                timestamp: day(i as i64),
                equity: e,
            })
            .collect();
        BacktestResult {
            strategy: "S".into(),
            start: day(0),
            end: day(equity.len() as i64),
            initial_capital: 100.0,
            orders: Vec::new(),
            metrics: Metrics::compute(100.0, &curve, &[]),
            equity_curve: curve,
            trades: Vec::new(),
            open_positions: Vec::new(),
            bars_processed: equity.len(),
            signals_generated: 0,
            clamped_orders: 0,
        }
    }

    #[test]
    fn floats_are_rounded_recursively() {
        let mut v = json!({"a": 0.123456789123, "b": [1.000000004, 2], "c": {"d": -3.3333333333}});
        round_floats(&mut v);
        assert_eq!(v, json!({"a": 0.12345679, "b": [1.0, 2], "c": {"d": -3.33333333}}));
    }

    #[test]
    fn non_finite_values_are_refused() {
        let mut r = result(&[100.0, 101.0]);
        r.equity_curve[1].equity = f64::INFINITY;
        let err = result_to_json(&r).unwrap_err();
        assert!(err.to_string().contains("equity_curve[1]"));
    }

    #[test]
    fn clean_result_survives_the_trip() {
        let r = result(&[100.0, 101.5, 99.25]);
        let back = result_from_json(result_to_json(&r).unwrap()).unwrap();
        assert_eq!(back.equity_curve, r.equity_curve);
        assert_eq!(back.metrics.total_trades, 0);
    }
}
