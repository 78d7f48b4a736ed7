#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use strategy_forge::broker::{HistoricalData, MarketData};
use strategy_forge::models::{
    Bar, Comparison, Condition, ConditionRule, ExitCondition, IndicatorKind, IndicatorSpec,
    Interval, Parameter, StrategyConfig, Threshold,
};

/// Midnight UTC, `n` days after 2024-01-01.
pub fn day(n: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::days(n)
}

/// One daily bar per close starting at `day(0)`; open is the previous close.
pub fn daily_bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Bar {
                timestamp: day(i as i64),
                open,
                high: open.max(close) * 1.01,
                low: open.min(close) * 0.99,
                close,
                volume: 1_000.0,
            }
        })
        .collect()
}

/// Alternates a dollar around 100, so RSI sits at 50 forever.
pub fn calm_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| if i % 2 == 0 { 100.5 } else { 99.5 })
        .collect()
}

/// Sawtooth: three down days, two up days, repeating.
pub fn choppy_closes(n: usize) -> Vec<f64> {
    let mut price = 100.0;
    (0..n)
        .map(|i| {
            price += if i % 5 < 3 { -1.5 } else { 2.0 };
            price
        })
        .collect()
}

/// Twenty days down two dollars a day, twenty days up, repeating.
pub fn wave_closes(n: usize) -> Vec<f64> {
    let mut price = 100.0;
    (0..n)
        .map(|i| {
            price += if (i / 20) % 2 == 0 { -2.0 } else { 2.0 };
            price
        })
        .collect()
}

pub fn market(symbol: &str, closes: &[f64]) -> Arc<dyn MarketData> {
    let mut data = HistoricalData::new(Interval::D1);
    data.load(symbol, daily_bars(closes));
    Arc::new(data)
}

/// RSI(14) < 30 entry on AAPL (protected), full exit above 70 or at -1%.
pub fn rsi_config() -> StrategyConfig {
    let mut parameters = BTreeMap::new();
    parameters.insert("rsi_threshold".to_string(), Parameter::protected(30.0));
    parameters.insert("rsi_exit".to_string(), Parameter::new(70.0));

    StrategyConfig {
        name: "rsi reversion".into(),
        symbols: vec!["AAPL".into()],
        indicators: vec![IndicatorSpec {
            name: "rsi".into(),
            kind: IndicatorKind::Rsi,
            period: 14,
        }],
        entry_conditions: vec![Condition {
            name: "oversold".into(),
            rule: ConditionRule::Indicator {
                indicator: "rsi".into(),
                operator: Comparison::Below,
                threshold: Threshold::Param {
                    param: "rsi_threshold".into(),
                },
            },
        }],
        exit_conditions: vec![
            ExitCondition {
                condition: Condition {
                    name: "overbought".into(),
                    rule: ConditionRule::Indicator {
                        indicator: "rsi".into(),
                        operator: Comparison::Above,
                        threshold: Threshold::Param {
                            param: "rsi_exit".into(),
                        },
                    },
                },
                fractional_exit: None,
            },
            ExitCondition {
                condition: Condition {
                    name: "stop".into(),
                    rule: ConditionRule::StopLoss { pct: 1.0 },
                },
                fractional_exit: None,
            },
        ],
        parameters,
        rebalance_every: None,
    }
}

/// Config with no indicators, for scripts that only look at price.
pub fn price_config(symbol: &str) -> StrategyConfig {
    StrategyConfig {
        name: "price action".into(),
        symbols: vec![symbol.into()],
        indicators: Vec::new(),
        entry_conditions: Vec::new(),
        exit_conditions: Vec::new(),
        parameters: BTreeMap::new(),
        rebalance_every: None,
    }
}
