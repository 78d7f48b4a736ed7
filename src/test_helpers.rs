use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;

use crate::models::{
    Bar, BarSeries, Comparison, Condition, ConditionRule, ExitCondition, IndicatorKind,
    IndicatorSpec, Parameter, StrategyConfig, Threshold,
};

/// Midnight UTC, `n` days after 2024-01-01.
pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
}

/// One daily bar per close, starting at `day(0)`. Open is the previous close.
pub fn make_daily_bars(closes: &[f64]) -> BarSeries {
    let bars = closes
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
        .collect();
    BarSeries::new(bars)
}

/// Classic RSI mean reversion on AAPL: buy under a protected 30, sell over
/// 70 or on a 1% stop.
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

/// Gently oscillating closes that never push a 14-period RSI below 30.
pub fn calm_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 100.0 + if i % 2 == 0 { 0.5 } else { -0.5 })
        .collect()
}
