//! Deterministic source rendering for a `StrategyConfig`.

use std::fmt::Write;

use crate::models::{ConditionRule, StrategyConfig, Threshold};

fn strategy_name(config: &StrategyConfig) -> String {
    let mut out = String::new();
    for part in config
        .name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty())
    {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    match out.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => out,
        Some(_) => format!("S{}", out),
        None => "Generated".to_string(),
    }
}

fn render_rule(rule: &ConditionRule) -> String {
    match rule {
        ConditionRule::Indicator {
            indicator,
            operator,
            threshold,
        } => {
            let rhs = match threshold {
                Threshold::Value(v) => format!("{}", v),
                Threshold::Param { param } => format!("${}", param),
            };
            format!("{} {} {}", indicator, operator.symbol(), rhs)
        }
        ConditionRule::StopLoss { pct } => format!("pnl_pct <= -{}", pct),
        ConditionRule::TakeProfit { pct } => format!("pnl_pct >= {}", pct),
    }
}

/// Source text whose rules mirror the config's conditions, in order.
pub fn render(config: &StrategyConfig) -> String {
    let mut src = String::from("use data;\nuse math;\n\n");
    let _ = writeln!(src, "strategy {} {{", strategy_name(config));
    for cond in &config.entry_conditions {
        let _ = writeln!(src, "    entry {}: {};", cond.name, render_rule(&cond.rule));
    }
    for exit in &config.exit_conditions {
        let _ = writeln!(
            src,
            "    exit {}: {};",
            exit.condition.name,
            render_rule(&exit.condition.rule)
        );
    }
    if config.symbols.len() > 1 {
        if let Some(n) = config.rebalance_every {
            let _ = writeln!(src, "    rebalance every {};", n);
        }
    }
    src.push_str("}\n");
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::script::compile;
    use crate::test_helpers::rsi_config;

    #[test]
    fn renders_rsi_strategy() {
        let src = render(&rsi_config());
        assert!(src.contains("entry oversold: rsi < $rsi_threshold;"));
        assert!(src.contains("exit overbought: rsi > $rsi_exit;"));
        assert!(src.contains("exit stop: pnl_pct <= -1;"));
        compile(&src, &rsi_config()).unwrap();
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(render(&rsi_config()), render(&rsi_config()));
    }

    #[test]
    fn names_are_sanitized() {
        let mut cfg = rsi_config();
        cfg.name = "rsi mean-reversion v2".into();
        assert!(render(&cfg).contains("strategy RsiMeanReversionV2 {"));
        cfg.name = "42".into();
        assert!(render(&cfg).contains("strategy S42 {"));
        cfg.name = String::new();
        assert!(render(&cfg).contains("strategy Generated {"));
    }

    #[test]
    fn portfolio_cadence_is_rendered() {
        let mut cfg = rsi_config();
        cfg.symbols = vec!["AAPL".into(), "MSFT".into()];
        cfg.rebalance_every = Some(20);
        let src = render(&cfg);
        assert!(src.contains("rebalance every 20;"));
        assert_eq!(compile(&src, &cfg).unwrap().rebalance_every, Some(20));
    }
}
