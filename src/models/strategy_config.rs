use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Rsi,
    Sma,
    Ema,
    Roc,
    Stddev,
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndicatorKind::Rsi => "RSI",
            IndicatorKind::Sma => "SMA",
            IndicatorKind::Ema => "EMA",
            IndicatorKind::Roc => "ROC",
            IndicatorKind::Stddev => "STDDEV",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    pub kind: IndicatorKind,
    pub period: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Below,
    BelowOrEqual,
    Above,
    AboveOrEqual,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Below => "<",
            Comparison::BelowOrEqual => "<=",
            Comparison::Above => ">",
            Comparison::AboveOrEqual => ">=",
        }
    }

    pub fn is_below(&self) -> bool {
        matches!(self, Comparison::Below | Comparison::BelowOrEqual)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Value(f64),
    Param { param: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionRule {
    Indicator {
        indicator: String,
        operator: Comparison,
        threshold: Threshold,
    },
    /// Exit once the position is down `pct` percent from its average entry.
    StopLoss { pct: f64 },
    TakeProfit { pct: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    #[serde(flatten)]
    pub rule: ConditionRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCondition {
    #[serde(flatten)]
    pub condition: Condition,
    /// Share of the open position to liquidate, in (0, 1]. Full exit when absent.
    #[serde(default)]
    pub fractional_exit: Option<f64>,
}

impl ExitCondition {
    pub fn fraction(&self) -> f64 {
        self.fractional_exit.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub value: f64,
    /// Stated explicitly by the user; refinement must not change it.
    #[serde(default)]
    pub protected: bool,
}

impl Parameter {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            protected: false,
        }
    }

    pub fn protected(value: f64) -> Self {
        Self {
            value,
            protected: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub name: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub indicators: Vec<IndicatorSpec>,
    #[serde(default)]
    pub entry_conditions: Vec<Condition>,
    #[serde(default)]
    pub exit_conditions: Vec<ExitCondition>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Parameter>,
    /// Portfolio rebalance cadence in bars.
    #[serde(default)]
    pub rebalance_every: Option<usize>,
}

/// One entry of an iteration's config diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ConfigChange {
    Parameter {
        name: String,
        old: Option<f64>,
        new: Option<f64>,
    },
    Symbols {
        old: Vec<String>,
        new: Vec<String>,
    },
    Indicator {
        name: String,
        old: Option<String>,
        new: Option<String>,
    },
    Conditions {
        entry: usize,
        exit: usize,
    },
}

impl StrategyConfig {
    pub fn indicator(&self, name: &str) -> Option<&IndicatorSpec> {
        self.indicators.iter().find(|i| i.name == name)
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).map(|p| p.value)
    }

    pub fn protected_parameters(&self) -> BTreeMap<String, f64> {
        self.parameters
            .iter()
            .filter(|(_, p)| p.protected)
            .map(|(k, p)| (k.clone(), p.value))
            .collect()
    }

    /// Fraction to liquidate when the named exit fires (1.0 if undeclared).
    pub fn exit_fraction(&self, rule: &str) -> f64 {
        self.exit_conditions
            .iter()
            .find(|e| e.condition.name == rule)
            .map(|e| e.fraction())
            .unwrap_or(1.0)
    }

    pub fn is_portfolio(&self) -> bool {
        self.symbols.len() > 1 && self.rebalance_every.is_some()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| Err(ValidationError::Config { reason });

        if self.symbols.is_empty() {
            return invalid("at least one symbol is required".to_string());
        }
        let mut seen = BTreeSet::new();
        for s in &self.symbols {
            if s.trim().is_empty() {
                return invalid("symbol names must not be blank".to_string());
            }
            if !seen.insert(s) {
                return invalid(format!("symbol {} listed twice", s));
            }
        }

        let mut names = BTreeSet::new();
        for ind in &self.indicators {
            if ind.period == 0 {
                return invalid(format!("indicator {} has period 0", ind.name));
            }
            if !names.insert(ind.name.as_str()) {
                return invalid(format!("indicator {} declared twice", ind.name));
            }
        }

        for (name, p) in &self.parameters {
            if !p.value.is_finite() {
                return invalid(format!("parameter {} is not a finite number", name));
            }
        }

        let entries = self.entry_conditions.iter();
        let exits = self.exit_conditions.iter().map(|e| &e.condition);
        let mut rule_names = BTreeSet::new();
        for cond in entries.chain(exits) {
            if !is_identifier(&cond.name) {
                return invalid(format!("condition name {:?} is not an identifier", cond.name));
            }
            if !rule_names.insert(cond.name.as_str()) {
                return invalid(format!("condition {} declared twice", cond.name));
            }
            self.validate_condition(cond)?;
        }

        for exit in &self.exit_conditions {
            if let Some(f) = exit.fractional_exit {
                if !(f > 0.0 && f <= 1.0) {
                    return invalid(format!(
                        "fractional_exit {} on {} must be in (0, 1]",
                        f, exit.condition.name
                    ));
                }
            }
        }

        if let Some(0) = self.rebalance_every {
            return invalid("rebalance_every must be at least 1".to_string());
        }

        Ok(())
    }

    fn validate_condition(&self, cond: &Condition) -> Result<(), ValidationError> {
        match &cond.rule {
            ConditionRule::Indicator {
                indicator,
                threshold,
                ..
            } => {
                if self.indicator(indicator).is_none() {
                    return Err(ValidationError::Config {
                        reason: format!(
                            "condition {} references undeclared indicator {}",
                            cond.name, indicator
                        ),
                    });
                }
                if let Threshold::Param { param } = threshold {
                    if !self.parameters.contains_key(param) {
                        return Err(ValidationError::Config {
                            reason: format!(
                                "condition {} references undeclared parameter {}",
                                cond.name, param
                            ),
                        });
                    }
                }
                Ok(())
            }
            ConditionRule::StopLoss { pct } | ConditionRule::TakeProfit { pct } => {
                if *pct > 0.0 && pct.is_finite() {
                    Ok(())
                } else {
                    Err(ValidationError::Config {
                        reason: format!("condition {} needs a positive percentage", cond.name),
                    })
                }
            }
        }
    }

    /// Changes from `self` to `next`, parameters first (sorted by name).
    pub fn diff(&self, next: &StrategyConfig) -> Vec<ConfigChange> {
        let mut changes = Vec::new();

        let keys: BTreeSet<&String> = self
            .parameters
            .keys()
            .chain(next.parameters.keys())
            .collect();
        for key in keys {
            let old = self.param(key);
            let new = next.param(key);
            if old != new {
                changes.push(ConfigChange::Parameter {
                    name: key.clone(),
                    old,
                    new,
                });
            }
        }

        if self.symbols != next.symbols {
            changes.push(ConfigChange::Symbols {
                old: self.symbols.clone(),
                new: next.symbols.clone(),
            });
        }

        let describe = |i: &IndicatorSpec| format!("{}({})", i.kind, i.period);
        let ind_names: BTreeSet<&str> = self
            .indicators
            .iter()
            .chain(next.indicators.iter())
            .map(|i| i.name.as_str())
            .collect();
        for name in ind_names {
            let old = self.indicator(name).map(describe);
            let new = next.indicator(name).map(describe);
            if old != new {
                changes.push(ConfigChange::Indicator {
                    name: name.to_string(),
                    old,
                    new,
                });
            }
        }

        if self.entry_conditions != next.entry_conditions
            || self.exit_conditions != next.exit_conditions
        {
            changes.push(ConfigChange::Conditions {
                entry: next.entry_conditions.len(),
                exit: next.exit_conditions.len(),
            });
        }

        changes
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::rsi_config;

    #[test]
    fn rsi_config_is_valid() {
        rsi_config().validate().unwrap();
    }

    #[test]
    fn condition_must_reference_declared_indicator() {
        let mut cfg = rsi_config();
        cfg.indicators.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("undeclared indicator rsi"));
    }

    #[test]
    fn condition_names_must_be_unique_identifiers() {
        let mut cfg = rsi_config();
        cfg.exit_conditions[1].condition.name = "stop loss".into();
        assert!(cfg.validate().is_err());
        let mut cfg = rsi_config();
        cfg.exit_conditions[1].condition.name = "oversold".into();
        assert!(cfg.validate().unwrap_err().to_string().contains("declared twice"));
    }

    #[test]
    fn fractional_exit_defaults_to_full() {
        let cfg = rsi_config();
        assert!((cfg.exit_fraction("overbought") - 1.0).abs() < 1e-12);
        assert!((cfg.exit_fraction("no_such_rule") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fractional_exit_out_of_range_is_rejected() {
        let mut cfg = rsi_config();
        cfg.exit_conditions[0].fractional_exit = Some(1.5);
        assert!(cfg.validate().is_err());
        cfg.exit_conditions[0].fractional_exit = Some(0.0);
        assert!(cfg.validate().is_err());
        cfg.exit_conditions[0].fractional_exit = Some(0.25);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn protected_parameters_are_listed() {
        let cfg = rsi_config();
        let protected = cfg.protected_parameters();
        assert_eq!(protected.get("rsi_threshold"), Some(&30.0));
        assert!(!protected.contains_key("rsi_exit"));
    }

    #[test]
    fn diff_reports_parameter_changes() {
        let a = rsi_config();
        let mut b = a.clone();
        b.parameters.insert("rsi_exit".into(), Parameter::new(65.0));
        let diff = a.diff(&b);
        assert_eq!(
            diff,
            vec![ConfigChange::Parameter {
                name: "rsi_exit".into(),
                old: Some(70.0),
                new: Some(65.0),
            }]
        );
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn config_deserializes_from_collaborator_json() {
        let json = serde_json::json!({
            "name": "rsi",
            "symbols": ["AAPL"],
            "indicators": [{"name": "rsi", "kind": "rsi", "period": 14}],
            "entry_conditions": [
                {"name": "oversold", "type": "indicator", "indicator": "rsi",
                 "operator": "below", "threshold": {"param": "rsi_threshold"}}
            ],
            "exit_conditions": [
                {"name": "overbought", "type": "indicator", "indicator": "rsi",
                 "operator": "above", "threshold": 70.0, "fractional_exit": 0.5},
                {"name": "stop", "type": "stop_loss", "pct": 1.0}
            ],
            "parameters": {"rsi_threshold": {"value": 30.0, "protected": true}}
        });
        let cfg: StrategyConfig = serde_json::from_value(json).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.exit_fraction("overbought"), 0.5);
        assert_eq!(cfg.exit_fraction("stop"), 1.0);
        assert!(cfg.parameters["rsi_threshold"].protected);
    }
}
