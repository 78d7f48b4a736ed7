use serde::{Deserialize, Serialize};

use crate::backtesting::BacktestResult;
use crate::error::ExecutionError;
use crate::models::{ConditionRule, StrategyConfig, Threshold};

/// Share of a parameter's magnitude moved per suggestion.
const PARAM_STEP: f64 = 0.10;

/// Quality bar a backtest has to clear before refinement stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPolicy {
    pub min_trades: usize,
    pub min_win_rate: f64,
    pub min_sharpe: f64,
    pub min_total_return: f64,
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self {
            min_trades: 3,
            min_win_rate: 0.40,
            min_sharpe: 0.0,
            min_total_return: 0.0,
        }
    }
}

/// A concrete change the next generation round is asked to make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Suggestion {
    AdjustParameter {
        name: String,
        from: f64,
        to: f64,
        reason: String,
    },
    WidenRange {
        reason: String,
    },
    FixCode {
        reason: String,
    },
}

impl Suggestion {
    /// Parameter this suggestion would change, if any.
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Suggestion::AdjustParameter { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub needs_refinement: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<Suggestion>,
    pub notes: Vec<String>,
}

fn step(value: f64) -> f64 {
    (value.abs() * PARAM_STEP).max(1.0)
}

/// Parameter thresholds of the given rules, with whether the rule fires
/// below its threshold.
fn param_thresholds<'a>(rules: impl Iterator<Item = &'a ConditionRule>) -> Vec<(&'a str, bool)> {
    rules
        .filter_map(|rule| match rule {
            ConditionRule::Indicator {
                operator,
                threshold: Threshold::Param { param },
                ..
            } => Some((param.as_str(), operator.is_below())),
            _ => None,
        })
        .collect()
}

impl AnalysisPolicy {
    pub fn analyze(
        &self,
        config: &StrategyConfig,
        outcome: &Result<BacktestResult, ExecutionError>,
    ) -> Analysis {
        match outcome {
            Ok(result) => self.analyze_result(config, result),
            Err(e) => Analysis {
                needs_refinement: true,
                issues: vec![format!("execution failed ({}): {}", e.kind(), e)],
                suggestions: vec![Suggestion::FixCode {
                    reason: e.to_string(),
                }],
                notes: Vec::new(),
            },
        }
    }

    fn analyze_result(&self, config: &StrategyConfig, result: &BacktestResult) -> Analysis {
        let m = &result.metrics;
        let mut analysis = Analysis::default();

        if m.total_trades < self.min_trades {
            analysis.issues.push(format!(
                "only {} trades, need at least {}",
                m.total_trades, self.min_trades
            ));
            self.loosen_entries(config, &mut analysis);
        }
        // a win rate over no trades says nothing
        if m.total_trades > 0 && m.win_rate < self.min_win_rate {
            analysis.issues.push(format!(
                "win rate {:.1}% below {:.1}%",
                m.win_rate * 100.0,
                self.min_win_rate * 100.0
            ));
            self.tighten_exits(config, &mut analysis);
        }
        if m.sharpe_ratio < self.min_sharpe {
            analysis.issues.push(format!(
                "Sharpe {:.2} below {:.2}",
                m.sharpe_ratio, self.min_sharpe
            ));
        }
        if m.total_return < self.min_total_return {
            analysis.issues.push(format!(
                "total return {:.2}% below {:.2}%",
                m.total_return * 100.0,
                self.min_total_return * 100.0
            ));
        }

        if !result.has_trades() {
            analysis.notes.push("no trades triggered over the range".to_string());
        }
        if result.clamped_orders > 0 {
            analysis.notes.push(format!(
                "{} order(s) clamped to available cash",
                result.clamped_orders
            ));
        }
        if !result.open_positions.is_empty() {
            analysis.notes.push(format!(
                "{} position(s) still open at the end",
                result.open_positions.len()
            ));
        }

        analysis.needs_refinement = !analysis.issues.is_empty();
        analysis
    }

    /// Make entries fire more often.
    fn loosen_entries(&self, config: &StrategyConfig, analysis: &mut Analysis) {
        let thresholds = param_thresholds(config.entry_conditions.iter().map(|c| &c.rule));
        for (name, below) in &thresholds {
            if let Some(from) = config.param(name) {
                let to = if *below { from + step(from) } else { from - step(from) };
                analysis.suggestions.push(Suggestion::AdjustParameter {
                    name: name.to_string(),
                    from,
                    to,
                    reason: "too few trades".to_string(),
                });
            }
        }
        if thresholds.is_empty() {
            analysis.suggestions.push(Suggestion::WidenRange {
                reason: "too few trades and no tunable entry threshold".to_string(),
            });
        }
    }

    /// Take profits earlier.
    fn tighten_exits(&self, config: &StrategyConfig, analysis: &mut Analysis) {
        let exits = config.exit_conditions.iter().map(|e| &e.condition.rule);
        for (name, below) in param_thresholds(exits) {
            if let Some(from) = config.param(name) {
                let to = if below { from + step(from) } else { from - step(from) };
                analysis.suggestions.push(Suggestion::AdjustParameter {
                    name: name.to_string(),
                    from,
                    to,
                    reason: "low win rate".to_string(),
                });
            }
        }
    }
}
