use std::collections::BTreeMap;
use tracing::warn;

use crate::models::{DateRange, Parameter, StrategyConfig};
use crate::refinement::analysis::Suggestion;

/// Suggestions that may go to the generator, plus what had to change instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Screened {
    pub suggestions: Vec<Suggestion>,
    pub range: DateRange,
    pub notes: Vec<String>,
}

/// Parameters the user stated explicitly. Their values survive every
/// iteration no matter what the analysis wants or the generator returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtectedSet {
    values: BTreeMap<String, f64>,
}

impl ProtectedSet {
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Take on parameters a config flags as protected that we don't know yet.
    pub fn adopt(&mut self, config: &StrategyConfig) {
        for (name, value) in config.protected_parameters() {
            self.values.entry(name).or_insert(value);
        }
    }

    /// Drop suggestions against protected parameters. When any were dropped
    /// (or the analysis asked for it) the backtest range grows instead, up to
    /// `max_days`.
    pub fn screen(
        &self,
        suggestions: &[Suggestion],
        range: DateRange,
        widen_factor: f64,
        max_days: i64,
    ) -> Screened {
        let mut kept = Vec::new();
        let mut notes = Vec::new();
        let mut widen = false;

        for suggestion in suggestions {
            match suggestion {
                Suggestion::AdjustParameter { name, from, to, reason } if self.contains(name) => {
                    notes.push(format!(
                        "could not comply: {} is protected at {} ({} wanted {})",
                        name, from, reason, to
                    ));
                    widen = true;
                }
                Suggestion::WidenRange { .. } => widen = true,
                other => kept.push(other.clone()),
            }
        }

        let range = match (widen, range.widened(widen_factor, max_days)) {
            (false, _) => range,
            (true, Some(widened)) => {
                notes.push(format!(
                    "widened backtest range from {} to {} days",
                    range.days(),
                    widened.days()
                ));
                widened
            }
            (true, None) => {
                warn!("Backtest range of {} days cannot grow further", range.days());
                notes.push(format!(
                    "could not widen backtest range beyond {} days",
                    range.days()
                ));
                range
            }
        };

        Screened {
            suggestions: kept,
            range,
            notes,
        }
    }

    /// Put back any protected value the config altered or dropped.
    pub fn enforce(&self, config: &mut StrategyConfig) -> Vec<String> {
        let mut notes = Vec::new();
        for (name, &value) in &self.values {
            match config.parameters.get_mut(name) {
                Some(p) if p.value == value => p.protected = true,
                Some(p) => {
                    warn!("Generated config changed protected {} to {}; restoring {}", name, p.value, value);
                    notes.push(format!(
                        "restored protected {} to {} (generator returned {})",
                        name, value, p.value
                    ));
                    *p = Parameter::protected(value);
                }
                None => {
                    warn!("Generated config dropped protected {}; restoring {}", name, value);
                    notes.push(format!("restored dropped protected {} = {}", name, value));
                    config.parameters.insert(name.clone(), Parameter::protected(value));
                }
            }
        }
        notes
    }
}
