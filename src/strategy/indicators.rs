//! Streaming indicators, updated one bar at a time.
//!
//! Every indicator reports `None` until its warm-up is complete; callers treat
//! that as a missing value rather than zero.

use std::collections::{BTreeMap, VecDeque};

use crate::models::{Bar, IndicatorKind, IndicatorSpec};

#[derive(Debug, Clone)]
enum State {
    /// Wilder smoothing. Seeds with the simple mean of the first `period` changes.
    Rsi {
        prev_close: Option<f64>,
        changes: usize,
        sum_gain: f64,
        sum_loss: f64,
        avg_gain: f64,
        avg_loss: f64,
    },
    Sma {
        window: VecDeque<f64>,
        sum: f64,
    },
    /// Seeded with the SMA of the first `period` closes.
    Ema {
        seed: Vec<f64>,
        value: Option<f64>,
    },
    Roc {
        window: VecDeque<f64>,
    },
    /// Population standard deviation over the window.
    Stddev {
        window: VecDeque<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct RollingIndicator {
    spec: IndicatorSpec,
    state: State,
    current: Option<f64>,
    previous: Option<f64>,
}

impl RollingIndicator {
    pub fn new(spec: IndicatorSpec) -> Self {
        let state = match spec.kind {
            IndicatorKind::Rsi => State::Rsi {
                prev_close: None,
                changes: 0,
                sum_gain: 0.0,
                sum_loss: 0.0,
                avg_gain: 0.0,
                avg_loss: 0.0,
            },
            IndicatorKind::Sma => State::Sma {
                window: VecDeque::with_capacity(spec.period),
                sum: 0.0,
            },
            IndicatorKind::Ema => State::Ema {
                seed: Vec::with_capacity(spec.period),
                value: None,
            },
            IndicatorKind::Roc => State::Roc {
                window: VecDeque::with_capacity(spec.period + 1),
            },
            IndicatorKind::Stddev => State::Stddev {
                window: VecDeque::with_capacity(spec.period),
            },
        };
        Self {
            spec,
            state,
            current: None,
            previous: None,
        }
    }

    pub fn spec(&self) -> &IndicatorSpec {
        &self.spec
    }

    pub fn value(&self) -> Option<f64> {
        self.current
    }

    /// Value as of the bar before the latest one.
    pub fn prev(&self) -> Option<f64> {
        self.previous
    }

    pub fn update(&mut self, close: f64) {
        let period = self.spec.period.max(1);
        let next = match &mut self.state {
            State::Rsi {
                prev_close,
                changes,
                sum_gain,
                sum_loss,
                avg_gain,
                avg_loss,
            } => {
                let out = match *prev_close {
                    None => None,
                    Some(pc) => {
                        let change = close - pc;
                        let gain = change.max(0.0);
                        let loss = (-change).max(0.0);
                        *changes += 1;
                        if *changes < period {
                            *sum_gain += gain;
                            *sum_loss += loss;
                            None
                        } else {
                            if *changes == period {
                                *avg_gain = (*sum_gain + gain) / period as f64;
                                *avg_loss = (*sum_loss + loss) / period as f64;
                            } else {
                                let n = period as f64;
                                *avg_gain = (*avg_gain * (n - 1.0) + gain) / n;
                                *avg_loss = (*avg_loss * (n - 1.0) + loss) / n;
                            }
                            Some(rsi_from(*avg_gain, *avg_loss))
                        }
                    }
                };
                *prev_close = Some(close);
                out
            }
            State::Sma { window, sum } => {
                window.push_back(close);
                *sum += close;
                if window.len() > period {
                    if let Some(old) = window.pop_front() {
                        *sum -= old;
                    }
                }
                (window.len() == period).then(|| *sum / period as f64)
            }
            State::Ema { seed, value } => match *value {
                Some(v) => {
                    let k = 2.0 / (period as f64 + 1.0);
                    let next = close * k + v * (1.0 - k);
                    *value = Some(next);
                    Some(next)
                }
                None => {
                    seed.push(close);
                    if seed.len() == period {
                        let sma = seed.iter().sum::<f64>() / period as f64;
                        *value = Some(sma);
                        seed.clear();
                        Some(sma)
                    } else {
                        None
                    }
                }
            },
            State::Roc { window } => {
                window.push_back(close);
                if window.len() > period + 1 {
                    window.pop_front();
                }
                match window.front() {
                    Some(&base) if window.len() == period + 1 && base != 0.0 => {
                        Some((close - base) / base * 100.0)
                    }
                    _ => None,
                }
            }
            State::Stddev { window } => {
                window.push_back(close);
                if window.len() > period {
                    window.pop_front();
                }
                if window.len() == period {
                    let n = period as f64;
                    let mean = window.iter().sum::<f64>() / n;
                    let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                    Some(var.sqrt())
                } else {
                    None
                }
            }
        };
        self.previous = self.current;
        self.current = next;
    }
}

fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Indicators for every configured symbol, plus the last two bars seen per
/// symbol so `prev(close)` style lookups work without a separate history.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSet {
    specs: Vec<IndicatorSpec>,
    by_symbol: BTreeMap<String, BTreeMap<String, RollingIndicator>>,
    last_bar: BTreeMap<String, Bar>,
    prev_bar: BTreeMap<String, Bar>,
    bars_seen: BTreeMap<String, usize>,
}

impl IndicatorSet {
    pub fn new(specs: &[IndicatorSpec]) -> Self {
        Self {
            specs: specs.to_vec(),
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        self.by_symbol.clear();
        self.last_bar.clear();
        self.prev_bar.clear();
        self.bars_seen.clear();
    }

    pub fn update(&mut self, symbol: &str, bar: &Bar) {
        let specs = &self.specs;
        let indicators = self
            .by_symbol
            .entry(symbol.to_string())
            .or_insert_with(|| {
                specs
                    .iter()
                    .map(|s| (s.name.clone(), RollingIndicator::new(s.clone())))
                    .collect()
            });
        for ind in indicators.values_mut() {
            ind.update(bar.close);
        }
        if let Some(old) = self.last_bar.insert(symbol.to_string(), bar.clone()) {
            self.prev_bar.insert(symbol.to_string(), old);
        }
        *self.bars_seen.entry(symbol.to_string()).or_insert(0) += 1;
    }

    pub fn value(&self, symbol: &str, name: &str) -> Option<f64> {
        self.by_symbol.get(symbol)?.get(name)?.value()
    }

    pub fn prev(&self, symbol: &str, name: &str) -> Option<f64> {
        self.by_symbol.get(symbol)?.get(name)?.prev()
    }

    pub fn last_bar(&self, symbol: &str) -> Option<&Bar> {
        self.last_bar.get(symbol)
    }

    pub fn prev_bar(&self, symbol: &str) -> Option<&Bar> {
        self.prev_bar.get(symbol)
    }

    pub fn bars_seen(&self, symbol: &str) -> usize {
        self.bars_seen.get(symbol).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_daily_bars;

    fn run(kind: IndicatorKind, period: usize, closes: &[f64]) -> Vec<Option<f64>> {
        let mut ind = RollingIndicator::new(IndicatorSpec {
            name: "x".into(),
            kind,
            period,
        });
        closes
            .iter()
            .map(|&c| {
                ind.update(c);
                ind.value()
            })
            .collect()
    }

    #[test]
    fn sma_warms_up_then_rolls() {
        let out = run(IndicatorKind::Sma, 3, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out, vec![None, None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn ema_seeds_with_sma() {
        let out = run(IndicatorKind::Ema, 3, &[1.0, 2.0, 3.0, 6.0]);
        assert_eq!(out[2], Some(2.0));
        // k = 0.5
        assert!((out[3].unwrap() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn roc_is_percent_change_over_period() {
        let out = run(IndicatorKind::Roc, 2, &[100.0, 105.0, 110.0, 99.0]);
        assert_eq!(out[1], None);
        assert!((out[2].unwrap() - 10.0).abs() < 1e-12);
        assert!((out[3].unwrap() - (99.0 / 105.0 - 1.0) * 100.0).abs() < 1e-9);
    }

    #[test]
    fn stddev_of_constant_series_is_zero() {
        let out = run(IndicatorKind::Stddev, 3, &[5.0, 5.0, 5.0]);
        assert_eq!(out[2], Some(0.0));
        let out = run(IndicatorKind::Stddev, 2, &[1.0, 3.0]);
        assert_eq!(out[1], Some(1.0));
    }

    #[test]
    fn rsi_needs_period_changes() {
        let out = run(IndicatorKind::Rsi, 3, &[10.0, 11.0, 12.0, 13.0, 12.0]);
        assert_eq!(&out[..3], &[None, None, None]);
        assert_eq!(out[3], Some(100.0));
        // one loss of 1 smoothed in: gain 2/3, loss 1/3
        let rsi = out[4].unwrap();
        assert!((rsi - (100.0 - 100.0 / (1.0 + 2.0))).abs() < 1e-9);
    }

    #[test]
    fn rsi_falls_on_a_downtrend() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let out = run(IndicatorKind::Rsi, 14, &closes);
        assert_eq!(out[29], Some(0.0));
    }

    #[test]
    fn prev_tracks_last_value() {
        let mut ind = RollingIndicator::new(IndicatorSpec {
            name: "s".into(),
            kind: IndicatorKind::Sma,
            period: 1,
        });
        ind.update(3.0);
        ind.update(4.0);
        assert_eq!(ind.prev(), Some(3.0));
        assert_eq!(ind.value(), Some(4.0));
    }

    #[test]
    fn set_tracks_symbols_independently() {
        let spec = IndicatorSpec {
            name: "fast".into(),
            kind: IndicatorKind::Sma,
            period: 2,
        };
        let mut set = IndicatorSet::new(&[spec]);
        let a = make_daily_bars(&[1.0, 3.0]);
        let b = make_daily_bars(&[10.0]);
        set.update("A", &a[0]);
        set.update("B", &b[0]);
        set.update("A", &a[1]);
        assert_eq!(set.value("A", "fast"), Some(2.0));
        assert_eq!(set.value("B", "fast"), None);
        assert_eq!(set.prev_bar("A").map(|b| b.close), Some(1.0));
        assert_eq!(set.bars_seen("B"), 1);
        assert_eq!(set.value("A", "nope"), None);
    }
}
