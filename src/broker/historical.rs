use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::broker::MarketData;
use crate::error::BrokerError;
use crate::models::{Bar, BarSeries, Interval};

/// A `MarketData` implementation that replays pre-loaded bars.
/// A cursor (`now`) controls which bar is "current" for price lookups.
#[derive(Debug, Clone, Default)]
pub struct HistoricalData {
    series: BTreeMap<String, BarSeries>,
    interval: Interval,
    now: Option<DateTime<Utc>>,
}

impl HistoricalData {
    pub fn new(interval: Interval) -> Self {
        Self {
            series: BTreeMap::new(),
            interval,
            now: None,
        }
    }

    /// Load bars for one symbol (any order; stored ascending).
    pub fn load(&mut self, symbol: &str, bars: Vec<Bar>) {
        self.series.insert(symbol.to_string(), BarSeries::new(bars));
    }

    pub fn from_map(interval: Interval, bars: BTreeMap<String, Vec<Bar>>) -> Self {
        let mut data = Self::new(interval);
        for (symbol, b) in bars {
            data.load(&symbol, b);
        }
        data
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }

    pub fn series(&self, symbol: &str) -> Option<&BarSeries> {
        self.series.get(symbol)
    }

    pub fn total_bars(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Advance the simulation clock.
    pub fn set_time(&mut self, t: DateTime<Utc>) {
        self.now = Some(t);
    }

    pub fn earliest_time(&self) -> Option<DateTime<Utc>> {
        self.series
            .values()
            .filter_map(|s| s.first().map(|b| b.timestamp))
            .min()
    }

    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.series
            .values()
            .filter_map(|s| s.last().map(|b| b.timestamp))
            .max()
    }
}

#[async_trait]
impl MarketData for HistoricalData {
    async fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<BarSeries, BrokerError> {
        if interval != self.interval {
            debug!(
                "Requested {} bars for {} but store holds {}",
                interval, symbol, self.interval
            );
        }
        Ok(self
            .series
            .get(symbol)
            .map(|s| s.range(start, end))
            .unwrap_or_default())
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let series = self.series.get(symbol).ok_or_else(|| BrokerError::NoPrice {
            symbol: symbol.to_string(),
        })?;
        let bar = match self.now {
            Some(t) => series.at_or_before(t),
            None => series.last(),
        };
        bar.map(|b| b.close).ok_or_else(|| BrokerError::NoPrice {
            symbol: symbol.to_string(),
        })
    }
}
