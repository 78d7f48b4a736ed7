use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::broker::MarketData;
use crate::error::BrokerError;
use crate::models::{Bar, BarSeries, Interval};

/// Wraps any `MarketData` and keeps fetched ranges as JSON files so repeated
/// backtests of the same window never hit the network twice.
pub struct CachedMarketData<M> {
    inner: M,
    dir: PathBuf,
}

impl<M: MarketData> CachedMarketData<M> {
    pub fn new(inner: M, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn cache_path(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PathBuf {
        // Day granularity so reruns within the same day reuse the file
        self.dir.join(format!(
            "{}_{}_{}_to_{}.json",
            symbol,
            interval,
            start.format("%Y%m%d"),
            end.format("%Y%m%d")
        ))
    }

    fn store(&self, path: &Path, bars: &BarSeries) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string(bars.as_slice())?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Read a JSON array of bars.
pub fn load_bars_file(path: &Path) -> Result<Vec<Bar>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let bars: Vec<Bar> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse bars in {}", path.display()))?;
    Ok(bars)
}

#[async_trait]
impl<M: MarketData> MarketData for CachedMarketData<M> {
    async fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<BarSeries, BrokerError> {
        let path = self.cache_path(symbol, interval, start, end);
        if path.exists() {
            match load_bars_file(&path) {
                Ok(bars) => {
                    debug!("Loaded {} cached bars from {}", bars.len(), path.display());
                    return Ok(BarSeries::new(bars).range(start, end));
                }
                Err(e) => warn!("Ignoring unreadable cache {}: {:#}", path.display(), e),
            }
        }

        let bars = self.inner.get_bars(symbol, start, end, interval).await?;
        if bars.is_empty() {
            return Ok(bars);
        }
        match self.store(&path, &bars) {
            Ok(()) => info!("Cached {} {} bars for {} to {}", bars.len(), interval, symbol, path.display()),
            Err(e) => warn!("Could not write cache {}: {:#}", path.display(), e),
        }
        Ok(bars)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.inner.get_current_price(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::HistoricalData;
    use crate::test_helpers::{day, make_daily_bars};

    #[tokio::test]
    async fn fetched_range_is_written_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = HistoricalData::new(Interval::D1);
        data.load("AAPL", make_daily_bars(&[1.0, 2.0, 3.0]).into_vec());
        let cached = CachedMarketData::new(data, dir.path());

        let first = cached.get_bars("AAPL", day(0), day(2), Interval::D1).await.unwrap();
        let path = cached.cache_path("AAPL", Interval::D1, day(0), day(2));
        assert!(path.exists());
        assert_eq!(load_bars_file(&path).unwrap().len(), 3);

        // A cache over an empty store still answers from disk.
        let from_disk = CachedMarketData::new(HistoricalData::new(Interval::D1), dir.path());
        let second = from_disk.get_bars("AAPL", day(0), day(2), Interval::D1).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cached = CachedMarketData::new(HistoricalData::new(Interval::D1), dir.path());
        let bars = cached.get_bars("NONE", day(0), day(2), Interval::D1).await.unwrap();
        assert!(bars.is_empty());
        assert!(!cached.cache_path("NONE", Interval::D1, day(0), day(2)).exists());
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = HistoricalData::new(Interval::D1);
        data.load("AAPL", make_daily_bars(&[5.0, 6.0]).into_vec());
        let cached = CachedMarketData::new(data, dir.path());
        let path = cached.cache_path("AAPL", Interval::D1, day(0), day(1));
        std::fs::write(&path, "not json").unwrap();
        let bars = cached.get_bars("AAPL", day(0), day(1), Interval::D1).await.unwrap();
        assert_eq!(bars.closes(), vec![5.0, 6.0]);
    }
}
