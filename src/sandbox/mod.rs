//! Running untrusted strategy code.
//!
//! The host validates a job, resolves its bars through the data path and hands
//! everything to a worker process that has no other way to reach the outside
//! world. The worker answers with one JSON document.

pub mod executor;
pub mod in_process;
pub mod json_safe;
pub mod worker;

pub use executor::{Isolation, SandboxExecutor};
pub use in_process::InProcessExecutor;
pub use worker::{WorkerRequest, WorkerResponse};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::backtesting::BacktestResult;
use crate::broker::MarketData;
use crate::error::{ExecutionError, ValidationError};
use crate::models::{Bar, DateRange, Interval, StrategyConfig};
use crate::strategy::script::validate_source;

/// Where a job's bars may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// The host fetches historical bars on the job's behalf. The worker itself
    /// never gets a network capability.
    #[default]
    DataOnly,
    /// Nothing is fetched; the job must carry its bars.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_seconds: u64,
    /// `nice` increment for the worker.
    pub cpu_nice: i32,
    pub wall_clock_ms: u64,
    pub max_file_mb: u64,
    /// Host-wide cap on concurrently running workers.
    pub max_concurrent: usize,
    pub network: NetworkPolicy,
    pub max_bars: usize,
    pub max_source_bytes: usize,
    /// Expression nodes the interpreter may evaluate in one run.
    pub eval_step_budget: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_seconds: 30,
            cpu_nice: 10,
            wall_clock_ms: 60_000,
            max_file_mb: 16,
            max_concurrent: 4,
            network: NetworkPolicy::DataOnly,
            max_bars: 250_000,
            max_source_bytes: 64 * 1024,
            eval_step_budget: 50_000_000,
        }
    }
}

/// One unit of sandboxed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub id: Uuid,
    pub code: String,
    pub symbols: Vec<String>,
    pub config: StrategyConfig,
    pub range: DateRange,
    pub initial_capital: f64,
    #[serde(default)]
    pub interval: Interval,
    /// Bars already in hand, per symbol. Required under `NetworkPolicy::Offline`.
    #[serde(default)]
    pub bars: Option<BTreeMap<String, Vec<Bar>>>,
}

impl ExecutionJob {
    pub fn new(code: String, config: StrategyConfig, range: DateRange, initial_capital: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            symbols: config.symbols.clone(),
            config,
            range,
            initial_capital,
            interval: Interval::default(),
            bars: None,
        }
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_bars(mut self, bars: BTreeMap<String, Vec<Bar>>) -> Self {
        self.bars = Some(bars);
        self
    }
}

/// How the runtime behind one execution behaved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeReport {
    /// Ran in a separate process.
    pub isolated: bool,
    pub pid: Option<u32>,
    pub wall_ms: u64,
    pub exit_code: Option<i32>,
    /// Terminating signal, when the worker was killed.
    pub signal: Option<i32>,
    /// Process reaped and scratch directory removed.
    pub torn_down: bool,
    /// Last lines the worker wrote to stderr.
    #[serde(default)]
    pub stderr_tail: String,
    /// What fenced the worker off from the host; `None` when it ran in-process.
    #[serde(default)]
    pub isolation: Option<Isolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job_id: Uuid,
    pub outcome: Result<BacktestResult, ExecutionError>,
    pub runtime: RuntimeReport,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn result(&self) -> Option<&BacktestResult> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.outcome.as_ref().err()
    }
}

/// Runs a job to completion or structured failure. Never panics on bad input.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: ExecutionJob, limits: &ResourceLimits) -> ExecutionReport;
}

/// Everything that can be rejected before any strategy code runs.
pub fn precheck(job: &ExecutionJob, limits: &ResourceLimits) -> Result<(), ExecutionError> {
    if job.code.len() > limits.max_source_bytes {
        return Err(ExecutionError::SandboxResource {
            reason: format!(
                "source is {} bytes, limit {}",
                job.code.len(),
                limits.max_source_bytes
            ),
        });
    }
    validate_source(&job.code)?;
    job.config.validate()?;

    let invalid = |reason: String| Err(ExecutionError::Validation(ValidationError::Config { reason }));
    if job.symbols.is_empty() {
        return invalid("job lists no symbols".to_string());
    }
    if let Some(s) = job.symbols.iter().find(|s| !job.config.symbols.contains(s)) {
        return invalid(format!("symbol {} is not in the strategy config", s));
    }
    if !job.range.is_valid() {
        return invalid(format!(
            "date range {} .. {} is empty",
            job.range.start, job.range.end
        ));
    }
    if !(job.initial_capital.is_finite() && job.initial_capital > 0.0) {
        return invalid(format!("initial capital {} must be positive", job.initial_capital));
    }
    Ok(())
}

/// Bars for every job symbol, from the job itself or fetched through `market`.
pub async fn resolve_bars(
    job: &ExecutionJob,
    limits: &ResourceLimits,
    market: Option<&dyn MarketData>,
) -> Result<BTreeMap<String, Vec<Bar>>, ExecutionError> {
    let bars = match (&job.bars, limits.network, market) {
        (Some(bars), _, _) => bars.clone(),
        (None, NetworkPolicy::Offline, _) => {
            return Err(ExecutionError::Data {
                reason: "offline network policy and the job carries no bars".to_string(),
            })
        }
        (None, NetworkPolicy::DataOnly, None) => {
            return Err(ExecutionError::Data {
                reason: "no market data source configured".to_string(),
            })
        }
        (None, NetworkPolicy::DataOnly, Some(market)) => {
            let mut out = BTreeMap::new();
            for symbol in &job.symbols {
                let series = market
                    .get_bars(symbol, job.range.start, job.range.end, job.interval)
                    .await
                    .map_err(|e| ExecutionError::Data {
                        reason: format!("{}: {}", symbol, e),
                    })?;
                debug!("Fetched {} {} bars for {}", series.len(), job.interval, symbol);
                out.insert(symbol.clone(), series.into_vec());
            }
            out
        }
    };

    let total: usize = bars.values().map(|b| b.len()).sum();
    if total > limits.max_bars {
        return Err(ExecutionError::SandboxResource {
            reason: format!("{} bars exceed the limit of {}", total, limits.max_bars),
        });
    }
    Ok(bars)
}
