//! The side of the sandbox that actually runs strategy code. Reads one
//! request, runs one backtest, writes one response. Logs go to stderr.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::backtesting::{BacktestHarness, BacktestResult};
use crate::broker::{HistoricalData, SimulatedBroker};
use crate::error::ExecutionError;
use crate::sandbox::{json_safe, ExecutionJob, ResourceLimits};
use crate::strategy::ScriptStrategy;

/// Exit status the worker uses when it gives up because of a limit.
pub const RESOURCE_EXIT_CODE: i32 = 75;

/// Upper bound on the request document, before it is parsed.
pub const MAX_REQUEST_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job: ExecutionJob,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok { result: Value },
    Err { error: ExecutionError },
}

impl WorkerResponse {
    pub fn from_outcome(outcome: Result<BacktestResult, ExecutionError>) -> Self {
        match outcome.and_then(|r| json_safe::result_to_json(&r)) {
            Ok(result) => WorkerResponse::Ok { result },
            Err(error) => WorkerResponse::Err { error },
        }
    }

    pub fn into_outcome(self) -> Result<BacktestResult, ExecutionError> {
        match self {
            WorkerResponse::Ok { result } => json_safe::result_from_json(result),
            WorkerResponse::Err { error } => Err(error),
        }
    }
}

/// Run the job's backtest against a simulated broker over its own bars.
pub async fn run_job(request: WorkerRequest) -> Result<BacktestResult, ExecutionError> {
    let WorkerRequest { job, limits } = request;

    if job.code.len() > limits.max_source_bytes {
        return Err(ExecutionError::SandboxResource {
            reason: format!("source is {} bytes, limit {}", job.code.len(), limits.max_source_bytes),
        });
    }
    let bars = job.bars.ok_or_else(|| ExecutionError::Data {
        reason: "request carries no bars".to_string(),
    })?;
    let total: usize = bars.values().map(|b| b.len()).sum();
    if total > limits.max_bars {
        return Err(ExecutionError::SandboxResource {
            reason: format!("{} bars exceed the limit of {}", total, limits.max_bars),
        });
    }

    let mut strategy =
        ScriptStrategy::new(&job.code, job.config)?.with_step_budget(limits.eval_step_budget);
    let mut broker = SimulatedBroker::new(HistoricalData::from_map(job.interval, bars), job.initial_capital);

    info!("Job {}: {} bars for {}", job.id, total, job.symbols.join(","));
    let result = BacktestHarness::new(&mut strategy, &mut broker)
        .run(&job.symbols, job.range, job.interval)
        .await;
    info!("Job {}: {} evaluation steps", job.id, strategy.steps_used());
    result
}

fn decode_request(raw: &[u8]) -> Result<WorkerRequest, ExecutionError> {
    serde_json::from_slice(raw).map_err(|e| ExecutionError::Internal {
        reason: format!("malformed request: {}", e),
    })
}

/// Read a request from `input`, write the response to `output`. Returns the
/// process exit code.
pub async fn serve<R, W>(input: R, mut output: W) -> anyhow::Result<i32>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    let mut limited = input.take(MAX_REQUEST_BYTES + 1);
    limited.read_to_end(&mut raw).await?;

    let outcome = if raw.len() as u64 > MAX_REQUEST_BYTES {
        Err(ExecutionError::SandboxResource {
            reason: format!("request exceeds {} bytes", MAX_REQUEST_BYTES),
        })
    } else {
        match decode_request(&raw) {
            Ok(request) => run_job(request).await,
            Err(e) => Err(e),
        }
    };

    let code = match &outcome {
        Err(ExecutionError::SandboxResource { reason }) => {
            warn!("Resource limit: {}", reason);
            RESOURCE_EXIT_CODE
        }
        _ => 0,
    };

    let response = WorkerResponse::from_outcome(outcome);
    let mut line = serde_json::to_vec(&response)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DateRange;
    use crate::strategy::template;
    use crate::test_helpers::{calm_closes, day, make_daily_bars, rsi_config};
    use std::collections::BTreeMap;

    fn request(code: &str) -> WorkerRequest {
        let cfg = rsi_config();
        let mut bars = BTreeMap::new();
        bars.insert("AAPL".to_string(), make_daily_bars(&calm_closes(60)).into_vec());
        let job = ExecutionJob::new(code.to_string(), cfg, DateRange::new(day(0), day(60)), 10_000.0)
            .with_bars(bars);
        WorkerRequest {
            job,
            limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn serves_a_successful_run() {
        let code = template::render(&rsi_config());
        let raw = serde_json::to_vec(&request(&code)).unwrap();
        let mut out = Vec::new();
        let exit = serve(&raw[..], &mut out).await.unwrap();
        assert_eq!(exit, 0);

        let response: WorkerResponse = serde_json::from_slice(&out).unwrap();
        let result = response.into_outcome().unwrap();
        assert_eq!(result.metrics.total_trades, 0);
        assert_eq!(result.equity_curve.len(), 60);
    }

    #[tokio::test]
    async fn budget_exhaustion_exits_with_resource_code() {
        let mut req = request("strategy S { entry e: close < 0 and close < 0; }");
        req.limits.eval_step_budget = 20;
        let raw = serde_json::to_vec(&req).unwrap();
        let mut out = Vec::new();
        assert_eq!(serve(&raw[..], &mut out).await.unwrap(), RESOURCE_EXIT_CODE);
        let response: WorkerResponse = serde_json::from_slice(&out).unwrap();
        assert_eq!(response.into_outcome().unwrap_err().kind(), "sandbox_resource");
    }

    #[tokio::test]
    async fn garbage_input_gets_a_structured_error() {
        let mut out = Vec::new();
        serve(&b"not json"[..], &mut out).await.unwrap();
        let response: WorkerResponse = serde_json::from_slice(&out).unwrap();
        assert_eq!(response.into_outcome().unwrap_err().kind(), "internal");
    }

    #[tokio::test]
    async fn strategy_exception_is_a_runtime_error() {
        let req = request(r#"strategy S { entry e: fail("bad input"); }"#);
        let err = run_job(req).await.unwrap_err();
        assert_eq!(err.kind(), "runtime");
        assert!(err.to_string().contains("bad input"));
    }
}
