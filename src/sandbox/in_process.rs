use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backtesting::BacktestResult;
use crate::broker::MarketData;
use crate::error::ExecutionError;
use crate::sandbox::worker::{self, WorkerRequest, WorkerResponse};
use crate::sandbox::{precheck, resolve_bars, ExecutionJob, ExecutionReport, Executor, ResourceLimits, RuntimeReport};

/// Same contract as `SandboxExecutor` but runs the worker logic on the
/// caller's runtime. It is NOT isolating: no memory or CPU ceiling, and the
/// wall-clock limit only takes effect at await points. For tests and local
/// debugging.
#[derive(Default, Clone)]
pub struct InProcessExecutor {
    market: Option<Arc<dyn MarketData>>,
}

impl InProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_market_data(mut self, market: Arc<dyn MarketData>) -> Self {
        self.market = Some(market);
        self
    }

    async fn run(&self, job: ExecutionJob, limits: &ResourceLimits) -> Result<BacktestResult, ExecutionError> {
        precheck(&job, limits)?;
        let bars = resolve_bars(&job, limits, self.market.as_deref()).await?;
        let request = WorkerRequest {
            job: job.with_bars(bars),
            limits: limits.clone(),
        };

        let limit = Duration::from_millis(limits.wall_clock_ms);
        let outcome = tokio::time::timeout(limit, worker::run_job(request))
            .await
            .map_err(|_| ExecutionError::SandboxTimeout {
                limit_ms: limits.wall_clock_ms,
            })?;

        // same JSON boundary as the isolated worker
        WorkerResponse::from_outcome(outcome).into_outcome()
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    async fn execute(&self, job: ExecutionJob, limits: &ResourceLimits) -> ExecutionReport {
        let started = Instant::now();
        let job_id = job.id;
        let outcome = self.run(job, limits).await;
        match &outcome {
            Ok(r) => debug!("In-process job {}: {} trades", job_id, r.metrics.total_trades),
            Err(e) => warn!("In-process job {} failed ({}): {}", job_id, e.kind(), e),
        }
        ExecutionReport {
            job_id,
            outcome,
            runtime: RuntimeReport {
                isolated: false,
                wall_ms: started.elapsed().as_millis() as u64,
                torn_down: true,
                ..Default::default()
            },
        }
    }
}
