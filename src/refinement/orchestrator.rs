//! The generate → execute → analyze → refine loop.
//!
//! Iterations are strictly sequential. Execution failures are analysis input,
//! never a reason to abort. Generation failures end the run, but whatever the
//! best iteration so far produced is still returned.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::backtesting::{BacktestResult, Metrics};
use crate::config::Config;
use crate::error::{ExecutionError, GenerationError};
use crate::models::{ConfigChange, DateRange, Interval, StrategyConfig};
use crate::progress::{EventKind, ProgressBus, SessionId};
use crate::refinement::analysis::{Analysis, AnalysisPolicy};
use crate::refinement::generator::{CodeGenerator, Feedback, GenerationRequest};
use crate::refinement::protection::ProtectedSet;
use crate::sandbox::{ExecutionJob, Executor, ResourceLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generating,
    Executing,
    Analyzing,
    Refining,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Generating => "generating",
            Phase::Executing => "executing",
            Phase::Analyzing => "analyzing",
            Phase::Refining => "refining",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// An iteration cleared every analysis threshold.
    Converged,
    MaxIterations,
    GenerationFailed,
    Cancelled,
}

/// Shared between a running loop and whoever may want to stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRequest {
    pub description: String,
    /// Values the user stated explicitly.
    #[serde(default)]
    pub protected_parameters: BTreeMap<String, f64>,
    pub range: DateRange,
    pub initial_capital: f64,
    #[serde(default)]
    pub interval: Interval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementSettings {
    pub limits: ResourceLimits,
    pub policy: AnalysisPolicy,
    pub max_iterations: u32,
    pub widen_factor: f64,
    /// Longest backtest range widening may produce.
    pub max_lookback_days: i64,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            policy: AnalysisPolicy::default(),
            max_iterations: 5,
            widen_factor: 0.5,
            max_lookback_days: 3650,
        }
    }
}

impl RefinementSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            limits: cfg.sandbox.clone(),
            policy: cfg.analysis.clone(),
            max_iterations: cfg.max_iterations.max(1),
            widen_factor: cfg.widen_factor,
            max_lookback_days: cfg.max_lookback_days.max(1),
        }
    }
}

/// What one iteration did, kept for auditing convergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub range: DateRange,
    pub config: StrategyConfig,
    /// Against the previous iteration's config; empty for the first.
    pub config_diff: Vec<ConfigChange>,
    pub metrics: Option<Metrics>,
    pub error: Option<ExecutionError>,
    pub analysis: Analysis,
    /// Protected-parameter interventions.
    pub notes: Vec<String>,
    pub wall_ms: u64,
}

impl IterationRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementOutcome {
    pub status: RunStatus,
    pub iterations: u32,
    pub best_iteration: Option<u32>,
    pub final_code: Option<String>,
    pub final_config: Option<StrategyConfig>,
    pub final_result: Option<BacktestResult>,
    pub history: Vec<IterationRecord>,
    pub error: Option<GenerationError>,
}

impl RefinementOutcome {
    pub fn is_error(&self) -> bool {
        self.status == RunStatus::GenerationFailed
    }

    /// Compact form for progress payloads.
    pub fn summary(&self) -> Value {
        json!({
            "status": self.status,
            "iterations": self.iterations,
            "best_iteration": self.best_iteration,
            "metrics": self.final_result.as_ref().map(|r| &r.metrics),
            "error": self.error.as_ref().map(|e| e.to_string()),
        })
    }

    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(70));
        println!("  REFINEMENT: {:?} after {} iteration(s)", self.status, self.iterations);
        println!("{}", "=".repeat(70));
        for rec in &self.history {
            let marker = if Some(rec.iteration) == self.best_iteration { "*" } else { " " };
            match (&rec.metrics, &rec.error) {
                (Some(m), _) => println!(
                    " {} #{:<2} {:>4} days  trades {:>3}  win {:>5.1}%  return {:>+7.2}%  sharpe {:>5.2}",
                    marker,
                    rec.iteration,
                    rec.range.days(),
                    m.total_trades,
                    m.win_rate * 100.0,
                    m.total_return * 100.0,
                    m.sharpe_ratio
                ),
                (None, Some(e)) => println!(" {} #{:<2} failed: {}", marker, rec.iteration, e),
                (None, None) => {}
            }
            for issue in &rec.analysis.issues {
                println!("        - {}", issue);
            }
            for note in &rec.notes {
                println!("        note: {}", note);
            }
        }
        if let Some(e) = &self.error {
            println!();
            println!("  Generation failed: {}", e);
        }
        if let Some(result) = &self.final_result {
            result.print_summary();
        } else {
            println!("{}", "=".repeat(70));
        }
    }
}

struct Candidate {
    iteration: u32,
    code: String,
    config: StrategyConfig,
    notes: Vec<String>,
}

/// Internal state: each phase carries what the next one needs.
enum Step {
    Generating,
    Executing(Candidate),
    Analyzing(Candidate, Result<BacktestResult, ExecutionError>, u64),
    Refining(Analysis),
    Done(RunStatus),
}

impl Step {
    fn phase(&self) -> Phase {
        match self {
            Step::Generating => Phase::Generating,
            Step::Executing(..) => Phase::Executing,
            Step::Analyzing(..) => Phase::Analyzing,
            Step::Refining(..) => Phase::Refining,
            Step::Done(..) => Phase::Done,
        }
    }
}

struct Best {
    iteration: u32,
    accepted: bool,
    sharpe: f64,
    total_return: f64,
    code: String,
    config: StrategyConfig,
    result: BacktestResult,
}

impl Best {
    fn outranks(&self, other: &Best) -> bool {
        if self.accepted != other.accepted {
            return self.accepted;
        }
        (self.sharpe, self.total_return) > (other.sharpe, other.total_return)
    }
}

pub struct Orchestrator {
    generator: Arc<dyn CodeGenerator>,
    executor: Arc<dyn Executor>,
    settings: RefinementSettings,
    progress: Option<(ProgressBus, SessionId)>,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        executor: Arc<dyn Executor>,
        settings: RefinementSettings,
    ) -> Self {
        Self {
            generator,
            executor,
            settings,
            progress: None,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_progress(mut self, bus: ProgressBus, session_id: SessionId) -> Self {
        self.progress = Some((bus, session_id));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        if let Some((bus, session)) = &self.progress {
            bus.emit(*session, kind, payload);
        }
    }

    pub async fn run(&self, request: RefinementRequest) -> RefinementOutcome {
        let max_iterations = self.settings.max_iterations.max(1);
        let mut protected = ProtectedSet::new(request.protected_parameters.clone());
        let mut range = request.range;
        let mut iteration = 0u32;
        let mut feedback: Option<Feedback> = None;
        let mut previous: Option<StrategyConfig> = None;
        let mut last_code: Option<String> = None;
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut best: Option<Best> = None;
        let mut failure: Option<GenerationError> = None;

        info!(
            "Refining '{}' for up to {} iteration(s)",
            request.description, max_iterations
        );

        let mut step = Step::Generating;
        let status = loop {
            let phase = step.phase();
            step = match step {
                Step::Generating => {
                    if self.cancel.is_cancelled() {
                        info!("Cancelled before iteration {}", iteration + 1);
                        Step::Done(RunStatus::Cancelled)
                    } else {
                        iteration += 1;
                        self.emit(
                            EventKind::PhaseStart,
                            json!({"phase": phase, "iteration": iteration}),
                        );
                        let gen_request = GenerationRequest {
                            description: request.description.clone(),
                            feedback: feedback.take(),
                            protected_parameters: protected.values().clone(),
                            previous_config: previous.clone(),
                        };
                        match self.generator.generate(&gen_request).await {
                            Ok(generated) => {
                                let mut config = generated.config;
                                protected.adopt(&config);
                                let notes = protected.enforce(&mut config);
                                self.emit(
                                    EventKind::PhaseComplete,
                                    json!({
                                        "phase": phase,
                                        "iteration": iteration,
                                        "restored": notes.len(),
                                    }),
                                );
                                Step::Executing(Candidate {
                                    iteration,
                                    code: generated.code,
                                    config,
                                    notes,
                                })
                            }
                            Err(e) => {
                                error!("Iteration {}: code generation failed: {}", iteration, e);
                                self.emit(
                                    EventKind::PhaseComplete,
                                    json!({"phase": phase, "iteration": iteration, "error": e.to_string()}),
                                );
                                failure = Some(e);
                                Step::Done(RunStatus::GenerationFailed)
                            }
                        }
                    }
                }

                Step::Executing(candidate) => {
                    self.emit(
                        EventKind::PhaseStart,
                        json!({"phase": phase, "iteration": candidate.iteration, "days": range.days()}),
                    );
                    let started = Instant::now();
                    let job = ExecutionJob::new(
                        candidate.code.clone(),
                        candidate.config.clone(),
                        range,
                        request.initial_capital,
                    )
                    .with_interval(request.interval);
                    let report = self.executor.execute(job, &self.settings.limits).await;
                    let wall_ms = started.elapsed().as_millis() as u64;
                    self.emit(
                        EventKind::PhaseComplete,
                        json!({
                            "phase": phase,
                            "iteration": candidate.iteration,
                            "ok": report.is_success(),
                            "error_kind": report.error().map(|e| e.kind()),
                            "isolated": report.runtime.isolated,
                            "wall_ms": wall_ms,
                        }),
                    );
                    Step::Analyzing(candidate, report.outcome, wall_ms)
                }

                Step::Analyzing(candidate, outcome, wall_ms) => {
                    self.emit(
                        EventKind::PhaseStart,
                        json!({"phase": phase, "iteration": candidate.iteration}),
                    );
                    let analysis = self.settings.policy.analyze(&candidate.config, &outcome);
                    let config_diff = previous
                        .as_ref()
                        .map(|p| p.diff(&candidate.config))
                        .unwrap_or_default();

                    let (metrics, exec_error) = match &outcome {
                        Ok(r) => (Some(r.metrics.clone()), None),
                        Err(e) => {
                            warn!("Iteration {} failed ({}): {}", candidate.iteration, e.kind(), e);
                            (None, Some(e.clone()))
                        }
                    };

                    history.push(IterationRecord {
                        iteration: candidate.iteration,
                        range,
                        config: candidate.config.clone(),
                        config_diff,
                        metrics: metrics.clone(),
                        error: exec_error,
                        analysis: analysis.clone(),
                        notes: candidate.notes,
                        wall_ms,
                    });

                    if let Ok(result) = outcome {
                        let contender = Best {
                            iteration: candidate.iteration,
                            accepted: !analysis.needs_refinement,
                            sharpe: result.metrics.sharpe_ratio,
                            total_return: result.metrics.total_return,
                            code: candidate.code.clone(),
                            config: candidate.config.clone(),
                            result,
                        };
                        if best.as_ref().map_or(true, |b| contender.outranks(b)) {
                            best = Some(contender);
                        }
                    }

                    self.emit(
                        EventKind::Iteration,
                        json!({
                            "iteration": candidate.iteration,
                            "metrics": metrics,
                            "needs_refinement": analysis.needs_refinement,
                            "issues": analysis.issues,
                        }),
                    );
                    self.emit(
                        EventKind::PhaseComplete,
                        json!({"phase": phase, "iteration": candidate.iteration}),
                    );

                    previous = Some(candidate.config);
                    last_code = Some(candidate.code);

                    if !analysis.needs_refinement {
                        info!("Iteration {} cleared every threshold", candidate.iteration);
                        Step::Done(RunStatus::Converged)
                    } else if candidate.iteration >= max_iterations {
                        info!("Stopping after {} iterations", candidate.iteration);
                        Step::Done(RunStatus::MaxIterations)
                    } else {
                        Step::Refining(analysis)
                    }
                }

                Step::Refining(analysis) => {
                    self.emit(
                        EventKind::PhaseStart,
                        json!({"phase": phase, "iteration": iteration}),
                    );
                    let screened = protected.screen(
                        &analysis.suggestions,
                        range,
                        self.settings.widen_factor,
                        self.settings.max_lookback_days,
                    );
                    range = screened.range;
                    if let Some(last) = history.last_mut() {
                        last.notes.extend(screened.notes.iter().cloned());
                    }
                    let mut notes = analysis.notes;
                    notes.extend(screened.notes);
                    feedback = Some(Feedback {
                        iteration,
                        issues: analysis.issues,
                        suggestions: screened.suggestions,
                        notes,
                    });
                    self.emit(
                        EventKind::PhaseComplete,
                        json!({"phase": phase, "iteration": iteration, "days": range.days()}),
                    );
                    Step::Generating
                }

                Step::Done(status) => break status,
            };
        };

        let (best_iteration, final_code, final_config, final_result) = match best {
            Some(b) => (Some(b.iteration), Some(b.code), Some(b.config), Some(b.result)),
            // nothing ran successfully; hand back the last attempt
            None => (None, last_code, previous, None),
        };

        RefinementOutcome {
            status,
            iterations: iteration,
            best_iteration,
            final_code,
            final_config,
            final_result,
            history,
            error: failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{HistoricalData, MarketData};
    use crate::models::Parameter;
    use crate::refinement::generator::{GeneratedStrategy, TemplateGenerator};
    use crate::sandbox::InProcessExecutor;
    use crate::strategy::template;
    use crate::test_helpers::{calm_closes, day, make_daily_bars, rsi_config};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn executor() -> Arc<dyn Executor> {
        let mut data = HistoricalData::new(Interval::D1);
        data.load("AAPL", make_daily_bars(&calm_closes(400)).into_vec());
        let market: Arc<dyn MarketData> = Arc::new(data);
        Arc::new(InProcessExecutor::new().with_market_data(market))
    }

    fn request() -> RefinementRequest {
        RefinementRequest {
            description: "buy AAPL when RSI(14) < 30, sell above 70 or at -1%".into(),
            protected_parameters: rsi_config().protected_parameters(),
            range: DateRange::new(day(200), day(380)),
            initial_capital: 10_000.0,
            interval: Interval::D1,
        }
    }

    fn settings(max_iterations: u32) -> RefinementSettings {
        RefinementSettings {
            max_iterations,
            ..Default::default()
        }
    }

    /// Tries to sneak a new value into every protected parameter.
    struct Rogue {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CodeGenerator for Rogue {
        async fn generate(&self, _: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut config = rsi_config();
            config.parameters.insert("rsi_threshold".into(), Parameter::new(40.0 + n as f64));
            Ok(GeneratedStrategy {
                code: template::render(&config),
                config,
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl CodeGenerator for Broken {
        async fn generate(&self, _: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError> {
            Err(GenerationError::Exhausted {
                attempts: 3,
                last_error: "503".into(),
            })
        }
    }

    #[tokio::test]
    async fn stops_at_max_iterations_with_full_history() {
        let orch = Orchestrator::new(
            Arc::new(TemplateGenerator::new(rsi_config())),
            executor(),
            settings(3),
        );
        let outcome = orch.run(request()).await;
        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.history.len(), 3);
        assert!(outcome.history.iter().all(|r| r.analysis.needs_refinement));
        assert_eq!(outcome.final_config.unwrap().param("rsi_threshold"), Some(30.0));
        // blocked suggestion widened the range each round
        assert!(outcome.history[1].range.days() > outcome.history[0].range.days());
        assert!(outcome.history[0].notes.iter().any(|n| n.contains("could not comply")));
    }

    #[tokio::test]
    async fn long_runs_stop_widening_at_the_lookback_cap() {
        let orch = Orchestrator::new(
            Arc::new(TemplateGenerator::new(rsi_config())),
            executor(),
            settings(40),
        );
        let outcome = orch.run(request()).await;
        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.history.len(), 40);
        assert!(outcome.best_iteration.is_some());
        assert!(outcome.history.iter().all(|r| r.range.days() <= 3650));
        let last = outcome.history.last().unwrap();
        assert_eq!(last.range.days(), 3650);
        assert_eq!(last.config.param("rsi_threshold"), Some(30.0));
        assert!(outcome.history[38]
            .notes
            .iter()
            .any(|n| n == "could not widen backtest range beyond 3650 days"));
    }

    #[tokio::test]
    async fn huge_widen_factor_keeps_the_range_instead_of_failing() {
        let mut s = settings(40);
        s.widen_factor = 1e6;
        s.max_lookback_days = i64::MAX;
        let orch = Orchestrator::new(Arc::new(TemplateGenerator::new(rsi_config())), executor(), s);
        let outcome = orch.run(request()).await;
        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.history.len(), 40);
        assert!(outcome.history.iter().all(|r| r.range == request().range));
        assert!(outcome.history[0]
            .notes
            .iter()
            .any(|n| n == "could not widen backtest range beyond 180 days"));
    }

    #[tokio::test]
    async fn rogue_generator_cannot_change_protected_values() {
        let orch = Orchestrator::new(
            Arc::new(Rogue {
                calls: AtomicU32::new(0),
            }),
            executor(),
            settings(3),
        );
        let outcome = orch.run(request()).await;
        for rec in &outcome.history {
            assert_eq!(rec.config.param("rsi_threshold"), Some(30.0));
            assert!(rec.notes.iter().any(|n| n.contains("restored protected rsi_threshold")));
        }
        assert_eq!(outcome.final_config.unwrap().param("rsi_threshold"), Some(30.0));
    }

    #[tokio::test]
    async fn generation_failure_is_terminal() {
        let orch = Orchestrator::new(Arc::new(Broken), executor(), settings(5));
        let outcome = orch.run(request()).await;
        assert_eq!(outcome.status, RunStatus::GenerationFailed);
        assert!(outcome.is_error());
        assert!(outcome.history.is_empty());
        assert!(outcome.final_result.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let orch = Orchestrator::new(
            Arc::new(TemplateGenerator::new(rsi_config())),
            executor(),
            settings(5),
        );
        orch.cancel_flag().cancel();
        let outcome = orch.run(request()).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.iterations, 0);
    }

    #[tokio::test]
    async fn lenient_policy_converges_on_first_iteration() {
        let mut s = settings(5);
        s.policy.min_trades = 0;
        let orch = Orchestrator::new(Arc::new(TemplateGenerator::new(rsi_config())), executor(), s);
        let outcome = orch.run(request()).await;
        assert_eq!(outcome.status, RunStatus::Converged);
        assert_eq!(outcome.best_iteration, Some(1));
        assert_eq!(outcome.final_result.unwrap().metrics.total_trades, 0);
    }

    #[test]
    fn accepted_iterations_outrank_better_metrics() {
        let best = |accepted: bool, sharpe: f64| Best {
            iteration: 1,
            accepted,
            sharpe,
            total_return: 0.0,
            code: String::new(),
            config: rsi_config(),
            result: BacktestResult {
                strategy: String::new(),
                start: day(0),
                end: day(1),
                initial_capital: 1.0,
                orders: Vec::new(),
                equity_curve: Vec::new(),
                trades: Vec::new(),
                metrics: Metrics::compute(1.0, &[], &[]),
                open_positions: Vec::new(),
                bars_processed: 0,
                signals_generated: 0,
                clamped_orders: 0,
            },
        };
        assert!(best(true, 0.1).outranks(&best(false, 2.0)));
        assert!(best(false, 2.0).outranks(&best(false, 1.0)));
        assert!(!best(false, 1.0).outranks(&best(false, 1.0)));
    }
}
