mod common;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use strategy_forge::error::GenerationError;
use strategy_forge::models::{ConfigChange, DateRange, Interval, Side};
use strategy_forge::progress::{EventKind, ProgressBus, ProgressEvent, Subscription};
use strategy_forge::refinement::{
    AnalysisPolicy, CodeGenerator, GeneratedStrategy, GenerationRequest, Orchestrator,
    RefinementRequest, RefinementSettings, RunStatus, TemplateGenerator,
};
use strategy_forge::sandbox::{ExecutionJob, Executor, InProcessExecutor, ResourceLimits};
use strategy_forge::session::SessionManager;
use strategy_forge::strategy::template;

use common::*;

/// Always hands back the same source, whatever the feedback says.
struct FixedGenerator {
    code: String,
}

#[async_trait]
impl CodeGenerator for FixedGenerator {
    async fn generate(&self, _: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError> {
        Ok(GeneratedStrategy {
            code: self.code.clone(),
            config: price_config("AAPL"),
        })
    }
}

fn rsi_request(range: DateRange) -> RefinementRequest {
    RefinementRequest {
        description: "Buy AAPL when the 14-day RSI drops below 30; sell above 70 or at a 1% loss".into(),
        protected_parameters: rsi_config().protected_parameters(),
        range,
        initial_capital: 10_000.0,
        interval: Interval::D1,
    }
}

fn calm_manager(max_iterations: u32) -> SessionManager {
    let executor = InProcessExecutor::new().with_market_data(market("AAPL", &calm_closes(400)));
    SessionManager::new(
        Arc::new(TemplateGenerator::new(rsi_config())),
        Arc::new(executor),
        RefinementSettings {
            max_iterations,
            ..Default::default()
        },
        Duration::from_secs(30),
        Duration::from_secs(300),
    )
}

async fn drain(sub: &mut Subscription) -> Vec<ProgressEvent> {
    let mut out = Vec::new();
    while let Some(ev) = sub.next().await {
        out.push(ev);
    }
    out
}

// ── Example run ──────────────────────────────────────────────

#[tokio::test]
async fn example_run_is_a_successful_zero_trade_iteration() {
    let cfg = rsi_config();
    let executor = InProcessExecutor::new().with_market_data(market("AAPL", &calm_closes(180)));
    let job = ExecutionJob::new(template::render(&cfg), cfg.clone(), DateRange::new(day(0), day(180)), 10_000.0);

    let report = executor.execute(job, &ResourceLimits::default()).await;
    assert!(report.is_success());
    let result = report.result().unwrap();
    assert_eq!(result.metrics.total_trades, 0);
    assert_eq!(result.metrics.total_return, 0.0);
    assert_eq!(result.metrics.final_equity, 10_000.0);

    let analysis = AnalysisPolicy::default().analyze(&cfg, &report.outcome);
    assert!(analysis.needs_refinement);
    assert!(analysis.issues.iter().any(|i| i.contains("only 0 trades")));
}

// ── Exits ────────────────────────────────────────────────────

#[tokio::test]
async fn full_exits_sell_the_whole_position() {
    let executor = InProcessExecutor::new().with_market_data(market("AAPL", &choppy_closes(60)));
    let code = "strategy Dip { entry dip: close < prev(close); exit pop: close > prev(close); }";
    let job = ExecutionJob::new(code.into(), price_config("AAPL"), DateRange::new(day(0), day(60)), 10_000.0);

    let report = executor.execute(job, &ResourceLimits::default()).await;
    let result = report.result().unwrap();
    assert!(result.metrics.total_trades > 0);

    let mut held = 0.0;
    let mut sells = 0;
    for order in &result.orders {
        match order.side() {
            Side::Buy => held += order.quantity(),
            Side::Sell => {
                assert!((order.quantity() - held).abs() < 1e-9, "sold {} of {}", order.quantity(), held);
                held = 0.0;
                sells += 1;
            }
        }
    }
    assert_eq!(sells, result.metrics.total_trades);
}

// ── Refinement loop ──────────────────────────────────────────

#[tokio::test]
async fn strategy_exception_is_recorded_not_fatal() {
    let executor = InProcessExecutor::new().with_market_data(market("AAPL", &choppy_closes(60)));
    let orch = Orchestrator::new(
        Arc::new(FixedGenerator {
            code: r#"strategy Boom { entry e: fail("boom"); }"#.into(),
        }),
        Arc::new(executor),
        RefinementSettings {
            max_iterations: 2,
            ..Default::default()
        },
    );
    let outcome = orch.run(rsi_request(DateRange::new(day(0), day(60)))).await;

    assert_eq!(outcome.status, RunStatus::MaxIterations);
    assert_eq!(outcome.history.len(), 2);
    for rec in &outcome.history {
        assert!(!rec.succeeded());
        assert_eq!(rec.error.as_ref().unwrap().kind(), "runtime");
        assert!(rec.analysis.needs_refinement);
    }
    assert!(outcome.best_iteration.is_none());
    assert!(outcome.final_code.unwrap().contains("boom"));
}

#[tokio::test]
async fn protected_parameter_survives_every_iteration() {
    let manager = calm_manager(4);
    let id = manager.create_session();
    manager
        .start(id, rsi_request(DateRange::new(day(220), day(400))))
        .unwrap();
    drain(&mut manager.subscribe(id).unwrap()).await;

    let outcome = manager.get_result(id).unwrap();
    assert_eq!(outcome.status, RunStatus::MaxIterations);
    assert_eq!(outcome.history.len(), 4);
    for rec in &outcome.history {
        assert_eq!(rec.config.param("rsi_threshold"), Some(30.0));
    }
    assert_eq!(
        outcome.final_config.as_ref().unwrap().param("rsi_threshold"),
        Some(30.0)
    );
    // the blocked suggestion turned into a wider range
    assert!(outcome.history[0]
        .notes
        .iter()
        .any(|n| n.contains("could not comply: rsi_threshold")));
    assert!(outcome.history[1].range.days() > outcome.history[0].range.days());
}

#[tokio::test]
async fn iteration_history_records_config_diffs() {
    let executor = InProcessExecutor::new().with_market_data(market("AAPL", &wave_closes(200)));
    let orch = Orchestrator::new(
        Arc::new(TemplateGenerator::new(rsi_config())),
        Arc::new(executor),
        RefinementSettings {
            max_iterations: 2,
            ..Default::default()
        },
    );
    let outcome = orch.run(rsi_request(DateRange::new(day(0), day(200)))).await;

    assert_eq!(outcome.history.len(), 2);
    let first = &outcome.history[0];
    assert!(first.config_diff.is_empty());
    assert!(first.metrics.as_ref().unwrap().total_trades >= 3);
    assert!(first.analysis.issues.iter().any(|i| i.contains("win rate")));

    // stop-outs drag the win rate down, so exits get tightened
    let second = &outcome.history[1];
    assert_eq!(second.config.param("rsi_exit"), Some(63.0));
    assert!(second.config_diff.iter().any(|c| matches!(
        c,
        ConfigChange::Parameter { name, .. } if name == "rsi_exit"
    )));
    assert_eq!(second.config.param("rsi_threshold"), Some(30.0));
}

// ── Progress ─────────────────────────────────────────────────

#[tokio::test]
async fn late_consumer_gets_buffered_then_live_events() {
    let bus = ProgressBus::new(Duration::from_secs(60));
    let id = Uuid::new_v4();
    bus.open(id);
    for i in 0..5 {
        bus.emit(id, EventKind::PhaseStart, json!({ "step": i }));
    }

    let mut sub = bus.subscribe(id).unwrap();
    let producer = bus.clone();
    let task = tokio::spawn(async move {
        for i in 5..8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.emit(id, EventKind::Iteration, json!({ "step": i }));
        }
        producer.emit(id, EventKind::Complete, json!({}));
    });

    let events = drain(&mut sub).await;
    task.await.unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..9).collect::<Vec<u64>>());
    assert_eq!(events[4].payload["step"], 4);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn reconnecting_consumer_loses_nothing() {
    let manager = calm_manager(2);
    let id = manager.create_session();
    manager
        .start(id, rsi_request(DateRange::new(day(220), day(400))))
        .unwrap();

    // first connection reads a little and goes away
    {
        let mut first = manager.subscribe(id).unwrap();
        first.next().await.unwrap();
        first.next().await.unwrap();
    }

    let events = drain(&mut manager.subscribe(id).unwrap()).await;
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<u64>>());
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Iteration).count(), 2);
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::PhaseStart && e.payload["phase"] == "executing"));

    // the stream is over but the result stays
    assert!(manager.get_result(id).is_ok());
}
