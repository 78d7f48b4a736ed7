use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use strategy_forge::backtesting::BacktestResult;
use strategy_forge::broker::{CachedMarketData, HistoricalData, LiveBroker, MarketData};
use strategy_forge::config::Config;
use strategy_forge::models::{DateRange, StrategyConfig};
use strategy_forge::sandbox::{ExecutionJob, Executor, InProcessExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    // backtest <script> <config.json> [days]
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: backtest <strategy script> <config.json> [days]");
    }
    let code = std::fs::read_to_string(&args[1])
        .with_context(|| format!("Failed to read {}", args[1]))?;
    let config: StrategyConfig = serde_json::from_str(
        &std::fs::read_to_string(&args[2]).with_context(|| format!("Failed to read {}", args[2]))?,
    )
    .with_context(|| format!("Failed to parse {}", args[2]))?;
    let days_back: i64 = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(cfg.backtest_days);

    let range = DateRange::trailing(Utc::now(), days_back);

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║          STRATEGY FORGE — BACKTESTER                     ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║  Strategy:   {}", config.name);
    println!("║  Symbols:    {}", config.symbols.join(", "));
    println!("║  Period:     {} days ({})", days_back, cfg.interval);
    println!("║  Capital:    ${:.2}", cfg.initial_capital);
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    let market: Arc<dyn MarketData> = if cfg.broker.has_credentials() {
        Arc::new(CachedMarketData::new(LiveBroker::new(&cfg.broker), &cfg.data_dir))
    } else {
        println!("No broker credentials; using cached bars in {}", cfg.data_dir.display());
        Arc::new(CachedMarketData::new(HistoricalData::new(cfg.interval), &cfg.data_dir))
    };

    let job = ExecutionJob::new(code, config, range, cfg.initial_capital).with_interval(cfg.interval);
    let report = InProcessExecutor::new()
        .with_market_data(market)
        .execute(job, &cfg.sandbox)
        .await;

    let result = match report.outcome {
        Ok(result) => result,
        Err(e) => {
            println!("ERROR ({}): {}", e.kind(), e);
            return Ok(());
        }
    };

    result.print_summary();

    let report_file = cfg.data_dir.join(format!(
        "backtest_{}_{}.json",
        result.start.format("%Y%m%d"),
        result.end.format("%Y%m%d"),
    ));
    save_result_to_file(&result, &report_file)?;
    println!("\nReport saved to: {}", report_file.display());

    Ok(())
}

fn save_result_to_file(result: &BacktestResult, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(result)?)?;
    Ok(())
}
