use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use strategy_forge::broker::{CachedMarketData, HistoricalData, LiveBroker, MarketData};
use strategy_forge::config::{Config, SharedConfig};
use strategy_forge::models::{DateRange, StrategyConfig};
use strategy_forge::refinement::{
    CodeGenerator, HttpCodeGenerator, RefinementRequest, RefinementSettings, RetryingGenerator,
    TemplateGenerator,
};
use strategy_forge::sandbox::SandboxExecutor;
use strategy_forge::session::SessionManager;

struct Args {
    description: String,
    protected: BTreeMap<String, f64>,
    base_config: Option<PathBuf>,
}

fn usage() -> &'static str {
    "usage: strategy-forge [--protect name=value]... [--config base.json] <description>"
}

fn parse_args() -> Result<Args> {
    let mut protected = BTreeMap::new();
    let mut base_config = None;
    let mut words = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--protect" => {
                let spec = args.next().context(usage())?;
                let (name, value) = spec
                    .split_once('=')
                    .with_context(|| format!("--protect expects name=value, got {:?}", spec))?;
                let value: f64 = value
                    .parse()
                    .with_context(|| format!("--protect {}: {:?} is not a number", name, value))?;
                protected.insert(name.to_string(), value);
            }
            "--config" => base_config = Some(PathBuf::from(args.next().context(usage())?)),
            _ => words.push(arg),
        }
    }

    if words.is_empty() {
        bail!(usage());
    }
    Ok(Args {
        description: words.join(" "),
        protected,
        base_config,
    })
}

fn load_config(path: &PathBuf) -> Result<StrategyConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn build_generator(cfg: &Config, args: &Args) -> Result<Arc<dyn CodeGenerator>> {
    if let Some(endpoint) = &cfg.codegen.endpoint {
        info!("Code generation via {}", endpoint);
        let http = HttpCodeGenerator::new(endpoint, &cfg.codegen);
        return Ok(Arc::new(RetryingGenerator::new(
            http,
            cfg.codegen.max_attempts,
            Duration::from_millis(cfg.codegen.backoff_ms),
        )));
    }
    match &args.base_config {
        Some(path) => {
            info!("Offline generation from {}", path.display());
            Ok(Arc::new(TemplateGenerator::new(load_config(path)?)))
        }
        None => bail!("set CODEGEN_URL or pass --config for offline generation"),
    }
}

fn build_market(cfg: &Config) -> Arc<dyn MarketData> {
    if cfg.broker.has_credentials() {
        Arc::new(CachedMarketData::new(LiveBroker::new(&cfg.broker), &cfg.data_dir))
    } else {
        warn!("No broker credentials; only cached bars in {} are available", cfg.data_dir.display());
        Arc::new(CachedMarketData::new(HistoricalData::new(cfg.interval), &cfg.data_dir))
    }
}

/// Periodically drop expired sessions. Re-reads retention each round.
fn spawn_janitor(manager: SessionManager, config: SharedConfig) {
    tokio::spawn(async move {
        loop {
            let every = config.read().await.retention_secs.max(1);
            tokio::time::sleep(Duration::from_secs(every)).await;
            let evicted = manager.evict_expired();
            if evicted > 0 {
                info!("Evicted {} expired session(s)", evicted);
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    let args = parse_args()?;
    let generator = build_generator(&cfg, &args)?;

    let worker = cfg
        .worker_path
        .clone()
        .or_else(SandboxExecutor::default_worker_path)
        .context("sandbox-worker not found; set SANDBOX_WORKER")?;
    let mut executor = SandboxExecutor::new(worker, cfg.sandbox.max_concurrent)
        .with_market_data(build_market(&cfg));
    if let Some(level) = cfg.isolation {
        executor = executor.with_isolation(level);
    }
    info!("Sandbox isolation: {:?}", executor.isolation().await);

    let manager = SessionManager::new(
        generator,
        Arc::new(executor),
        RefinementSettings::from_config(&cfg),
        Duration::from_secs(cfg.heartbeat_secs.max(1)),
        Duration::from_secs(cfg.retention_secs),
    );

    let request = RefinementRequest {
        description: args.description,
        protected_parameters: args.protected,
        range: DateRange::trailing(chrono::Utc::now(), cfg.backtest_days),
        initial_capital: cfg.initial_capital,
        interval: cfg.interval,
    };
    let data_dir = cfg.data_dir.clone();
    spawn_janitor(manager.clone(), cfg.shared());

    let id = manager.create_session();
    manager.start(id, request)?;
    let mut events = manager.subscribe(id)?;

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                warn!("Ctrl+C: cancelling after the current iteration");
                manager.cancel(id)?;
                cancel_sent = true;
            }
            event = events.next() => match event {
                Some(ev) => println!(
                    "[{}] #{:<3} {:<14} {}",
                    ev.timestamp.format("%H:%M:%S"),
                    ev.seq,
                    ev.kind,
                    ev.payload
                ),
                None => break,
            },
        }
    }

    let outcome = manager.get_result(id)?;
    outcome.print_summary();

    std::fs::create_dir_all(&data_dir)?;
    let out_file = data_dir.join(format!("refinement_{}.json", id));
    std::fs::write(&out_file, serde_json::to_string_pretty(outcome.as_ref())?)?;
    println!("\nOutcome saved to: {}", out_file.display());

    if outcome.is_error() {
        bail!("refinement ended with a generation failure");
    }
    Ok(())
}
