use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::Interval;
use crate::refinement::AnalysisPolicy;
use crate::sandbox::{Isolation, NetworkPolicy, ResourceLimits};

pub type SharedConfig = Arc<RwLock<Config>>;

/// External code-generation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodegenConfig {
    /// Unset means generate offline from templates.
    pub endpoint: Option<String>,
    pub api_key: String,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

/// Alpaca-style brokerage and market-data endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub trading_url: String,
    pub data_url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl BrokerConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub codegen: CodegenConfig,
    pub broker: BrokerConfig,

    // Backtests
    pub data_dir: PathBuf,
    pub initial_capital: f64,
    pub interval: Interval,
    pub backtest_days: i64,

    // Sandbox
    pub sandbox: ResourceLimits,
    /// Defaults to `sandbox-worker` next to the running executable.
    pub worker_path: Option<PathBuf>,
    /// `None` detects namespace support on the host.
    pub isolation: Option<Isolation>,

    // Refinement
    pub analysis: AnalysisPolicy,
    pub max_iterations: u32,
    /// Share of the date range added when a protected parameter blocks a suggestion.
    pub widen_factor: f64,
    /// Cap on the widened backtest range, in days.
    pub max_lookback_days: i64,

    // Progress
    pub heartbeat_secs: u64,
    pub retention_secs: u64,

    // Logging
    pub log_level: String,
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let env = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let limits = ResourceLimits::default();
        let policy = AnalysisPolicy::default();

        let network = match env("SANDBOX_NETWORK", "data_only").to_lowercase().as_str() {
            "offline" | "none" => NetworkPolicy::Offline,
            _ => NetworkPolicy::DataOnly,
        };

        Config {
            codegen: CodegenConfig {
                endpoint: var("CODEGEN_URL"),
                api_key: env("CODEGEN_API_KEY", ""),
                max_attempts: parse_or(var("CODEGEN_MAX_ATTEMPTS"), 3),
                backoff_ms: parse_or(var("CODEGEN_BACKOFF_MS"), 500),
                timeout_secs: parse_or(var("CODEGEN_TIMEOUT_SECS"), 60),
            },
            broker: BrokerConfig {
                trading_url: env("BROKER_TRADING_URL", "https://paper-api.alpaca.markets"),
                data_url: env("BROKER_DATA_URL", "https://data.alpaca.markets"),
                api_key: env("BROKER_API_KEY", ""),
                api_secret: env("BROKER_API_SECRET", ""),
            },
            data_dir: PathBuf::from(env("DATA_DIR", "data")),
            initial_capital: parse_or(var("INITIAL_CAPITAL"), 10_000.0),
            interval: var("INTERVAL")
                .and_then(|s| Interval::from_str_loose(&s))
                .unwrap_or_default(),
            backtest_days: parse_or(var("BACKTEST_DAYS"), 180),
            sandbox: ResourceLimits {
                memory_mb: parse_or(var("SANDBOX_MEMORY_MB"), limits.memory_mb),
                cpu_seconds: parse_or(var("SANDBOX_CPU_SECONDS"), limits.cpu_seconds),
                cpu_nice: parse_or(var("SANDBOX_CPU_NICE"), limits.cpu_nice),
                wall_clock_ms: parse_or(var("SANDBOX_TIMEOUT_MS"), limits.wall_clock_ms),
                max_file_mb: parse_or(var("SANDBOX_MAX_FILE_MB"), limits.max_file_mb),
                max_concurrent: parse_or(var("SANDBOX_MAX_CONCURRENT"), limits.max_concurrent),
                network,
                max_bars: parse_or(var("SANDBOX_MAX_BARS"), limits.max_bars),
                max_source_bytes: parse_or(var("SANDBOX_MAX_SOURCE_BYTES"), limits.max_source_bytes),
                eval_step_budget: parse_or(var("SANDBOX_STEP_BUDGET"), limits.eval_step_budget),
            },
            worker_path: var("SANDBOX_WORKER").map(PathBuf::from),
            isolation: var("SANDBOX_ISOLATION").and_then(|s| Isolation::from_str_loose(&s)),
            analysis: AnalysisPolicy {
                min_trades: parse_or(var("MIN_TRADES"), policy.min_trades),
                min_win_rate: parse_or(var("MIN_WIN_RATE"), policy.min_win_rate),
                min_sharpe: parse_or(var("MIN_SHARPE"), policy.min_sharpe),
                min_total_return: parse_or(var("MIN_TOTAL_RETURN"), policy.min_total_return),
            },
            max_iterations: parse_or(var("MAX_ITERATIONS"), 5),
            widen_factor: parse_or(var("WIDEN_FACTOR"), 0.5),
            max_lookback_days: parse_or(var("MAX_LOOKBACK_DAYS"), 3650),
            heartbeat_secs: parse_or(var("HEARTBEAT_SECS"), 30),
            retention_secs: parse_or(var("SESSION_RETENTION_SECS"), 3600),
            log_level: env("LOG_LEVEL", "info"),
        }
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}
