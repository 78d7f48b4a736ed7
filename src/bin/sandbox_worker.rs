//! Isolated strategy runner. One JSON request on stdin, one JSON response on
//! stdout, logs on stderr.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use strategy_forge::sandbox::worker;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    // single thread keeps the address space small under the memory ceiling
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(worker::serve(tokio::io::stdin(), tokio::io::stdout()))?;
    drop(runtime);
    std::process::exit(code);
}
