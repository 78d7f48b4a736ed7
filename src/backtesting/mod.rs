pub mod report;
pub mod runner;

pub use report::{BacktestResult, EquityPoint, Metrics, RoundTrip};
pub use runner::BacktestHarness;
