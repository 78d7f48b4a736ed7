pub mod backtesting;
pub mod broker;
pub mod config;
pub mod error;
pub mod models;
pub mod progress;
pub mod refinement;
pub mod sandbox;
pub mod session;
pub mod strategy;
#[cfg(test)]
pub mod test_helpers;
