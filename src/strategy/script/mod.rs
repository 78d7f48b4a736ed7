//! The strategy source language: parsing, validation, binding and evaluation.

pub mod ast;
pub mod bind;
pub mod eval;
pub mod parser;
pub mod validate;

pub use bind::{bind, BarField, CompiledRule, CompiledScript, Node, Source, StateVar};
pub use eval::{eval_rule, Budget, Env, Value};
pub use parser::parse;
pub use validate::{validate_source, ALLOWED_CAPABILITIES};

use crate::error::ValidationError;
use crate::models::StrategyConfig;

/// Validate `source` and bind it to `config` in one step.
pub fn compile(source: &str, config: &StrategyConfig) -> Result<CompiledScript, ValidationError> {
    let script = validate_source(source)?;
    bind(&script, config)
}
