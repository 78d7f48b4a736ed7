//! Error taxonomy shared across the pipeline.
//!
//! Validation, sandbox timeout/resource and strategy runtime failures are
//! recoverable inside the refinement loop. Generation failures are terminal.
//! Broker failures only come from the live adapter.

use serde::{Deserialize, Serialize};

/// Generated code or config rejected before anything runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("expected exactly one strategy block, found {found}")]
    StrategyCount { found: usize },

    #[error("capability '{capability}' is not allowed in strategy code")]
    DisallowedCapability { capability: String },

    #[error("unknown reference '{name}' in rule '{rule}'")]
    UnknownReference { name: String, rule: String },

    #[error("strategy declares no entry rules")]
    NoEntryRules,

    #[error("invalid strategy config: {reason}")]
    Config { reason: String },
}

impl ValidationError {
    /// Render with a caret under the offending position.
    pub fn display_with_context(&self, input: &str) -> String {
        match self {
            ValidationError::Syntax { position, .. } => {
                let line_start = input[..(*position).min(input.len())]
                    .rfind('\n')
                    .map(|i| i + 1)
                    .unwrap_or(0);
                let line_end = input[line_start..]
                    .find('\n')
                    .map(|i| line_start + i)
                    .unwrap_or(input.len());
                let caret = " ".repeat(position.saturating_sub(line_start)) + "^";
                format!("{}\n{}\n{}", &input[line_start..line_end], caret, self)
            }
            _ => self.to_string(),
        }
    }
}

/// Raised by a strategy while it runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyError {
    #[error("strategy raised in rule '{rule}': {message}")]
    Raised { rule: String, message: String },

    #[error("division by zero in rule '{rule}'")]
    DivisionByZero { rule: String },

    #[error("type mismatch in rule '{rule}': {message}")]
    TypeMismatch { rule: String, message: String },

    #[error("evaluation budget of {budget} steps exhausted")]
    BudgetExhausted { budget: u64 },

    #[error("strategy used before initialize()")]
    NotInitialized,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("brokerage transport error: {reason}")]
    Transport { reason: String },

    #[error("brokerage returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode brokerage response: {reason}")]
    Decode { reason: String },

    #[error("no price available for {symbol}")]
    NoPrice { symbol: String },

    #[error("invalid order: {reason}")]
    InvalidOrder { reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationError {
    /// Worth retrying (timeouts, 5xx, 429).
    #[error("code generation temporarily unavailable: {reason}")]
    Transient { reason: String },

    #[error("code generation rejected the request: {reason}")]
    Rejected { reason: String },

    #[error("code generation returned an unusable response: {reason}")]
    InvalidResponse { reason: String },

    #[error("code generation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Transient { .. })
    }
}

/// Why a sandboxed execution produced no result.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("validation failed: {0}")]
    Validation(ValidationError),

    #[error("sandbox timed out after {limit_ms} ms")]
    SandboxTimeout { limit_ms: u64 },

    #[error("sandbox resource limit exceeded: {reason}")]
    SandboxResource { reason: String },

    #[error("strategy failed at runtime: {0}")]
    Runtime(StrategyError),

    #[error("market data unavailable: {reason}")]
    Data { reason: String },

    #[error("sandbox internal failure: {reason}")]
    Internal { reason: String },
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Validation(_) => "validation",
            ExecutionError::SandboxTimeout { .. } => "sandbox_timeout",
            ExecutionError::SandboxResource { .. } => "sandbox_resource",
            ExecutionError::Runtime(_) => "runtime",
            ExecutionError::Data { .. } => "data",
            ExecutionError::Internal { .. } => "internal",
        }
    }
}

impl From<ValidationError> for ExecutionError {
    fn from(e: ValidationError) -> Self {
        ExecutionError::Validation(e)
    }
}

impl From<StrategyError> for ExecutionError {
    fn from(e: StrategyError) -> Self {
        match e {
            StrategyError::BudgetExhausted { budget } => ExecutionError::SandboxResource {
                reason: format!("evaluation budget of {} steps exhausted", budget),
            },
            other => ExecutionError::Runtime(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {id}")]
    NotFound { id: String },

    #[error("session {id} has no run yet")]
    NotStarted { id: String },

    #[error("session {id} is still running")]
    Running { id: String },

    #[error("session {id} aborted: {reason}")]
    Aborted { id: String, reason: String },
}
