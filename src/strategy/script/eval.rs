use super::ast::{BinOp, UnaryOp};
use super::bind::{CompiledRule, Node, Source};
use crate::error::StrategyError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
    /// Not available yet (indicator warm-up, no position, first bar).
    Missing,
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Num(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
            Value::Missing => "missing",
        }
    }
}

/// Lookups the evaluator needs from the running strategy.
pub trait Env {
    fn load(&self, source: &Source) -> Value;
    fn prev(&self, source: &Source) -> Value;
}

/// Caps the number of nodes evaluated over a whole run.
#[derive(Debug, Clone)]
pub struct Budget {
    limit: u64,
    used: u64,
}

impl Budget {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    fn tick(&mut self) -> Result<(), StrategyError> {
        if self.used >= self.limit {
            return Err(StrategyError::BudgetExhausted { budget: self.limit });
        }
        self.used += 1;
        Ok(())
    }
}

struct Evaluator<'a, E: Env + ?Sized> {
    env: &'a E,
    budget: &'a mut Budget,
    rule: &'a str,
}

impl<'a, E: Env + ?Sized> Evaluator<'a, E> {
    fn mismatch(&self, message: String) -> StrategyError {
        StrategyError::TypeMismatch {
            rule: self.rule.to_string(),
            message,
        }
    }

    fn number(&mut self, node: &Node, ctx: &str) -> Result<Option<f64>, StrategyError> {
        match self.eval(node)? {
            Value::Num(n) => Ok(Some(n)),
            Value::Missing => Ok(None),
            other => Err(self.mismatch(format!("{} expects a number, got {}", ctx, other.type_name()))),
        }
    }

    /// `None` means missing; missing counts as false in logic.
    fn truth(&mut self, node: &Node, ctx: &str) -> Result<Option<bool>, StrategyError> {
        match self.eval(node)? {
            Value::Bool(b) => Ok(Some(b)),
            Value::Missing => Ok(None),
            other => Err(self.mismatch(format!("{} expects a boolean, got {}", ctx, other.type_name()))),
        }
    }

    fn eval(&mut self, node: &Node) -> Result<Value, StrategyError> {
        self.budget.tick()?;
        match node {
            Node::Const(v) => Ok(v.clone()),
            Node::Load(src) => Ok(self.env.load(src)),
            Node::Prev(src) => Ok(self.env.prev(src)),
            Node::Fail(msg) => Err(StrategyError::Raised {
                rule: self.rule.to_string(),
                message: msg.clone(),
            }),
            Node::Unary(UnaryOp::Neg, inner) => {
                Ok(self.number(inner, "-")?.map_or(Value::Missing, |n| Value::Num(-n)))
            }
            Node::Unary(UnaryOp::Not, inner) => {
                Ok(self.truth(inner, "not")?.map_or(Value::Missing, |b| Value::Bool(!b)))
            }
            Node::Abs(inner) => {
                Ok(self.number(inner, "abs()")?.map_or(Value::Missing, |n| Value::Num(n.abs())))
            }
            Node::Min(a, b) | Node::Max(a, b) => {
                let is_min = matches!(node, Node::Min(..));
                let ctx = if is_min { "min()" } else { "max()" };
                let x = self.number(a, ctx)?;
                let y = self.number(b, ctx)?;
                Ok(match (x, y) {
                    (Some(x), Some(y)) => Value::Num(if is_min { x.min(y) } else { x.max(y) }),
                    _ => Value::Missing,
                })
            }
            Node::Binary(op, l, r) => self.binary(*op, l, r),
        }
    }

    fn binary(&mut self, op: BinOp, l: &Node, r: &Node) -> Result<Value, StrategyError> {
        match op {
            BinOp::And => {
                if self.truth(l, "and")? != Some(true) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.truth(r, "and")? == Some(true)))
            }
            BinOp::Or => {
                if self.truth(l, "or")? == Some(true) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.truth(r, "or")? == Some(true)))
            }
            BinOp::Eq | BinOp::Ne => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let equal = match (&lv, &rv) {
                    (Value::Missing, _) | (_, Value::Missing) => return Ok(Value::Bool(false)),
                    (Value::Num(a), Value::Num(b)) => a == b,
                    (Value::Bool(a), Value::Bool(b)) => a == b,
                    (Value::Str(a), Value::Str(b)) => a == b,
                    _ => {
                        return Err(self.mismatch(format!(
                            "cannot compare {} with {}",
                            lv.type_name(),
                            rv.type_name()
                        )))
                    }
                };
                Ok(Value::Bool(if op == BinOp::Eq { equal } else { !equal }))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let a = self.number(l, op.symbol())?;
                let b = self.number(r, op.symbol())?;
                let (a, b) = match (a, b) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Ok(Value::Bool(false)),
                };
                Ok(Value::Bool(match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    _ => a >= b,
                }))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                let a = self.number(l, op.symbol())?;
                let b = self.number(r, op.symbol())?;
                let (a, b) = match (a, b) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Ok(Value::Missing),
                };
                Ok(Value::Num(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    _ => {
                        if b == 0.0 {
                            return Err(StrategyError::DivisionByZero {
                                rule: self.rule.to_string(),
                            });
                        }
                        a / b
                    }
                }))
            }
        }
    }
}

pub fn eval_node<E: Env + ?Sized>(
    node: &Node,
    env: &E,
    budget: &mut Budget,
    rule: &str,
) -> Result<Value, StrategyError> {
    Evaluator { env, budget, rule }.eval(node)
}

/// Whether a rule fires. Missing results never fire; non-boolean results
/// are a runtime error.
pub fn eval_rule<E: Env + ?Sized>(
    rule: &CompiledRule,
    env: &E,
    budget: &mut Budget,
) -> Result<bool, StrategyError> {
    match eval_node(&rule.node, env, budget, &rule.name)? {
        Value::Bool(b) => Ok(b),
        Value::Missing => Ok(false),
        other => Err(StrategyError::TypeMismatch {
            rule: rule.name.clone(),
            message: format!("rule must be a condition, got {}", other.type_name()),
        }),
    }
}
