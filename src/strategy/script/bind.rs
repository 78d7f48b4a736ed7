//! Resolve a parsed script against a `StrategyConfig`.
//!
//! Parameters become constants, identifiers become typed lookups and every
//! function call is arity-checked. After binding, evaluation cannot hit an
//! unknown name.

use super::ast::{BinOp, Expr, Rule, RuleKind, Script, UnaryOp};
use super::eval::Value;
use crate::error::ValidationError;
use crate::models::StrategyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl BarField {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "open" => Some(BarField::Open),
            "high" => Some(BarField::High),
            "low" => Some(BarField::Low),
            "close" => Some(BarField::Close),
            "volume" => Some(BarField::Volume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateVar {
    /// Quantity held; 0 when flat.
    Position,
    EntryPrice,
    PnlPct,
    Cash,
    BarIndex,
}

impl StateVar {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "position" => Some(StateVar::Position),
            "entry_price" => Some(StateVar::EntryPrice),
            "pnl_pct" => Some(StateVar::PnlPct),
            "cash" => Some(StateVar::Cash),
            "bar_index" => Some(StateVar::BarIndex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Indicator(String),
    Field(BarField),
    State(StateVar),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Const(Value),
    Load(Source),
    /// Value as of the previous bar; only indicators and bar fields.
    Prev(Source),
    Unary(UnaryOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Abs(Box<Node>),
    Min(Box<Node>, Box<Node>),
    Max(Box<Node>, Box<Node>),
    Fail(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub name: String,
    pub kind: RuleKind,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledScript {
    pub name: String,
    pub entries: Vec<CompiledRule>,
    pub exits: Vec<CompiledRule>,
    pub rebalance_every: Option<usize>,
}

struct Binder<'a> {
    config: &'a StrategyConfig,
    rule: &'a Rule,
}

impl<'a> Binder<'a> {
    fn unknown(&self, name: impl Into<String>) -> ValidationError {
        ValidationError::UnknownReference {
            name: name.into(),
            rule: self.rule.name.clone(),
        }
    }

    fn misuse(&self, message: String) -> ValidationError {
        ValidationError::Syntax {
            message: format!("in rule '{}': {}", self.rule.name, message),
            position: self.rule.position,
        }
    }

    fn source(&self, name: &str) -> Result<Source, ValidationError> {
        if self.config.indicator(name).is_some() {
            return Ok(Source::Indicator(name.to_string()));
        }
        if let Some(field) = BarField::from_name(name) {
            return Ok(Source::Field(field));
        }
        if let Some(var) = StateVar::from_name(name) {
            return Ok(Source::State(var));
        }
        Err(self.unknown(name))
    }

    fn bind(&self, expr: &Expr) -> Result<Node, ValidationError> {
        Ok(match expr {
            Expr::Number(n) => Node::Const(Value::Num(*n)),
            Expr::Bool(b) => Node::Const(Value::Bool(*b)),
            Expr::Str(s) => Node::Const(Value::Str(s.clone())),
            Expr::Param(p) => match self.config.param(p) {
                Some(v) => Node::Const(Value::Num(v)),
                None => return Err(self.unknown(format!("${}", p))),
            },
            Expr::Ident(name) => Node::Load(self.source(name)?),
            Expr::Unary(op, inner) => Node::Unary(*op, Box::new(self.bind(inner)?)),
            Expr::Binary(op, l, r) => {
                Node::Binary(*op, Box::new(self.bind(l)?), Box::new(self.bind(r)?))
            }
            Expr::Call(func, args) => self.bind_call(func, args)?,
        })
    }

    fn arity(&self, func: &str, args: &[Expr], n: usize) -> Result<(), ValidationError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(self.misuse(format!(
                "{}() takes {} argument(s), got {}",
                func,
                n,
                args.len()
            )))
        }
    }

    fn bind_call(&self, func: &str, args: &[Expr]) -> Result<Node, ValidationError> {
        match func {
            "abs" => {
                self.arity(func, args, 1)?;
                Ok(Node::Abs(Box::new(self.bind(&args[0])?)))
            }
            "min" | "max" => {
                self.arity(func, args, 2)?;
                let a = Box::new(self.bind(&args[0])?);
                let b = Box::new(self.bind(&args[1])?);
                Ok(if func == "min" {
                    Node::Min(a, b)
                } else {
                    Node::Max(a, b)
                })
            }
            "prev" => {
                self.arity(func, args, 1)?;
                match &args[0] {
                    Expr::Ident(name) => match self.source(name)? {
                        Source::State(_) => Err(self.misuse(format!(
                            "prev() needs an indicator or bar field, not '{}'",
                            name
                        ))),
                        src => Ok(Node::Prev(src)),
                    },
                    other => Err(self.misuse(format!(
                        "prev() needs a name, got '{}'",
                        other
                    ))),
                }
            }
            "fail" => {
                self.arity(func, args, 1)?;
                match &args[0] {
                    Expr::Str(msg) => Ok(Node::Fail(msg.clone())),
                    other => Err(self.misuse(format!(
                        "fail() needs a string message, got '{}'",
                        other
                    ))),
                }
            }
            other => Err(self.unknown(format!("{}()", other))),
        }
    }
}

/// Bind a validated script to `config`. The script's rebalance cadence wins
/// over the config's when both are given.
pub fn bind(script: &Script, config: &StrategyConfig) -> Result<CompiledScript, ValidationError> {
    let block = match script.strategies.as_slice() {
        [one] => one,
        many => {
            return Err(ValidationError::StrategyCount { found: many.len() });
        }
    };

    for ind in &config.indicators {
        if BarField::from_name(&ind.name).is_some() || StateVar::from_name(&ind.name).is_some() {
            return Err(ValidationError::Config {
                reason: format!("indicator name '{}' shadows a built-in value", ind.name),
            });
        }
    }

    let mut entries = Vec::new();
    let mut exits = Vec::new();
    for rule in &block.rules {
        let node = Binder { config, rule }.bind(&rule.expr)?;
        let compiled = CompiledRule {
            name: rule.name.clone(),
            kind: rule.kind,
            node,
        };
        match rule.kind {
            RuleKind::Entry => entries.push(compiled),
            RuleKind::Exit => exits.push(compiled),
        }
    }

    Ok(CompiledScript {
        name: block.name.clone(),
        entries,
        exits,
        rebalance_every: block.rebalance_every.or(config.rebalance_every),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::script::validate_source;
    use crate::test_helpers::rsi_config;

    fn bind_src(src: &str) -> Result<CompiledScript, ValidationError> {
        bind(&validate_source(src)?, &rsi_config())
    }

    #[test]
    fn params_become_constants() {
        let compiled = bind_src("strategy S { entry e: rsi < $rsi_threshold; }").unwrap();
        assert_eq!(
            compiled.entries[0].node,
            Node::Binary(
                BinOp::Lt,
                Box::new(Node::Load(Source::Indicator("rsi".into()))),
                Box::new(Node::Const(Value::Num(30.0)))
            )
        );
    }

    #[test]
    fn unknown_identifier_names_the_rule() {
        let err = bind_src("strategy S { entry buy_dip: macd < 0; }").unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownReference {
                name: "macd".into(),
                rule: "buy_dip".into()
            }
        );
    }

    #[test]
    fn unknown_param_and_function() {
        assert!(matches!(
            bind_src("strategy S { entry e: rsi < $nope; }").unwrap_err(),
            ValidationError::UnknownReference { name, .. } if name == "$nope"
        ));
        assert!(matches!(
            bind_src("strategy S { entry e: exec(1); }").unwrap_err(),
            ValidationError::UnknownReference { name, .. } if name == "exec()"
        ));
    }

    #[test]
    fn call_shapes_are_checked() {
        assert!(bind_src("strategy S { entry e: min(1) > 0; }").is_err());
        assert!(bind_src("strategy S { entry e: prev(position) > 0; }").is_err());
        assert!(bind_src("strategy S { entry e: prev(1 + 2) > 0; }").is_err());
        assert!(bind_src("strategy S { entry e: fail(3); }").is_err());
        assert!(bind_src("strategy S { entry e: prev(close) < close and abs(-1) == 1; }").is_ok());
    }

    #[test]
    fn rebalance_cadence_prefers_script() {
        let mut cfg = rsi_config();
        cfg.rebalance_every = Some(10);
        let script = validate_source("strategy S { entry e: true; rebalance every 3; }").unwrap();
        assert_eq!(bind(&script, &cfg).unwrap().rebalance_every, Some(3));
        let script = validate_source("strategy S { entry e: true; }").unwrap();
        assert_eq!(bind(&script, &cfg).unwrap().rebalance_every, Some(10));
    }

    #[test]
    fn indicator_cannot_shadow_builtin() {
        let mut cfg = rsi_config();
        cfg.indicators[0].name = "close".into();
        let script = validate_source("strategy S { entry e: true; }").unwrap();
        assert!(matches!(bind(&script, &cfg), Err(ValidationError::Config { .. })));
    }
}
