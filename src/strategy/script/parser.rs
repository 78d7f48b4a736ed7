//! Recursive descent parser for strategy source.
//!
//! Errors carry the byte offset of the offending input so they can be
//! rendered with `ValidationError::display_with_context`.

use super::ast::{BinOp, Expr, Rule, RuleKind, Script, StrategyBlock, UnaryOp, UseStmt};
use crate::error::ValidationError;

const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

fn syntax(message: impl Into<String>, position: usize) -> ValidationError {
    ValidationError::Syntax {
        message: message.into(),
        position,
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    /// Skips whitespace and `//` or `#` line comments.
    fn skip_trivia(&mut self) {
        loop {
            while let Some(ch) = self.peek() {
                if ch.is_whitespace() {
                    self.advance();
                } else {
                    break;
                }
            }
            let rest = self.remaining();
            if rest.starts_with("//") || rest.starts_with('#') {
                match rest.find('\n') {
                    Some(i) => self.pos += i + 1,
                    None => self.pos = self.input.len(),
                }
            } else {
                break;
            }
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_trivia();
        self.pos >= self.input.len()
    }

    fn found(&self) -> String {
        let word = self.peek_word();
        if !word.is_empty() {
            return word.to_string();
        }
        self.peek()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "end of input".to_string())
    }

    fn peek_word(&self) -> &'a str {
        let rest = self.remaining();
        let end = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
        &rest[..end]
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ValidationError> {
        self.skip_trivia();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            _ => Err(syntax(
                format!("expected '{}', found '{}'", expected, self.found()),
                self.pos,
            )),
        }
    }

    fn consume_str(&mut self, s: &str) -> bool {
        self.skip_trivia();
        if self.remaining().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn peek_keyword(&mut self, keyword: &str) -> bool {
        self.skip_trivia();
        self.peek_word() == keyword
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ValidationError> {
        if self.consume_keyword(keyword) {
            Ok(())
        } else {
            Err(syntax(
                format!("expected '{}', found '{}'", keyword, self.found()),
                self.pos,
            ))
        }
    }

    fn parse_ident(&mut self) -> Result<String, ValidationError> {
        self.skip_trivia();
        let word = self.peek_word();
        match word.chars().next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.pos += word.len();
                Ok(word.to_string())
            }
            _ => Err(syntax(
                format!("expected identifier, found '{}'", self.found()),
                self.pos,
            )),
        }
    }

    fn parse_number(&mut self) -> Result<f64, ValidationError> {
        self.skip_trivia();
        let start = self.pos;
        let mut has_dot = false;
        let mut digits = 0;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        if digits == 0 {
            return Err(syntax("expected number", start));
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map_err(|_| syntax(format!("invalid number: {}", text), start))
    }

    fn parse_integer(&mut self) -> Result<usize, ValidationError> {
        self.skip_trivia();
        let start = self.pos;
        let n = self.parse_number()?;
        if n.fract() != 0.0 || n < 1.0 {
            return Err(syntax("expected a positive whole number", start));
        }
        Ok(n as usize)
    }

    fn parse_string(&mut self) -> Result<String, ValidationError> {
        let start = self.pos;
        self.expect_char('"')?;
        let mut out = String::new();
        loop {
            match self.advance() {
                Some('"') => return Ok(out),
                Some('\\') => match self.advance() {
                    Some('n') => out.push('\n'),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(syntax("unterminated string", start))
    }

    fn parse_script(&mut self) -> Result<Script, ValidationError> {
        let mut uses = Vec::new();
        let mut strategies = Vec::new();
        while !self.at_end() {
            if self.peek_keyword("use") {
                uses.push(self.parse_use()?);
            } else if self.peek_keyword("strategy") {
                strategies.push(self.parse_strategy()?);
            } else {
                return Err(syntax(
                    format!("expected 'use' or 'strategy', found '{}'", self.found()),
                    self.pos,
                ));
            }
        }
        Ok(Script { uses, strategies })
    }

    fn parse_use(&mut self) -> Result<UseStmt, ValidationError> {
        self.expect_keyword("use")?;
        self.skip_trivia();
        let position = self.pos;
        let capability = self.parse_ident()?;
        self.expect_char(';')?;
        Ok(UseStmt {
            capability,
            position,
        })
    }

    fn parse_strategy(&mut self) -> Result<StrategyBlock, ValidationError> {
        self.skip_trivia();
        let position = self.pos;
        self.expect_keyword("strategy")?;
        let name = self.parse_ident()?;
        self.expect_char('{')?;

        let mut rules = Vec::new();
        let mut rebalance_every = None;
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                self.advance();
                break;
            }
            if self.at_end() {
                return Err(syntax("unclosed strategy block", self.pos));
            }
            if self.peek_keyword("rebalance") {
                let at = self.pos;
                self.expect_keyword("rebalance")?;
                self.expect_keyword("every")?;
                let n = self.parse_integer()?;
                self.expect_char(';')?;
                if rebalance_every.replace(n).is_some() {
                    return Err(syntax("rebalance cadence declared twice", at));
                }
                continue;
            }
            rules.push(self.parse_rule()?);
        }

        Ok(StrategyBlock {
            name,
            rules,
            rebalance_every,
            position,
        })
    }

    fn parse_rule(&mut self) -> Result<Rule, ValidationError> {
        self.skip_trivia();
        let position = self.pos;
        let kind = if self.consume_keyword("entry") {
            RuleKind::Entry
        } else if self.consume_keyword("exit") {
            RuleKind::Exit
        } else {
            return Err(syntax(
                format!(
                    "expected 'entry', 'exit' or 'rebalance', found '{}'",
                    self.found()
                ),
                position,
            ));
        };
        let name = self.parse_ident()?;
        self.expect_char(':')?;
        let expr = self.parse_expr()?;
        self.expect_char(';')?;
        Ok(Rule {
            kind,
            name,
            expr,
            position,
        })
    }

    /// Runs `f` one nesting level deeper, failing past `MAX_DEPTH`.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ValidationError>,
    ) -> Result<T, ValidationError> {
        if self.depth >= MAX_DEPTH {
            return Err(syntax("expression nested too deeply", self.pos));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn parse_expr(&mut self) -> Result<Expr, ValidationError> {
        self.nested(|p| p.parse_or())
    }

    fn parse_or(&mut self) -> Result<Expr, ValidationError> {
        let mut lhs = self.parse_and()?;
        while self.consume_keyword("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ValidationError> {
        let mut lhs = self.parse_not()?;
        while self.consume_keyword("and") {
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ValidationError> {
        if self.consume_keyword("not") {
            let inner = self.nested(|p| p.parse_not())?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ValidationError> {
        let lhs = self.parse_additive()?;
        // two-char operators first
        let op = if self.consume_str("<=") {
            BinOp::Le
        } else if self.consume_str(">=") {
            BinOp::Ge
        } else if self.consume_str("==") {
            BinOp::Eq
        } else if self.consume_str("!=") {
            BinOp::Ne
        } else if self.consume_str("<") {
            BinOp::Lt
        } else if self.consume_str(">") {
            BinOp::Gt
        } else {
            return Ok(lhs);
        };
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ValidationError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = if self.consume_str("+") {
                BinOp::Add
            } else if self.consume_str("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ValidationError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.consume_str("*") {
                BinOp::Mul
            } else if self.consume_str("/") {
                BinOp::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ValidationError> {
        if self.consume_str("-") {
            let inner = self.nested(|p| p.parse_unary())?;
            return Ok(match inner {
                Expr::Number(n) => Expr::Number(-n),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ValidationError> {
        self.skip_trivia();
        let start = self.pos;
        match self.peek() {
            Some('(') => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_char(')')?;
                Ok(inner)
            }
            Some('$') => {
                self.advance();
                Ok(Expr::Param(self.parse_ident()?))
            }
            Some('"') => Ok(Expr::Str(self.parse_string()?)),
            Some(c) if c.is_ascii_digit() || c == '.' => Ok(Expr::Number(self.parse_number()?)),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let name = self.parse_ident()?;
                match name.as_str() {
                    "true" => return Ok(Expr::Bool(true)),
                    "false" => return Ok(Expr::Bool(false)),
                    "and" | "or" | "not" | "entry" | "exit" | "strategy" | "use" => {
                        return Err(syntax(
                            format!("expected expression, found keyword '{}'", name),
                            start,
                        ))
                    }
                    _ => {}
                }
                self.skip_trivia();
                if self.peek() == Some('(') {
                    self.advance();
                    let args = self.parse_args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            _ => Err(syntax(
                format!("expected expression, found '{}'", self.found()),
                start,
            )),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ValidationError> {
        let mut args = Vec::new();
        self.skip_trivia();
        if self.peek() == Some(')') {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            self.skip_trivia();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(')') => {
                    self.advance();
                    return Ok(args);
                }
                _ => {
                    return Err(syntax(
                        format!("expected ',' or ')', found '{}'", self.found()),
                        self.pos,
                    ))
                }
            }
        }
    }
}

/// Parse strategy source into a syntax tree. No semantic checks.
pub fn parse(input: &str) -> Result<Script, ValidationError> {
    Parser::new(input).parse_script()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_expr(src: &str) -> Expr {
        let script = parse(&format!("strategy T {{ entry e: {}; }}", src)).unwrap();
        script.strategies[0].rules[0].expr.clone()
    }

    #[test]
    fn parses_full_script() {
        let src = r#"
            use data;
            use math;

            // mean reversion
            strategy RsiReversion {
                entry oversold: rsi < $rsi_threshold;
                exit overbought: rsi > $rsi_exit;
                exit stop: pnl_pct <= -1.0;   # hard stop
            }
        "#;
        let script = parse(src).unwrap();
        assert_eq!(script.uses.len(), 2);
        assert_eq!(script.uses[1].capability, "math");
        let block = &script.strategies[0];
        assert_eq!(block.name, "RsiReversion");
        assert_eq!(block.entries().count(), 1);
        assert_eq!(block.exits().count(), 2);
        assert_eq!(
            block.rules[2].expr,
            Expr::Binary(
                BinOp::Le,
                Box::new(Expr::Ident("pnl_pct".into())),
                Box::new(Expr::Number(-1.0))
            )
        );
    }

    #[test]
    fn precedence_binds_arithmetic_tighter_than_logic() {
        let e = rule_expr("close > sma + 2 * sd and not volume < 10");
        assert_eq!(
            e.to_string(),
            "((close > (sma + (2 * sd))) and not (volume < 10))"
        );
    }

    #[test]
    fn calls_and_strings() {
        let e = rule_expr(r#"max(prev(close), 3) > 1 or fail("boom")"#);
        match e {
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Binary(BinOp::Gt, _, _)));
                assert_eq!(*rhs, Expr::Call("fail".into(), vec![Expr::Str("boom".into())]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rebalance_cadence() {
        let script =
            parse("strategy P { entry any: true; rebalance every 5; }").unwrap();
        assert_eq!(script.strategies[0].rebalance_every, Some(5));
        assert!(parse("strategy P { rebalance every 0; }").is_err());
        assert!(parse("strategy P { rebalance every 2; rebalance every 3; }").is_err());
    }

    #[test]
    fn multiple_blocks_parse() {
        let script = parse("strategy A { } strategy B { }").unwrap();
        assert_eq!(script.strategies.len(), 2);
    }

    #[test]
    fn syntax_error_reports_position() {
        let src = "strategy A { entry e: rsi < ; }";
        match parse(src).unwrap_err() {
            ValidationError::Syntax { position, message } => {
                assert_eq!(position, src.find(';').unwrap());
                assert!(message.contains("expected expression"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse("import os").is_err());
        assert!(parse("strategy A { entry e: 1 +; }").is_err());
        assert!(parse("strategy A { entry e: (1;").is_err());
        assert!(parse("strategy A { entry e: fail(\"x); }").is_err());
        assert!(parse("strategy A {").is_err());
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let src = format!("strategy A {{ entry e: {}1{}; }}", "(".repeat(200), ")".repeat(200));
        assert!(parse(&src).is_err());
        let src = format!("strategy A {{ entry e: {}true; }}", "not ".repeat(5000));
        assert!(parse(&src).is_err());
        let src = format!("strategy A {{ entry e: {}1 > 0; }}", "- ".repeat(5000));
        assert!(parse(&src).is_err());
    }
}
