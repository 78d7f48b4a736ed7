use std::collections::BTreeSet;

use super::ast::Script;
use super::parser::parse;
use crate::error::ValidationError;

/// Capabilities strategy code may declare. Everything else (`fs`, `net`,
/// `process`, `env`, `time`, unknown names) is refused before anything runs.
pub const ALLOWED_CAPABILITIES: &[&str] = &["data", "math"];

/// Parse and structurally check strategy source: it parses, uses only allowed
/// capabilities, defines exactly one strategy block with at least one entry
/// rule and unique rule names.
pub fn validate_source(source: &str) -> Result<Script, ValidationError> {
    let script = parse(source)?;

    for stmt in &script.uses {
        if !ALLOWED_CAPABILITIES.contains(&stmt.capability.as_str()) {
            return Err(ValidationError::DisallowedCapability {
                capability: stmt.capability.clone(),
            });
        }
    }

    if script.strategies.len() != 1 {
        return Err(ValidationError::StrategyCount {
            found: script.strategies.len(),
        });
    }

    let block = &script.strategies[0];
    if block.entries().next().is_none() {
        return Err(ValidationError::NoEntryRules);
    }

    let mut names = BTreeSet::new();
    for rule in &block.rules {
        if !names.insert(rule.name.as_str()) {
            return Err(ValidationError::Syntax {
                message: format!("rule '{}' defined twice", rule.name),
                position: rule.position,
            });
        }
    }

    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "use data;\nstrategy S { entry e: close > 1; exit x: close < 1; }";

    #[test]
    fn accepts_well_formed_source() {
        let script = validate_source(GOOD).unwrap();
        assert_eq!(script.strategies[0].name, "S");
    }

    #[test]
    fn rejects_disallowed_capabilities() {
        for cap in ["fs", "net", "process", "env", "time", "sockets"] {
            let src = format!("use {};\nstrategy S {{ entry e: true; }}", cap);
            assert_eq!(
                validate_source(&src).unwrap_err(),
                ValidationError::DisallowedCapability {
                    capability: cap.to_string()
                }
            );
        }
    }

    #[test]
    fn requires_exactly_one_strategy_block() {
        assert_eq!(
            validate_source("use data;").unwrap_err(),
            ValidationError::StrategyCount { found: 0 }
        );
        assert_eq!(
            validate_source("strategy A { entry e: true; } strategy B { entry e: true; }")
                .unwrap_err(),
            ValidationError::StrategyCount { found: 2 }
        );
    }

    #[test]
    fn requires_an_entry_rule() {
        assert_eq!(
            validate_source("strategy A { exit x: true; }").unwrap_err(),
            ValidationError::NoEntryRules
        );
    }

    #[test]
    fn duplicate_rule_names_are_rejected() {
        let err = validate_source("strategy A { entry e: true; exit e: false; }").unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn syntax_errors_surface_as_validation_errors() {
        assert!(matches!(
            validate_source("strategy A { entry e: ; }").unwrap_err(),
            ValidationError::Syntax { .. }
        ));
    }
}
