// Service configuration validation
// Collects every failed rule instead of stopping at the first one

use std::fmt;
use thiserror::Error;

/// One failed validation rule.
///
/// The message describes the rule, never the offending value, so a violation on a
/// secret field is safe to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.field, self.rule, self.message)
    }
}

/// Aggregated validation failure, in the order the rules were checked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "configuration validation failed with {} violation(s){}",
    .violations.len(),
    format_violations(.violations)
)]
pub struct ValidationError {
    violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations.iter().map(|v| format!("; {v}")).collect()
}

/// Collector handed to a service's validation routine.
#[derive(Debug, Default)]
pub struct Violations {
    items: Vec<FieldViolation>,
}

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> &mut Self {
        self.items.push(FieldViolation {
            field: field.into(),
            rule: rule.into(),
            message: message.into(),
        });
        self
    }

    /// Records a violation when `ok` is false.
    pub fn check(
        &mut self,
        ok: bool,
        field: &str,
        rule: &str,
        message: impl Into<String>,
    ) -> &mut Self {
        if !ok {
            self.push(field, rule, message);
        }
        self
    }

    pub fn require_non_empty(&mut self, field: &str, value: &str) -> &mut Self {
        self.check(
            !value.trim().is_empty(),
            field,
            "required",
            format!("{field} is empty"),
        )
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.items.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                violations: self.items,
            })
        }
    }
}

/// Runs a validation routine against `config` and aggregates everything it reports.
pub fn validate<C, F>(config: &C, rules: F) -> Result<(), ValidationError>
where
    F: FnOnce(&C, &mut Violations),
{
    let mut violations = Violations::new();
    rules(config, &mut violations);
    violations.into_result()
}
