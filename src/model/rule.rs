//! Administrator consistency rules and their recorded violations

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Meta, NameLookup};
use crate::error::{Result, UdbError};

/// How a rule participates in commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Evaluated out-of-band only; violations are advisory
    Soft,
    /// Also evaluated inline before commit; a violation involving a touched
    /// entity aborts the transaction
    Enforced,
}

impl Severity {
    pub fn as_i64(self) -> i64 {
        match self {
            Severity::Soft => 0,
            Severity::Enforced => 1,
        }
    }

    pub fn from_i64(value: i64) -> Result<Severity> {
        match value {
            0 => Ok(Severity::Soft),
            1 => Ok(Severity::Enforced),
            other => Err(UdbError::Fatal(format!("invalid severity value {other}"))),
        }
    }
}

/// An administrator-supplied consistency rule: a restricted SELECT over one
/// model returning `(id, label)` rows, one per violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    pub model_name: String,
    pub statement: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    /// Seeded by the application rather than an administrator
    #[serde(default)]
    pub builtin: bool,
    /// Form field the violation points at, when one applies
    pub field: Option<String>,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        model_name: impl Into<String>,
        statement: impl Into<String>,
    ) -> Self {
        Self {
            meta: Meta::default(),
            name: name.into(),
            model_name: model_name.into(),
            statement: statement.into(),
            description: String::new(),
            severity: Severity::Soft,
            builtin: false,
            field: None,
        }
    }

    pub fn summary(&self) -> String {
        self.name.clone()
    }

    /// Local shape checks; the statement itself is validated against the live
    /// schema by the rule engine before any persist.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(UdbError::validation("name", "rule name cannot be empty"));
        }
        if self.model_name.trim().is_empty() {
            return Err(UdbError::validation("model_name", "a target model is required"));
        }
        if self.statement.trim().is_empty() {
            return Err(UdbError::validation("statement", "an SQL statement is required"));
        }
        Ok(())
    }

    pub fn audit_fields(&self, _names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("name".into(), Value::String(self.name.clone()));
        fields.insert("model_name".into(), Value::String(self.model_name.clone()));
        fields.insert("statement".into(), Value::String(self.statement.clone()));
        fields.insert("description".into(), Value::String(self.description.clone()));
        fields.insert("severity".into(), Value::from(self.severity.as_i64()));
        fields.insert("builtin".into(), Value::Bool(self.builtin));
        fields
    }
}

/// A persisted rule violation. `first_seen` is kept across re-runs;
/// `last_seen` is bumped while the row keeps offending and the row is removed
/// on the next clean run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleViolation {
    pub id: Option<i64>,
    pub rule_id: i64,
    pub model_name: String,
    pub model_id: i64,
    pub label: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_round_trip() {
        assert_eq!(Severity::from_i64(0).unwrap(), Severity::Soft);
        assert_eq!(Severity::from_i64(1).unwrap(), Severity::Enforced);
        assert!(Severity::from_i64(2).is_err());
    }

    #[test]
    fn test_rule_local_validation() {
        let rule = Rule::new("dup-ip", "dhcprecord", "SELECT id, ip FROM dhcprecord");
        assert!(rule.validate().is_ok());

        assert!(Rule::new("", "dhcprecord", "SELECT 1").validate().is_err());
        assert!(Rule::new("x", "", "SELECT 1").validate().is_err());
        assert!(Rule::new("x", "dhcprecord", "  ").validate().is_err());
    }
}
