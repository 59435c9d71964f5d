//! Rule engine
//!
//! Administrator-supplied predicates over the live store. A rule's statement
//! is a restricted SELECT targeting one model and projecting exactly two
//! columns `(id, label)`; each returned row flags a violation. Soft rules run
//! out-of-band on a scheduler's request; enforced rules additionally run
//! inline before every commit, scoped to the touched entities, and abort the
//! transaction on a hit.

mod builtin;

use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use crate::error::{Result, UdbError};
use crate::model::{Entity, Kind, Rule, RuleViolation, Severity, Status};
use crate::store::Store;

pub use builtin::builtin_rules;

/// Default per-statement evaluation timeout.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one rule during a batch evaluation run.
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub rule_id: i64,
    pub name: String,
    pub violations: usize,
    /// Statement exceeded its timeout and was skipped
    pub skipped: bool,
}

/// Validate a rule statement against the live schema. Called from the rule
/// before-flush hook, so an invalid statement never persists.
pub fn validate_statement(conn: &Connection, rule: &Rule) -> Result<()> {
    let statement = rule.statement.trim().trim_end_matches(';').trim();

    if statement.contains(';') {
        return Err(UdbError::validation(
            "statement",
            "multiple SQL statements are not allowed",
        ));
    }
    if !statement.to_lowercase().starts_with("select ") {
        return Err(UdbError::validation(
            "statement",
            "your SQL statement should start with SELECT",
        ));
    }
    let forbidden = regex::Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|attach|detach|pragma|replace|vacuum|reindex)\b",
    )
    .expect("static regex");
    if let Some(found) = forbidden.find(statement) {
        return Err(UdbError::validation(
            "statement",
            format!("data-modifying keyword `{}` is not allowed", found.as_str()),
        ));
    }
    let target = regex::Regex::new(&format!(r"(?i)\bfrom\s+{}\b", regex::escape(&rule.model_name)))
        .expect("static regex");
    if !target.is_match(statement) {
        return Err(UdbError::validation(
            "statement",
            "your SQL statement does not match the selected data type",
        ));
    }

    // LIMIT 0 probe: the statement must prepare against the live schema and
    // project exactly two columns.
    let probe = format!("SELECT * FROM ({statement}) LIMIT 0");
    let mut prepared = conn
        .prepare(&probe)
        .map_err(|e| UdbError::validation("statement", e.to_string()))?;
    let columns = prepared.column_count();
    if columns != 2 {
        return Err(UdbError::validation(
            "statement",
            format!("your statement returned {columns} column(s), but it is expected to return 2 columns: (id, label)"),
        ));
    }
    let mut rows = prepared
        .query([])
        .map_err(|e| UdbError::validation("statement", e.to_string()))?;
    rows.next()
        .map_err(|e| UdbError::validation("statement", e.to_string()))?;
    Ok(())
}

/// Rule before-flush hook: shape-check the statement before persisting.
pub fn rule_before_flush(ctx: &mut crate::session::FlushCtx<'_>, index: usize) -> Result<()> {
    let rule = match ctx.entity(index) {
        Entity::Rule(rule) => rule.clone(),
        _ => return Ok(()),
    };
    if rule.meta.status.is_deleted() {
        return Ok(());
    }
    let conn = ctx.store().conn()?;
    validate_statement(&conn, &rule)
}

fn violation_rows(conn: &Connection, statement: &str) -> Result<Vec<(i64, String)>> {
    let mut prepared = conn.prepare(statement)?;
    let mut rows = prepared.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let label = match row.get::<_, SqlValue>(1)? {
            SqlValue::Text(text) => text,
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(r) => r.to_string(),
            SqlValue::Null => String::new(),
            SqlValue::Blob(_) => String::new(),
        };
        out.push((id, label));
    }
    Ok(out)
}

fn load_rules(conn: &Connection, severity: Option<Severity>) -> Result<Vec<Rule>> {
    let mut sql = String::from(
        "SELECT id, name, model_name, statement, description, severity, builtin, field
         FROM rule WHERE status = 2",
    );
    if severity.is_some() {
        sql.push_str(" AND severity = ?1");
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Rule> {
        let severity_raw: i64 = row.get(5)?;
        let mut rule = Rule::new(
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        );
        rule.meta.id = Some(row.get(0)?);
        rule.description = row.get(4)?;
        rule.severity = Severity::from_i64(severity_raw)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(5, severity_raw))?;
        rule.builtin = row.get(6)?;
        rule.field = row.get(7)?;
        Ok(rule)
    };
    let rules = match severity {
        Some(severity) => stmt
            .query_map([severity.as_i64()], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt
            .query_map([], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(rules)
}

/// Run the enforced rules against the entities touched by a commit. Called
/// inside the committing transaction; an error aborts it.
pub fn check_enforced(conn: &Connection, touched: &[(Kind, i64)]) -> Result<()> {
    if touched.is_empty() {
        return Ok(());
    }
    let rules = load_rules(conn, Some(Severity::Enforced))?;
    for rule in rules {
        let Some(kind) = Kind::from_table(&rule.model_name) else {
            continue;
        };
        let ids: Vec<i64> = touched
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect();
        if ids.is_empty() {
            continue;
        }
        for (violation_id, label) in violation_rows(conn, &rule.statement)? {
            if ids.contains(&violation_id) {
                let field = rule.field.clone().unwrap_or_else(|| "status".to_string());
                let message = if rule.description.is_empty() {
                    format!("rule `{}` rejected {}", rule.name, label)
                } else {
                    rule.description.clone()
                };
                return Err(UdbError::Validation { field, message });
            }
        }
    }
    Ok(())
}

/// Evaluate every enabled rule and reconcile the persisted violations:
/// new rows get `first_seen = now`, still-offending rows bump `last_seen`,
/// rows no longer returned are removed. Each statement runs in its own
/// read-only transaction under `timeout`; statements exceeding it are
/// skipped and logged.
pub fn evaluate_all(store: &Store, timeout: Duration) -> Result<Vec<RuleOutcome>> {
    let conn = store.conn()?;
    let rules = load_rules(&conn, None)?;
    let mut outcomes = Vec::with_capacity(rules.len());

    for rule in rules {
        let rule_id = rule.meta.id.expect("loaded rule has an id");
        let run_stamp = Utc::now().to_rfc3339();

        let rows = {
            let deadline = Instant::now() + timeout;
            conn.progress_handler(4096, Some(move || Instant::now() >= deadline));
            let result = violation_rows(&conn, &rule.statement);
            conn.progress_handler(0, None::<fn() -> bool>);
            result
        };

        match rows {
            Ok(rows) => {
                let tx_result: Result<()> = (|| {
                    conn.execute_batch("BEGIN")?;
                    for (model_id, label) in &rows {
                        conn.execute(
                            "INSERT INTO rule_violation
                                 (rule_id, model_name, model_id, label, first_seen, last_seen)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                             ON CONFLICT (rule_id, model_name, model_id)
                             DO UPDATE SET last_seen = excluded.last_seen, label = excluded.label",
                            rusqlite::params![rule_id, rule.model_name, model_id, label, run_stamp],
                        )?;
                    }
                    conn.execute(
                        "DELETE FROM rule_violation WHERE rule_id = ?1 AND last_seen != ?2",
                        rusqlite::params![rule_id, run_stamp],
                    )?;
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                })();
                if let Err(e) = tx_result {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
                outcomes.push(RuleOutcome {
                    rule_id,
                    name: rule.name,
                    violations: rows.len(),
                    skipped: false,
                });
            }
            Err(e) => {
                tracing::warn!("rule `{}` skipped: {}", rule.name, e);
                outcomes.push(RuleOutcome {
                    rule_id,
                    name: rule.name,
                    violations: 0,
                    skipped: true,
                });
            }
        }
    }
    Ok(outcomes)
}

/// Current violations of one rule.
pub fn violations(store: &Store, rule_id: i64) -> Result<Vec<RuleViolation>> {
    let conn = store.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, rule_id, model_name, model_id, label, first_seen, last_seen
         FROM rule_violation WHERE rule_id = ?1 ORDER BY model_name, model_id",
    )?;
    let rows = stmt
        .query_map([rule_id], |row| {
            let first_raw: String = row.get(5)?;
            let last_raw: String = row.get(6)?;
            let parse = |raw: String| {
                chrono::DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            5,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })
            };
            Ok(RuleViolation {
                id: Some(row.get(0)?),
                rule_id: row.get(1)?,
                model_name: row.get(2)?,
                model_id: row.get(3)?,
                label: row.get(4)?,
                first_seen: parse(first_raw)?,
                last_seen: parse(last_raw)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Seed or refresh the builtin rule catalogue. Administrator edits to
/// non-statement fields survive; the statement, severity and description of
/// builtin rules are owned by the application.
pub fn sync_builtin(conn: &Connection) -> Result<()> {
    for def in builtin_rules() {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM rule WHERE name = ?1",
                [def.name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let now = Utc::now().to_rfc3339();
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE rule SET model_name = ?1, statement = ?2, description = ?3,
                            severity = ?4, builtin = 1, field = ?5, modified_at = ?6
                     WHERE id = ?7",
                    rusqlite::params![
                        def.model.table(),
                        def.statement,
                        def.description,
                        def.severity.as_i64(),
                        def.field,
                        now,
                        id
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO rule (name, model_name, statement, description, severity,
                                       builtin, field, notes, status, created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, '', ?7, ?8, ?8)",
                    rusqlite::params![
                        def.name,
                        def.model.table(),
                        def.statement,
                        def.description,
                        def.severity.as_i64(),
                        def.field,
                        Status::Enabled.as_i64(),
                        now
                    ],
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::open_temp;

    fn setup() -> (tempfile::TempDir, Store) {
        let (guard, db) = open_temp();
        let conn = db.get_conn().unwrap();
        sync_builtin(&conn).unwrap();
        (guard, db.store())
    }

    #[test]
    fn test_validate_accepts_two_column_select() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        let rule = Rule::new(
            "unnamed-vrf",
            "vrf",
            "SELECT id, name FROM vrf WHERE name = ''",
        );
        assert!(validate_statement(&conn, &rule).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_select() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        let rule = Rule::new("bad", "vrf", "DELETE FROM vrf");
        assert!(validate_statement(&conn, &rule).is_err());
    }

    #[test]
    fn test_validate_rejects_multi_statement() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        let rule = Rule::new("bad", "vrf", "SELECT id, name FROM vrf; DROP TABLE vrf");
        assert!(validate_statement(&conn, &rule).is_err());
    }

    #[test]
    fn test_validate_rejects_modifying_keyword() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        // Data-modifying keywords are rejected anywhere in the statement,
        // string literals included.
        let rule = Rule::new("bad", "vrf", "SELECT id, name FROM vrf WHERE notes != 'drop table'");
        assert!(validate_statement(&conn, &rule).is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_arity() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        for statement in ["SELECT id FROM vrf", "SELECT id, name, notes FROM vrf"] {
            let rule = Rule::new("bad", "vrf", statement);
            let err = validate_statement(&conn, &rule).unwrap_err();
            match err {
                UdbError::Validation { field, .. } => assert_eq!(field, "statement"),
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_rejects_model_mismatch() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        let rule = Rule::new("bad", "subnet", "SELECT id, name FROM vrf");
        assert!(validate_statement(&conn, &rule).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_table() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        let rule = Rule::new("bad", "nosuch", "SELECT id, name FROM nosuch");
        assert!(validate_statement(&conn, &rule).is_err());
    }

    #[test]
    fn test_builtin_statements_validate() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();
        for def in builtin_rules() {
            let mut rule = Rule::new(def.name, def.model.table(), def.statement);
            rule.model_name = def.model.table().to_string();
            validate_statement(&conn, &rule)
                .unwrap_or_else(|e| panic!("builtin rule {} failed: {e}", def.name));
        }
    }

    #[test]
    fn test_evaluate_all_reconciles_violations() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();

        // An always-on custom rule flagging VRFs with an empty name.
        conn.execute(
            "INSERT INTO rule (name, model_name, statement, description, severity, builtin,
                               notes, status, created_at, modified_at)
             VALUES ('vrf-unnamed', 'vrf', 'SELECT id, name FROM vrf WHERE name = '''' AND status = 2',
                     '', 0, 0, '', 2, '2024-01-01T00:00:00+00:00', '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO vrf (name, notes, status, created_at, modified_at)
             VALUES ('', '', 2, '2024-01-01T00:00:00+00:00', '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        let vrf_id = conn.last_insert_rowid();
        drop(conn);

        let outcomes = evaluate_all(&store, DEFAULT_STATEMENT_TIMEOUT).unwrap();
        let outcome = outcomes.iter().find(|o| o.name == "vrf-unnamed").unwrap();
        let rule_id = outcome.rule_id;
        assert_eq!(outcome.violations, 1);

        let rows = violations(&store, rule_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model_id, vrf_id);
        let first_seen = rows[0].first_seen;

        // Still offending: last_seen bumps, first_seen survives.
        let outcomes = evaluate_all(&store, DEFAULT_STATEMENT_TIMEOUT).unwrap();
        assert_eq!(outcomes.iter().find(|o| o.name == "vrf-unnamed").unwrap().violations, 1);
        let rows = violations(&store, rule_id).unwrap();
        assert_eq!(rows[0].first_seen, first_seen);
        assert!(rows[0].last_seen >= first_seen);

        // Fixed: the violation row disappears on the next clean run.
        let conn = store.conn().unwrap();
        conn.execute("UPDATE vrf SET name = 'fixed' WHERE id = ?1", [vrf_id])
            .unwrap();
        drop(conn);
        evaluate_all(&store, DEFAULT_STATEMENT_TIMEOUT).unwrap();
        assert!(violations(&store, rule_id).unwrap().is_empty());
    }

    #[test]
    fn test_check_enforced_scoped_to_touched() {
        let (_guard, store) = setup();
        let conn = store.conn().unwrap();

        // A record outside any zone violates dns_record_without_zone.
        conn.execute(
            "INSERT INTO dnsrecord (name, type, ttl, value, generated_ip, notes, status,
                                    created_at, modified_at)
             VALUES ('orphan.example.com', 'A', 3600, '10.0.0.1', '10.0.0.1', '', 2,
                     '2024-01-01T00:00:00+00:00', '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        let record_id = conn.last_insert_rowid();

        // Untouched entities do not abort a commit.
        check_enforced(&conn, &[(Kind::Vrf, 1)]).unwrap();
        // The offending record does.
        let err = check_enforced(&conn, &[(Kind::DnsRecord, record_id)]).unwrap_err();
        match err {
            UdbError::Validation { .. } => {}
            other => panic!("unexpected error {other:?}"),
        }
    }
}
