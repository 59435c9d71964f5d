//! External-interface contracts
//!
//! What the out-of-process collaborators hand in and receive: the notifier
//! and directory traits, the JSON row/response shapes served by the external
//! HTTP dispatcher, the error body format and the status mapping. Nothing in
//! here dispatches requests itself.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, UdbError};
use crate::model::{Kind, Message};
use crate::store::{Filter, Paging, Store};

/// Follower notifications aggregated for one commit: at most one message per
/// `(follower, entity)`.
#[derive(Debug, Clone, Default)]
pub struct NotificationBatch {
    /// user id -> messages, in the commit's aggregate order
    pub recipients: BTreeMap<i64, Vec<Message>>,
}

/// Delivery collaborator (SMTP bridge in production). Called after a commit;
/// failures are logged, never propagated back into the transaction.
pub trait Notifier {
    fn notify(&self, batch: &NotificationBatch) -> Result<()>;
}

/// User entry resolved by the external directory.
#[derive(Debug, Clone)]
pub struct DirectoryUser {
    pub username: String,
    pub fullname: Option<String>,
    pub email: Option<String>,
    pub groups: Vec<String>,
}

/// Directory collaborator (LDAP in production): verify credentials and
/// return the entry's attributes on success.
pub trait Directory {
    fn bind(&self, username: &str, password: &str) -> Result<Option<DirectoryUser>>;
}

/// Body of `POST /login/`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub redirect: Option<String>,
}

/// Post-login redirects must stay on-site.
pub fn validate_redirect(redirect: &str) -> Result<()> {
    if redirect.starts_with('/') && !redirect.starts_with("//") {
        Ok(())
    } else {
        Err(UdbError::validation("redirect", "redirect must be a local path"))
    }
}

/// Body served for `GET /api/`.
pub fn api_status() -> Value {
    json!({ "status": "OK" })
}

/// JSON error body rendered by the dispatcher for any core error.
pub fn error_body(error: &UdbError) -> Value {
    let status = error.http_status();
    let reason = match status {
        400 => "400 Bad Request",
        401 => "401 Unauthorized",
        403 => "403 Forbidden",
        404 => "404 Not Found",
        409 => "409 Conflict",
        429 => "429 Too Many Requests",
        _ => "500 Internal Server Error",
    };
    json!({
        "message": error.to_string(),
        "status": reason,
    })
}

/// Rows for the `GET /{kind}/data.json` listing.
pub fn data_rows(store: &Store, kind: Kind, filter: &Filter, paging: Paging) -> Result<Vec<Value>> {
    let entities = store.query(kind, filter, paging)?;
    Ok(entities.iter().map(|e| e.to_json()).collect())
}

/// Rows for `GET /ip/data.json`: aggregate IP rows with their live
/// reference count. Orphaned addresses stay listed with `count = 0`.
pub fn ip_rows(store: &Store, paging: Paging) -> Result<Vec<Value>> {
    let entities = store.query(Kind::Ip, &Filter::default(), paging)?;
    let mut rows = Vec::with_capacity(entities.len());
    for entity in entities {
        let mut row = entity.to_json();
        if let crate::model::Entity::Ip(ip_row) = &entity {
            if let Value::Object(map) = &mut row {
                map.insert(
                    "count".to_string(),
                    Value::from(store.ip_reference_count(&ip_row.ip)?),
                );
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// One author line of the dashboard activity board.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorActivity {
    pub user_id: i64,
    pub name: String,
    pub changes: i64,
}

/// Aggregates for `GET /dashboard/`.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    /// Live row count per entity kind
    pub counts: BTreeMap<String, i64>,
    /// Top-10 authors by audit entries over the last 7 days
    pub top_authors: Vec<AuthorActivity>,
}

pub fn dashboard(store: &Store) -> Result<DashboardSummary> {
    let mut counts = BTreeMap::new();
    for kind in [
        Kind::Vrf,
        Kind::Subnet,
        Kind::DnsZone,
        Kind::DnsRecord,
        Kind::DhcpRecord,
        Kind::Ip,
        Kind::Mac,
        Kind::User,
        Kind::Rule,
    ] {
        counts.insert(kind.table().to_string(), store.count(kind, &Filter::default())?);
    }

    let since = (Utc::now() - Duration::days(7)).to_rfc3339();
    let conn = store.conn()?;
    let mut stmt = conn.prepare(
        "SELECT m.author_id,
                COALESCE(NULLIF(u.fullname, ''), u.username, '?') AS name,
                COUNT(*) AS changes
         FROM message m
         LEFT JOIN user u ON u.id = m.author_id
         WHERE m.date >= ?1 AND m.author_id IS NOT NULL
         GROUP BY m.author_id
         ORDER BY changes DESC, m.author_id
         LIMIT 10",
    )?;
    let top_authors = stmt
        .query_map([&since], |row| {
            Ok(AuthorActivity {
                user_id: row.get(0)?,
                name: row.get(1)?,
                changes: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(DashboardSummary { counts, top_authors })
}

/// Rows for `GET /search/query.json`.
pub fn search_json(store: &Store, query: &str, include_messages: bool) -> Result<Vec<Value>> {
    let options = crate::search::SearchOptions {
        include_messages,
        ..Default::default()
    };
    let hits = crate::search::query(store, query, &options)?;
    Ok(hits
        .iter()
        .map(|hit| serde_json::to_value(hit).unwrap_or(Value::Null))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_redirect() {
        assert!(validate_redirect("/dashboard/").is_ok());
        assert!(validate_redirect("/").is_ok());
        assert!(validate_redirect("https://evil.example").is_err());
        assert!(validate_redirect("//evil.example").is_err());
        assert!(validate_redirect("").is_err());
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body(&UdbError::NotFound { kind: "vrf", id: 9 });
        assert_eq!(body["status"], "404 Not Found");
        assert!(body["message"].as_str().unwrap().contains("vrf"));

        let body = error_body(&UdbError::RateLimited);
        assert_eq!(body["status"], "429 Too Many Requests");
    }

    #[test]
    fn test_api_status_shape() {
        assert_eq!(api_status(), json!({"status": "OK"}));
    }
}
