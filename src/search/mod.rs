//! Federated search
//!
//! One queryable view over the searchable entity kinds, backed by a
//! materialised FTS5 projection that the flush pipeline refreshes after
//! every commit. Queries use websearch syntax: bare terms AND together,
//! quoted phrases match adjacently, a leading `-` negates, `OR` alternates.
//! A secondary read-only join over the message index lets operators search
//! by audit content.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::model::{Entity, Kind, Status};
use crate::store::Store;

/// Hard cap on returned rows.
pub const MAX_RESULTS: usize = 100;

/// One row of the federated view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub model_name: String,
    pub model_id: i64,
    pub summary: String,
    pub notes: String,
    pub status: Status,
    pub owner_id: Option<i64>,
    pub modified_at: DateTime<Utc>,
    /// True when the hit came from the message join rather than the entity
    /// projection itself
    pub via_message: bool,
}

/// Query options.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Also return soft-deleted entities
    pub include_deleted: bool,
    /// Also match against the audit messages of each entity
    pub include_messages: bool,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            include_deleted: false,
            include_messages: false,
            limit: MAX_RESULTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    negated: bool,
    text: String,
}

/// Translate a websearch query into an FTS5 MATCH expression. Returns `None`
/// when no positive term survives (FTS5 cannot express a bare negation).
pub fn websearch_to_match(query: &str) -> Option<String> {
    // Split into quoted phrases and bare words, keeping `-` prefixes.
    let mut terms: Vec<Term> = Vec::new();
    let mut groups: Vec<Vec<Term>> = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        let mut negated = false;
        let mut c = c;
        if c == '-' {
            negated = true;
            match chars.next() {
                Some(next) => c = next,
                None => break,
            }
        }
        let mut text = String::new();
        if c == '"' {
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                text.push(c);
            }
        } else {
            text.push(c);
            while let Some(&next) = chars.peek() {
                if next.is_whitespace() {
                    break;
                }
                text.push(next);
                chars.next();
            }
        }
        if !negated && text.eq_ignore_ascii_case("or") {
            // OR alternates whole groups
            groups.push(std::mem::take(&mut terms));
            continue;
        }
        // Embedded quotes would break out of the phrase syntax.
        let text = text.replace('"', " ").trim().to_string();
        if text.chars().any(|c| c.is_alphanumeric()) {
            terms.push(Term { negated, text });
        }
    }
    groups.push(terms);

    let mut rendered_groups = Vec::new();
    for group in groups {
        let positives: Vec<&Term> = group.iter().filter(|t| !t.negated).collect();
        if positives.is_empty() {
            continue;
        }
        let mut rendered = positives
            .iter()
            .map(|t| format!("\"{}\"", t.text))
            .collect::<Vec<_>>()
            .join(" AND ");
        for negative in group.iter().filter(|t| t.negated) {
            rendered.push_str(&format!(" NOT \"{}\"", negative.text));
        }
        rendered_groups.push(format!("({rendered})"));
    }

    if rendered_groups.is_empty() {
        None
    } else {
        Some(rendered_groups.join(" OR "))
    }
}

/// Run a websearch query over the federated view. Results are ordered by
/// relevance then `modified_at` descending, capped at
/// [`MAX_RESULTS`].
pub fn query(store: &Store, raw_query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
    let Some(match_expr) = websearch_to_match(raw_query) else {
        return Ok(Vec::new());
    };
    let limit = options.limit.min(MAX_RESULTS);
    let conn = store.conn()?;

    // (rank, hit), rank ascending = most relevant first (bm25 is negated).
    let mut hits: Vec<(f64, SearchHit)> = Vec::new();
    let mut seen: Vec<(String, i64)> = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT model_name, CAST(model_id AS INTEGER), summary, notes,
                CAST(status AS INTEGER), owner_id, modified_at, rank
         FROM search_index WHERE search_index MATCH ?1",
    )?;
    let mut rows = stmt.query([&match_expr])?;
    while let Some(row) = rows.next()? {
        let hit = hit_from_row(row, false)?;
        if !options.include_deleted && hit.status.is_deleted() {
            continue;
        }
        let rank: f64 = row.get(7)?;
        seen.push((hit.model_name.clone(), hit.model_id));
        hits.push((rank, hit));
    }

    if options.include_messages {
        let mut stmt = conn.prepare(
            "SELECT s.model_name, CAST(s.model_id AS INTEGER), s.summary, s.notes,
                    CAST(s.status AS INTEGER), s.owner_id, s.modified_at
             FROM search_index s
             JOIN (SELECT DISTINCT model_name, model_id FROM message_search
                   WHERE message_search MATCH ?1) m
               ON m.model_name = s.model_name
              AND CAST(m.model_id AS INTEGER) = CAST(s.model_id AS INTEGER)",
        )?;
        let mut rows = stmt.query([&match_expr])?;
        while let Some(row) = rows.next()? {
            let hit = hit_from_row(row, true)?;
            if !options.include_deleted && hit.status.is_deleted() {
                continue;
            }
            let key = (hit.model_name.clone(), hit.model_id);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            // Message hits rank behind direct matches of equal recency.
            hits.push((0.0, hit));
        }
    }

    hits.sort_by(|(rank_a, a), (rank_b, b)| {
        rank_a
            .partial_cmp(rank_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.modified_at.cmp(&a.modified_at))
    });
    Ok(hits.into_iter().map(|(_, hit)| hit).take(limit).collect())
}

fn hit_from_row(row: &rusqlite::Row<'_>, via_message: bool) -> rusqlite::Result<SearchHit> {
    let status_raw: i64 = row.get(4)?;
    let modified_raw: String = row.get(6)?;
    Ok(SearchHit {
        model_name: row.get(0)?,
        model_id: row.get(1)?,
        summary: row.get(2)?,
        notes: row.get(3)?,
        status: Status::from_i64(status_raw).map_err(|_| {
            rusqlite::Error::IntegralValueOutOfRange(4, status_raw)
        })?,
        owner_id: row.get(5)?,
        modified_at: DateTime::parse_from_rfc3339(&modified_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
            })?,
        via_message,
    })
}

/// Extra token text indexed next to summary and notes.
fn extra_tokens(entity: &Entity) -> String {
    match entity {
        Entity::Subnet(subnet) => subnet.range_string(),
        Entity::DnsRecord(record) => format!("{} {}", record.rtype, record.value),
        Entity::DhcpRecord(record) => format!("{} {}", record.ip, record.mac),
        _ => String::new(),
    }
}

/// Replace the projection row of one entity. Soft-deleted rows stay in the
/// index; queries filter them by default.
pub(crate) fn refresh_entity(conn: &Connection, entity: &Entity) -> Result<()> {
    let kind = entity.kind();
    let id = entity.id().expect("projection refresh after id assignment");
    conn.execute(
        "DELETE FROM search_index WHERE model_name = ?1 AND CAST(model_id AS INTEGER) = ?2",
        rusqlite::params![kind.table(), id],
    )?;
    let meta = entity.meta();
    conn.execute(
        "INSERT INTO search_index
             (summary, notes, extra, model_name, model_id, status, owner_id, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            entity.summary(),
            meta.notes,
            extra_tokens(entity),
            kind.table(),
            id,
            meta.status.as_i64(),
            meta.owner_id,
            meta.modified_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Rebuild the whole projection from the entity tables; a maintenance
/// operation, the pipeline keeps the projection current incrementally.
pub fn rebuild(store: &Store) -> Result<usize> {
    let conn = store.conn()?;
    conn.execute("DELETE FROM search_index", [])?;
    let mut refreshed = 0;
    for kind in Kind::searchable() {
        let filter = crate::store::Filter {
            include_deleted: true,
            ..Default::default()
        };
        let mut offset = 0;
        loop {
            let page = store.query(
                *kind,
                &filter,
                crate::store::Paging { offset, limit: 500 },
            )?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;
            for entity in &page {
                refresh_entity(&conn, entity)?;
                refreshed += 1;
            }
        }
    }
    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websearch_bare_terms_and() {
        assert_eq!(
            websearch_to_match("dmz public").unwrap(),
            "(\"dmz\" AND \"public\")"
        );
    }

    #[test]
    fn test_websearch_phrase() {
        assert_eq!(
            websearch_to_match("\"main subnet\" dmz").unwrap(),
            "(\"main subnet\" AND \"dmz\")"
        );
    }

    #[test]
    fn test_websearch_negation() {
        assert_eq!(
            websearch_to_match("dmz -deleted").unwrap(),
            "(\"dmz\" NOT \"deleted\")"
        );
    }

    #[test]
    fn test_websearch_or_groups() {
        assert_eq!(
            websearch_to_match("dmz OR arz").unwrap(),
            "(\"dmz\") OR (\"arz\")"
        );
        assert_eq!(
            websearch_to_match("dmz public or arz").unwrap(),
            "(\"dmz\" AND \"public\") OR (\"arz\")"
        );
    }

    #[test]
    fn test_websearch_requires_positive_term() {
        assert_eq!(websearch_to_match("-dmz"), None);
        assert_eq!(websearch_to_match("   "), None);
        assert_eq!(websearch_to_match(""), None);
    }

    #[test]
    fn test_websearch_strips_stray_quotes() {
        assert_eq!(websearch_to_match("\"unterminated").unwrap(), "(\"unterminated\")");
    }

    #[test]
    fn test_websearch_ip_fragment() {
        // Punctuation survives inside the quoted phrase; FTS5 tokenises it.
        assert_eq!(
            websearch_to_match("147.87.250").unwrap(),
            "(\"147.87.250\")"
        );
    }
}
