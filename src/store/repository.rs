//! Typed repository over the entity tables
//!
//! Free-standing reads and writes parametrised by entity kind. Writes are
//! exposed as plain functions taking a connection so the flush pipeline can
//! run them inside its own transaction; reads go through the pool.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{DbPool, PooledConnection};
use crate::error::{Result, UdbError};
use crate::model::{
    DhcpRecord, DnsRecord, DnsZone, Entity, Follower, IpRow, Kind, MacRow, Message, MessageType,
    Meta, NameLookup, Rule, Severity, Status, Subnet, User, Vrf,
};
use crate::net::{ip_sort_key, network_id, Cidr, Mac};

/// Row filter for [`Store::query`]. The default hides soft-deleted rows.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Also return `status = deleted` rows
    pub include_deleted: bool,
    /// Exact status match
    pub status: Option<Status>,
    /// Rows owned by this user
    pub owner_id: Option<i64>,
    /// Case-insensitive substring over the kind's identifying text
    pub substring: Option<String>,
    /// Rows whose address or range lies inside this network
    pub cidr: Option<Cidr>,
}

/// Result page bounds; queries never return unbounded row sets.
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Repository over the entity tables; cheap to clone, shares one pool.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn conn(&self) -> Result<PooledConnection> {
        self.pool
            .get()
            .map_err(|e| UdbError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Load one entity or fail with `NotFound`.
    pub fn get(&self, kind: Kind, id: i64) -> Result<Entity> {
        self.try_get(kind, id)?.ok_or(UdbError::NotFound {
            kind: kind.table(),
            id,
        })
    }

    pub fn try_get(&self, kind: Kind, id: i64) -> Result<Option<Entity>> {
        let conn = self.conn()?;
        get_entity(&conn, kind, id)
    }

    /// Query rows of one kind. Soft-deleted rows are hidden unless the filter
    /// opts in.
    pub fn query(&self, kind: Kind, filter: &Filter, paging: Paging) -> Result<Vec<Entity>> {
        let conn = self.conn()?;
        let (where_sql, params) = filter_sql(kind, filter);
        let sql = format!(
            "SELECT id FROM {table} {where_sql} ORDER BY {order} LIMIT ?{limit_ix} OFFSET ?{offset_ix}",
            table = kind.table(),
            where_sql = where_sql,
            order = order_sql(kind),
            limit_ix = params.len() + 1,
            offset_ix = params.len() + 2,
        );
        let mut all_params = params;
        all_params.push(SqlValue::Integer(paging.limit));
        all_params.push(SqlValue::Integer(paging.offset));

        let mut stmt = conn.prepare(&sql)?;
        let ids: Vec<i64> = stmt
            .query_map(rusqlite::params_from_iter(all_params), |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut entities = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = get_entity(&conn, kind, id)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    pub fn count(&self, kind: Kind, filter: &Filter) -> Result<i64> {
        let conn = self.conn()?;
        let (where_sql, params) = filter_sql(kind, filter);
        let sql = format!("SELECT COUNT(*) FROM {} {}", kind.table(), where_sql);
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM user WHERE lower(username) = lower(?1) AND status != 0",
                [username],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => Ok(get_entity(&conn, Kind::User, id)?.map(|e| match e {
                Entity::User(u) => u,
                _ => unreachable!(),
            })),
            None => Ok(None),
        }
    }

    pub fn find_vrf_by_name(&self, name: &str) -> Result<Option<Vrf>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM vrf WHERE name = ?1 AND status != 0",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match id {
            Some(id) => match get_entity(&conn, Kind::Vrf, id)? {
                Some(Entity::Vrf(v)) => Some(v),
                _ => None,
            },
            None => None,
        })
    }

    pub fn find_zone_by_name(&self, name: &str) -> Result<Option<DnsZone>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM dnszone WHERE lower(name) = lower(?1) AND status != 0",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match id {
            Some(id) => match get_entity(&conn, Kind::DnsZone, id)? {
                Some(Entity::DnsZone(z)) => Some(z),
                _ => None,
            },
            None => None,
        })
    }

    /// Longest non-deleted zone whose name is a suffix of `hostname`.
    pub fn longest_zone_match(&self, hostname: &str) -> Result<Option<DnsZone>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM dnszone
                 WHERE status != 0 AND (lower(?1) = name OR lower(?1) LIKE '%.' || name)
                 ORDER BY length(name) DESC LIMIT 1",
                [hostname],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match id {
            Some(id) => match get_entity(&conn, Kind::DnsZone, id)? {
                Some(Entity::DnsZone(z)) => Some(z),
                _ => None,
            },
            None => None,
        })
    }

    pub fn find_ip(&self, ip: &IpAddr) -> Result<Option<IpRow>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM ip WHERE ip = ?1 AND status != 0",
                [ip.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match id {
            Some(id) => match get_entity(&conn, Kind::Ip, id)? {
                Some(Entity::Ip(row)) => Some(row),
                _ => None,
            },
            None => None,
        })
    }

    pub fn find_mac(&self, mac: &Mac) -> Result<Option<MacRow>> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM mac WHERE mac = ?1 AND status != 0",
                [mac.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match id {
            Some(id) => match get_entity(&conn, Kind::Mac, id)? {
                Some(Entity::Mac(row)) => Some(row),
                _ => None,
            },
            None => None,
        })
    }

    /// Number of live DNS/DHCP records referencing an IP address.
    pub fn ip_reference_count(&self, ip: &IpAddr) -> Result<i64> {
        let conn = self.conn()?;
        let text = ip.to_string();
        let dns: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dnsrecord WHERE generated_ip = ?1 AND status != 0",
            [&text],
            |row| row.get(0),
        )?;
        let dhcp: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dhcprecord WHERE ip = ?1 AND status != 0",
            [&text],
            |row| row.get(0),
        )?;
        Ok(dns + dhcp)
    }

    /// Number of live DNS/DHCP records referencing a MAC address.
    pub fn mac_reference_count(&self, mac: &Mac) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM dhcprecord WHERE mac = ?1 AND status != 0",
            [mac.to_string()],
            |row| row.get(0),
        )?)
    }

    pub fn live_subnet_count_for_vrf(&self, vrf_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM subnet WHERE vrf_id = ?1 AND status != 0",
            [vrf_id],
            |row| row.get(0),
        )?)
    }

    /// Audit trail of one entity, ordered by date then insertion id.
    pub fn messages_for(&self, kind: Kind, id: i64) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, model_name, model_id, author_id, type, body, changes, date
             FROM message WHERE model_name = ?1 AND model_id = ?2 ORDER BY date, id",
        )?;
        let messages = stmt
            .query_map(params![kind.table(), id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Subscribe a user to an entity's audit trail; duplicates are ignored.
    pub fn follow(&self, kind: Kind, id: i64, user_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO follower (model_name, model_id, user_id) VALUES (?1, ?2, ?3)",
            params![kind.table(), id, user_id],
        )?;
        Ok(())
    }

    pub fn unfollow(&self, kind: Kind, id: i64, user_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM follower WHERE model_name = ?1 AND model_id = ?2 AND user_id = ?3",
            params![kind.table(), id, user_id],
        )?;
        Ok(())
    }

    pub fn is_following(&self, kind: Kind, id: i64, user_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM follower WHERE model_name = ?1 AND model_id = ?2 AND user_id = ?3",
            params![kind.table(), id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn followers(&self, kind: Kind, id: i64) -> Result<Vec<Follower>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, model_name, model_id, user_id FROM follower
             WHERE model_name = ?1 AND model_id = ?2",
        )?;
        let followers = stmt
            .query_map(params![kind.table(), id], |row| {
                Ok(Follower {
                    id: Some(row.get(0)?),
                    model_name: row.get(1)?,
                    model_id: row.get(2)?,
                    user_id: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(followers)
    }
}

impl NameLookup for Store {
    fn user_name(&self, id: i64) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row(
            "SELECT CASE WHEN fullname != '' THEN fullname ELSE username END FROM user WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()
        .ok()?
    }

    fn vrf_name(&self, id: i64) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row("SELECT name FROM vrf WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .ok()?
    }

    fn zone_name(&self, id: i64) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row("SELECT name FROM dnszone WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .ok()?
    }

    fn subnet_name(&self, id: i64) -> Option<String> {
        let conn = self.conn().ok()?;
        conn.query_row("SELECT name FROM subnet WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .ok()?
    }
}

fn order_sql(kind: Kind) -> &'static str {
    match kind {
        Kind::Ip => "ip_sort",
        Kind::DnsRecord => "name, type, value",
        Kind::DnsZone | Kind::Vrf | Kind::Rule => "name",
        _ => "id",
    }
}

/// Identifying text columns searched by the substring filter.
fn substring_columns(kind: Kind) -> &'static [&'static str] {
    match kind {
        Kind::User => &["username", "fullname", "email"],
        Kind::Vrf => &["name", "notes"],
        Kind::Subnet => &["name", "notes", "range_string"],
        Kind::DnsZone => &["name", "notes"],
        Kind::DnsRecord => &["name", "value", "notes"],
        Kind::DhcpRecord => &["ip", "mac", "notes"],
        Kind::Rule => &["name", "description", "notes"],
        Kind::Ip => &["ip", "notes"],
        Kind::Mac => &["mac", "notes"],
    }
}

/// Containment condition for the cidr filter, when the kind has an address.
fn cidr_condition(kind: Kind) -> Option<&'static str> {
    match kind {
        Kind::DnsRecord => Some("(generated_ip IS NOT NULL AND subnet_of_or_equals(generated_ip, ?))"),
        Kind::DhcpRecord => Some("subnet_of_or_equals(ip, ?)"),
        Kind::Ip => Some("subnet_of_or_equals(ip, ?)"),
        Kind::Subnet => Some(
            "EXISTS (SELECT 1 FROM subnet_range r WHERE r.subnet_id = subnet.id \
             AND subnet_of_or_equals(r.range, ?))",
        ),
        _ => None,
    }
}

fn filter_sql(kind: Kind, filter: &Filter) -> (String, Vec<SqlValue>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(status) = filter.status {
        conditions.push("status = ?".into());
        params.push(SqlValue::Integer(status.as_i64()));
    } else if !filter.include_deleted {
        conditions.push("status != 0".into());
    }
    if let Some(owner_id) = filter.owner_id {
        conditions.push("owner_id = ?".into());
        params.push(SqlValue::Integer(owner_id));
    }
    if let Some(needle) = &filter.substring {
        let cols = substring_columns(kind);
        let like = cols
            .iter()
            .map(|c| format!("{c} LIKE ?"))
            .collect::<Vec<_>>()
            .join(" OR ");
        conditions.push(format!("({like})"));
        for _ in cols {
            params.push(SqlValue::Text(format!("%{}%", needle)));
        }
    }
    if let Some(cidr) = &filter.cidr {
        if let Some(condition) = cidr_condition(kind) {
            conditions.push(condition.into());
            params.push(SqlValue::Text(cidr.to_string()));
        }
    }

    let where_sql = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (where_sql, params)
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Read the shared meta columns `notes, status, owner_id, created_at,
/// modified_at` starting at `base`, with `id` at column 0.
fn read_meta(row: &Row<'_>, base: usize) -> rusqlite::Result<Meta> {
    let status_raw: i64 = row.get(base + 1)?;
    Ok(Meta {
        id: Some(row.get(0)?),
        status: Status::from_i64(status_raw).map_err(|_| {
            rusqlite::Error::IntegralValueOutOfRange(base + 1, status_raw)
        })?,
        owner_id: row.get(base + 2)?,
        notes: row.get(base)?,
        created_at: parse_ts(row.get(base + 3)?)?,
        modified_at: parse_ts(row.get(base + 4)?)?,
    })
}

fn parse_in_row<T, E: std::error::Error + Send + Sync + 'static>(
    idx: usize,
    result: std::result::Result<T, E>,
) -> rusqlite::Result<T> {
    result.map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let type_raw: String = row.get(4)?;
    let changes_raw: Option<String> = row.get(6)?;
    Ok(Message {
        id: Some(row.get(0)?),
        model_name: row.get(1)?,
        model_id: row.get(2)?,
        author_id: row.get(3)?,
        mtype: type_raw
            .parse::<MessageType>()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        body: row.get(5)?,
        changes: Message::parse_changes(changes_raw.as_deref()),
        date: parse_ts(row.get(7)?)?,
    })
}

/// Load one entity row by kind and id.
pub(crate) fn get_entity(conn: &Connection, kind: Kind, id: i64) -> Result<Option<Entity>> {
    let entity = match kind {
        Kind::Vrf => conn
            .query_row(
                "SELECT id, name, notes, status, owner_id, created_at, modified_at
                 FROM vrf WHERE id = ?1",
                [id],
                |row| {
                    Ok(Entity::Vrf(Vrf {
                        meta: read_meta(row, 2)?,
                        name: row.get(1)?,
                    }))
                },
            )
            .optional()?,
        Kind::Subnet => {
            let base = conn
                .query_row(
                    "SELECT id, name, vrf_id, l3vni, l2vni, vlan, dhcp,
                            notes, status, owner_id, created_at, modified_at
                     FROM subnet WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(Subnet {
                            meta: read_meta(row, 7)?,
                            name: row.get(1)?,
                            vrf_id: row.get(2)?,
                            l3vni: network_id::from_stored(row.get(3)?),
                            l2vni: network_id::from_stored(row.get(4)?),
                            vlan: network_id::from_stored(row.get(5)?),
                            dhcp: row.get(6)?,
                            ranges: Vec::new(),
                            dnszone_ids: Vec::new(),
                        })
                    },
                )
                .optional()?;
            match base {
                Some(mut subnet) => {
                    let mut stmt = conn.prepare(
                        "SELECT range FROM subnet_range WHERE subnet_id = ?1
                         ORDER BY version, start_ip, range",
                    )?;
                    subnet.ranges = stmt
                        .query_map([id], |row| {
                            let raw: String = row.get(0)?;
                            parse_in_row(0, Cidr::parse_normalized(&raw))
                        })?
                        .collect::<rusqlite::Result<_>>()?;
                    let mut stmt = conn.prepare(
                        "SELECT dnszone_id FROM dnszone_subnet WHERE subnet_id = ?1 ORDER BY dnszone_id",
                    )?;
                    subnet.dnszone_ids = stmt
                        .query_map([id], |row| row.get(0))?
                        .collect::<rusqlite::Result<_>>()?;
                    Some(Entity::Subnet(subnet))
                }
                None => None,
            }
        }
        Kind::DnsZone => {
            let base = conn
                .query_row(
                    "SELECT id, name, notes, status, owner_id, created_at, modified_at
                     FROM dnszone WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(DnsZone {
                            meta: read_meta(row, 2)?,
                            name: row.get(1)?,
                            subnet_ids: Vec::new(),
                        })
                    },
                )
                .optional()?;
            match base {
                Some(mut zone) => {
                    let mut stmt = conn.prepare(
                        "SELECT subnet_id FROM dnszone_subnet WHERE dnszone_id = ?1 ORDER BY subnet_id",
                    )?;
                    zone.subnet_ids = stmt
                        .query_map([id], |row| row.get(0))?
                        .collect::<rusqlite::Result<_>>()?;
                    Some(Entity::DnsZone(zone))
                }
                None => None,
            }
        }
        Kind::DnsRecord => conn
            .query_row(
                "SELECT id, name, type, ttl, value, notes, status, owner_id, created_at, modified_at
                 FROM dnsrecord WHERE id = ?1",
                [id],
                |row| {
                    let type_raw: String = row.get(2)?;
                    Ok(Entity::DnsRecord(DnsRecord {
                        meta: read_meta(row, 5)?,
                        name: row.get(1)?,
                        rtype: parse_in_row(2, type_raw.parse())?,
                        ttl: row.get(3)?,
                        value: row.get(4)?,
                    }))
                },
            )
            .optional()?,
        Kind::DhcpRecord => conn
            .query_row(
                "SELECT id, ip, mac, notes, status, owner_id, created_at, modified_at
                 FROM dhcprecord WHERE id = ?1",
                [id],
                |row| {
                    let ip_raw: String = row.get(1)?;
                    let mac_raw: String = row.get(2)?;
                    Ok(Entity::DhcpRecord(DhcpRecord {
                        meta: read_meta(row, 3)?,
                        ip: parse_in_row(1, ip_raw.parse::<IpAddr>())?,
                        mac: parse_in_row(2, Mac::parse(&mac_raw))?,
                    }))
                },
            )
            .optional()?,
        Kind::Ip => conn
            .query_row(
                "SELECT id, ip, notes, status, owner_id, created_at, modified_at
                 FROM ip WHERE id = ?1",
                [id],
                |row| {
                    let ip_raw: String = row.get(1)?;
                    Ok(Entity::Ip(IpRow {
                        meta: read_meta(row, 2)?,
                        ip: parse_in_row(1, ip_raw.parse::<IpAddr>())?,
                    }))
                },
            )
            .optional()?,
        Kind::Mac => conn
            .query_row(
                "SELECT id, mac, notes, status, owner_id, created_at, modified_at
                 FROM mac WHERE id = ?1",
                [id],
                |row| {
                    let mac_raw: String = row.get(1)?;
                    Ok(Entity::Mac(MacRow {
                        meta: read_meta(row, 2)?,
                        mac: parse_in_row(1, Mac::parse(&mac_raw))?,
                    }))
                },
            )
            .optional()?,
        Kind::User => conn
            .query_row(
                "SELECT id, username, password, fullname, email, role,
                        notes, status, owner_id, created_at, modified_at
                 FROM user WHERE id = ?1",
                [id],
                |row| {
                    let role_raw: String = row.get(5)?;
                    Ok(Entity::User(User {
                        meta: read_meta(row, 6)?,
                        username: row.get(1)?,
                        password: row.get(2)?,
                        fullname: row.get(3)?,
                        email: row.get(4)?,
                        role: parse_in_row(5, role_raw.parse())?,
                    }))
                },
            )
            .optional()?,
        Kind::Rule => conn
            .query_row(
                "SELECT id, name, model_name, statement, description, severity, builtin, field,
                        notes, status, owner_id, created_at, modified_at
                 FROM rule WHERE id = ?1",
                [id],
                |row| {
                    let severity_raw: i64 = row.get(5)?;
                    Ok(Entity::Rule(Rule {
                        meta: read_meta(row, 8)?,
                        name: row.get(1)?,
                        model_name: row.get(2)?,
                        statement: row.get(3)?,
                        description: row.get(4)?,
                        severity: Severity::from_i64(severity_raw)
                            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(5, severity_raw))?,
                        builtin: row.get(6)?,
                        field: row.get(7)?,
                    }))
                },
            )
            .optional()?,
    };
    Ok(entity)
}

/// Insert a new entity row, assigning its id. Runs on the caller's
/// connection so the flush pipeline controls the transaction.
pub fn insert_entity(conn: &Connection, entity: &mut Entity) -> Result<i64> {
    let meta = entity.meta().clone();
    let result = match entity {
        Entity::Vrf(vrf) => conn.execute(
            "INSERT INTO vrf (name, notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                vrf.name,
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::Subnet(subnet) => conn.execute(
            "INSERT INTO subnet (name, vrf_id, l3vni, l2vni, vlan, dhcp, range_string,
                                 notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                subnet.name,
                subnet.vrf_id,
                network_id::to_stored(subnet.l3vni),
                network_id::to_stored(subnet.l2vni),
                network_id::to_stored(subnet.vlan),
                subnet.dhcp,
                subnet.range_string(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::DnsZone(zone) => conn.execute(
            "INSERT INTO dnszone (name, notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                zone.name,
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::DnsRecord(record) => conn.execute(
            "INSERT INTO dnsrecord (name, type, ttl, value, generated_ip,
                                    notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.name,
                record.rtype.as_str(),
                record.ttl,
                record.value,
                record.ip_value().map(|ip| ip.to_string()),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::DhcpRecord(record) => conn.execute(
            "INSERT INTO dhcprecord (ip, mac, notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.ip.to_string(),
                record.mac.to_string(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::Ip(row) => conn.execute(
            "INSERT INTO ip (ip, ip_sort, notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.ip.to_string(),
                ip_sort_key(&row.ip),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::Mac(row) => conn.execute(
            "INSERT INTO mac (mac, notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.mac.to_string(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::User(user) => conn.execute(
            "INSERT INTO user (username, password, fullname, email, role,
                               notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user.username,
                user.password,
                user.fullname,
                user.email,
                user.role.as_str(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
        Entity::Rule(rule) => conn.execute(
            "INSERT INTO rule (name, model_name, statement, description, severity, builtin, field,
                               notes, status, owner_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rule.name,
                rule.model_name,
                rule.statement,
                rule.description,
                rule.severity.as_i64(),
                rule.builtin,
                rule.field,
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.created_at),
                ts(&meta.modified_at)
            ],
        ),
    };
    result.map_err(map_sqlite_err)?;

    let id = conn.last_insert_rowid();
    entity.meta_mut().id = Some(id);
    write_children(conn, entity)?;
    Ok(id)
}

/// Update an existing entity row in place.
pub fn update_entity(conn: &Connection, entity: &Entity) -> Result<()> {
    let meta = entity.meta();
    let id = meta
        .id
        .ok_or_else(|| UdbError::Fatal("update of an entity without id".into()))?;
    let result = match entity {
        Entity::Vrf(vrf) => conn.execute(
            "UPDATE vrf SET name = ?1, notes = ?2, status = ?3, owner_id = ?4, modified_at = ?5
             WHERE id = ?6",
            params![
                vrf.name,
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::Subnet(subnet) => conn.execute(
            "UPDATE subnet SET name = ?1, vrf_id = ?2, l3vni = ?3, l2vni = ?4, vlan = ?5,
                    dhcp = ?6, range_string = ?7, notes = ?8, status = ?9, owner_id = ?10,
                    modified_at = ?11
             WHERE id = ?12",
            params![
                subnet.name,
                subnet.vrf_id,
                network_id::to_stored(subnet.l3vni),
                network_id::to_stored(subnet.l2vni),
                network_id::to_stored(subnet.vlan),
                subnet.dhcp,
                subnet.range_string(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::DnsZone(zone) => conn.execute(
            "UPDATE dnszone SET name = ?1, notes = ?2, status = ?3, owner_id = ?4, modified_at = ?5
             WHERE id = ?6",
            params![
                zone.name,
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::DnsRecord(record) => conn.execute(
            "UPDATE dnsrecord SET name = ?1, type = ?2, ttl = ?3, value = ?4, generated_ip = ?5,
                    notes = ?6, status = ?7, owner_id = ?8, modified_at = ?9
             WHERE id = ?10",
            params![
                record.name,
                record.rtype.as_str(),
                record.ttl,
                record.value,
                record.ip_value().map(|ip| ip.to_string()),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::DhcpRecord(record) => conn.execute(
            "UPDATE dhcprecord SET ip = ?1, mac = ?2, notes = ?3, status = ?4, owner_id = ?5,
                    modified_at = ?6
             WHERE id = ?7",
            params![
                record.ip.to_string(),
                record.mac.to_string(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::Ip(row) => conn.execute(
            "UPDATE ip SET ip = ?1, ip_sort = ?2, notes = ?3, status = ?4, owner_id = ?5,
                    modified_at = ?6
             WHERE id = ?7",
            params![
                row.ip.to_string(),
                ip_sort_key(&row.ip),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::Mac(row) => conn.execute(
            "UPDATE mac SET mac = ?1, notes = ?2, status = ?3, owner_id = ?4, modified_at = ?5
             WHERE id = ?6",
            params![
                row.mac.to_string(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::User(user) => conn.execute(
            "UPDATE user SET username = ?1, password = ?2, fullname = ?3, email = ?4, role = ?5,
                    notes = ?6, status = ?7, owner_id = ?8, modified_at = ?9
             WHERE id = ?10",
            params![
                user.username,
                user.password,
                user.fullname,
                user.email,
                user.role.as_str(),
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
        Entity::Rule(rule) => conn.execute(
            "UPDATE rule SET name = ?1, model_name = ?2, statement = ?3, description = ?4,
                    severity = ?5, builtin = ?6, field = ?7, notes = ?8, status = ?9,
                    owner_id = ?10, modified_at = ?11
             WHERE id = ?12",
            params![
                rule.name,
                rule.model_name,
                rule.statement,
                rule.description,
                rule.severity.as_i64(),
                rule.builtin,
                rule.field,
                meta.notes,
                meta.status.as_i64(),
                meta.owner_id,
                ts(&meta.modified_at),
                id
            ],
        ),
    };
    result.map_err(map_sqlite_err)?;
    write_children(conn, entity)?;
    Ok(())
}

/// Rewrite dependent rows (subnet ranges, zone links) after the parent write.
fn write_children(conn: &Connection, entity: &Entity) -> Result<()> {
    match entity {
        Entity::Subnet(subnet) => {
            let id = subnet.meta.id.expect("subnet id assigned before children");
            conn.execute("DELETE FROM subnet_range WHERE subnet_id = ?1", [id])?;
            for range in &subnet.ranges {
                conn.execute(
                    "INSERT INTO subnet_range (subnet_id, vrf_id, subnet_status, range,
                                               version, start_ip, end_ip)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        subnet.vrf_id,
                        subnet.meta.status.as_i64(),
                        range.to_string(),
                        range.family().as_u8() as i64,
                        range.start_key(),
                        range.end_key()
                    ],
                )
                .map_err(map_sqlite_err)?;
            }
            conn.execute("DELETE FROM dnszone_subnet WHERE subnet_id = ?1", [id])?;
            for zone_id in &subnet.dnszone_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO dnszone_subnet (dnszone_id, subnet_id) VALUES (?1, ?2)",
                    params![zone_id, id],
                )?;
            }
        }
        Entity::DnsZone(zone) => {
            let id = zone.meta.id.expect("zone id assigned before children");
            conn.execute("DELETE FROM dnszone_subnet WHERE dnszone_id = ?1", [id])?;
            for subnet_id in &zone.subnet_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO dnszone_subnet (dnszone_id, subnet_id) VALUES (?1, ?2)",
                    params![id, subnet_id],
                )?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Append an audit message and mirror it into the message search table.
pub(crate) fn insert_message(conn: &Connection, message: &mut Message) -> Result<i64> {
    conn.execute(
        "INSERT INTO message (model_name, model_id, author_id, type, body, changes, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.model_name,
            message.model_id,
            message.author_id,
            message.mtype.as_str(),
            message.body,
            message.changes_json(),
            ts(&message.date)
        ],
    )?;
    let id = conn.last_insert_rowid();
    message.id = Some(id);
    conn.execute(
        "INSERT INTO message_search (body, changes, model_name, model_id)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            message.body,
            message.changes_json().unwrap_or_default(),
            message.model_name,
            message.model_id
        ],
    )?;
    Ok(id)
}

fn map_sqlite_err(e: rusqlite::Error) -> UdbError {
    if let rusqlite::Error::SqliteFailure(err, Some(msg)) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            if let Some(field) = conflict_field(msg) {
                return UdbError::Conflict { field };
            }
        }
    }
    UdbError::Database(e)
}

/// Map a unique-index violation message to the field reported to the caller.
fn conflict_field(msg: &str) -> Option<String> {
    const FIELDS: &[(&str, &str)] = &[
        ("user_username_unique_ix", "username"),
        ("user.username", "username"),
        ("user_email_unique_ix", "email"),
        ("user.email", "email"),
        ("vrf_name_unique_ix", "name"),
        ("vrf.name", "name"),
        ("dnszone_name_unique_ix", "name"),
        ("dnsrecord_identity_unique_ix", "value"),
        ("dhcprecord_identity_unique_ix", "ip"),
        ("subnet_range_vrf_unique_ix", "ranges"),
        ("ip_ip_unique_ix", "ip"),
        ("mac_mac_unique_ix", "mac"),
        ("rule_name_unique_ix", "name"),
    ];
    FIELDS
        .iter()
        .find(|(needle, _)| msg.contains(needle))
        .map(|(_, field)| (*field).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::open_temp;

    fn store() -> (tempfile::TempDir, Store) {
        let (guard, db) = open_temp();
        (guard, db.store())
    }

    fn insert(store: &Store, mut entity: Entity) -> i64 {
        let conn = store.conn().unwrap();
        insert_entity(&conn, &mut entity).unwrap()
    }

    #[test]
    fn test_vrf_round_trip() {
        let (_guard, store) = store();
        let id = insert(&store, Entity::Vrf(Vrf::new("infra")));

        match store.get(Kind::Vrf, id).unwrap() {
            Entity::Vrf(vrf) => {
                assert_eq!(vrf.name, "infra");
                assert_eq!(vrf.meta.status, Status::Enabled);
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_guard, store) = store();
        match store.get(Kind::Vrf, 999) {
            Err(UdbError::NotFound { kind, id }) => {
                assert_eq!(kind, "vrf");
                assert_eq!(id, 999);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_subnet_round_trip_with_ranges() {
        let (_guard, store) = store();
        let vrf_id = insert(&store, Entity::Vrf(Vrf::new("default")));
        let mut subnet = Subnet::new(
            "DMZ",
            vrf_id,
            vec![
                Cidr::parse("147.87.250.0/24").unwrap(),
                Cidr::parse("2a07:6b40::/32").unwrap(),
            ],
        );
        subnet.vlan = Some(14);
        let id = insert(&store, Entity::Subnet(subnet));

        match store.get(Kind::Subnet, id).unwrap() {
            Entity::Subnet(loaded) => {
                assert_eq!(loaded.vlan, Some(14));
                assert_eq!(loaded.l3vni, None);
                assert_eq!(loaded.ranges.len(), 2);
                // v4 sorts before v6
                assert_eq!(loaded.ranges[0].to_string(), "147.87.250.0/24");
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_username_case_insensitive() {
        let (_guard, store) = store();
        insert(&store, Entity::User(User::new("MyUsername")));

        let conn = store.conn().unwrap();
        let err = insert_entity(&conn, &mut Entity::User(User::new("myusername"))).unwrap_err();
        match err {
            UdbError::Conflict { field } => assert_eq!(field, "username"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_email_never_collides() {
        let (_guard, store) = store();
        let mut user1 = User::new("user1");
        user1.email = Some(String::new());
        let mut user2 = User::new("user2");
        user2.email = Some(String::new());
        let mut user3 = User::new("user3");
        let mut user4 = User::new("user4");
        user3.email = None;
        user4.email = None;

        insert(&store, Entity::User(user1));
        insert(&store, Entity::User(user2));
        insert(&store, Entity::User(user3));
        insert(&store, Entity::User(user4));
        assert_eq!(store.count(Kind::User, &Filter::default()).unwrap(), 4);
    }

    #[test]
    fn test_deleted_rows_do_not_collide() {
        let (_guard, store) = store();
        let id = insert(&store, Entity::Vrf(Vrf::new("infra")));

        let conn = store.conn().unwrap();
        let mut deleted = store.get(Kind::Vrf, id).unwrap();
        deleted.meta_mut().status = Status::Deleted;
        update_entity(&conn, &deleted).unwrap();

        // Same name is allowed again once the first row is soft-deleted.
        insert_entity(&conn, &mut Entity::Vrf(Vrf::new("infra"))).unwrap();
        assert_eq!(store.count(Kind::Vrf, &Filter::default()).unwrap(), 1);
        let all = Filter {
            include_deleted: true,
            ..Filter::default()
        };
        assert_eq!(store.count(Kind::Vrf, &all).unwrap(), 2);
    }

    #[test]
    fn test_query_substring_filter() {
        let (_guard, store) = store();
        insert(&store, Entity::Vrf(Vrf::new("infra")));
        insert(&store, Entity::Vrf(Vrf::new("client")));

        let filter = Filter {
            substring: Some("inf".into()),
            ..Filter::default()
        };
        let rows = store.query(Kind::Vrf, &filter, Paging::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].summary(), "infra");
    }

    #[test]
    fn test_query_cidr_filter() {
        let (_guard, store) = store();
        let mut inside = Entity::DhcpRecord(DhcpRecord::new(
            "147.87.250.10".parse().unwrap(),
            Mac::parse("02:42:d7:e4:aa:59").unwrap(),
        ));
        let mut outside = Entity::DhcpRecord(DhcpRecord::new(
            "10.0.0.1".parse().unwrap(),
            Mac::parse("02:42:d7:e4:aa:5a").unwrap(),
        ));
        let conn = store.conn().unwrap();
        insert_entity(&conn, &mut inside).unwrap();
        insert_entity(&conn, &mut outside).unwrap();

        let filter = Filter {
            cidr: Some(Cidr::parse("147.87.250.0/24").unwrap()),
            ..Filter::default()
        };
        let rows = store.query(Kind::DhcpRecord, &filter, Paging::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].summary().starts_with("147.87.250.10"));
    }

    #[test]
    fn test_longest_zone_match() {
        let (_guard, store) = store();
        insert(&store, Entity::DnsZone(DnsZone::new("bfh.ch")));
        insert(&store, Entity::DnsZone(DnsZone::new("foo.bfh.ch")));

        let zone = store.longest_zone_match("www.foo.bfh.ch").unwrap().unwrap();
        assert_eq!(zone.name, "foo.bfh.ch");
        let zone = store.longest_zone_match("bar.bfh.ch").unwrap().unwrap();
        assert_eq!(zone.name, "bfh.ch");
        assert!(store.longest_zone_match("example.com").unwrap().is_none());
        // No suffix match on a partial label
        assert!(store.longest_zone_match("notbfh.ch").unwrap().is_none());
    }

    #[test]
    fn test_followers_deduplicated() {
        let (_guard, store) = store();
        let user_id = insert(&store, Entity::User(User::new("observer")));
        let vrf_id = insert(&store, Entity::Vrf(Vrf::new("infra")));

        store.follow(Kind::Vrf, vrf_id, user_id).unwrap();
        store.follow(Kind::Vrf, vrf_id, user_id).unwrap();
        assert_eq!(store.followers(Kind::Vrf, vrf_id).unwrap().len(), 1);
        assert!(store.is_following(Kind::Vrf, vrf_id, user_id).unwrap());

        store.unfollow(Kind::Vrf, vrf_id, user_id).unwrap();
        assert!(!store.is_following(Kind::Vrf, vrf_id, user_id).unwrap());
    }

    #[test]
    fn test_messages_ordered_by_date_then_id() {
        let (_guard, store) = store();
        let vrf_id = insert(&store, Entity::Vrf(Vrf::new("infra")));
        let conn = store.conn().unwrap();

        let date = Utc::now();
        for body in ["first", "second"] {
            let mut message = Message::comment(Kind::Vrf, vrf_id, None, body);
            message.date = date;
            insert_message(&conn, &mut message).unwrap();
        }
        let messages = store.messages_for(Kind::Vrf, vrf_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, "first");
        assert_eq!(messages[1].body, "second");
    }
}
