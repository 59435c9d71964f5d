//! CIDR SQL functions
//!
//! SQLite has no inet type, so the containment and family operators used by
//! query filters and rule statements are registered as scalar functions on
//! every pooled connection. All of them accept a textual CIDR or bare
//! address and return NULL on NULL input.

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::net::Cidr;

fn parse_net(value: &str) -> rusqlite::Result<Cidr> {
    Cidr::parse_normalized(value).map_err(|e| {
        rusqlite::Error::UserFunctionError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            e.to_string(),
        )))
    })
}

/// Register the network functions on one connection.
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("family", 1, flags, |ctx| {
        let value: Option<String> = ctx.get(0)?;
        value
            .map(|v| parse_net(&v).map(|n| n.family().as_u8() as i64))
            .transpose()
    })?;

    conn.create_scalar_function("host", 1, flags, |ctx| {
        let value: Option<String> = ctx.get(0)?;
        value
            .map(|v| parse_net(&v).map(|n| n.network().to_string()))
            .transpose()
    })?;

    conn.create_scalar_function("masklen", 1, flags, |ctx| {
        let value: Option<String> = ctx.get(0)?;
        value
            .map(|v| parse_net(&v).map(|n| n.prefix_len() as i64))
            .transpose()
    })?;

    conn.create_scalar_function("inet_sortable", 1, flags, |ctx| {
        let value: Option<String> = ctx.get(0)?;
        value.map(|v| parse_net(&v).map(|n| n.start_key())).transpose()
    })?;

    conn.create_scalar_function("subnet_of", 2, flags, |ctx| {
        let left: Option<String> = ctx.get(0)?;
        let right: Option<String> = ctx.get(1)?;
        match (left, right) {
            (Some(l), Some(r)) => {
                let l = parse_net(&l)?;
                let r = parse_net(&r)?;
                Ok(l.family() == r.family() && l != r && r.contains(&l))
            }
            _ => Ok(false),
        }
    })?;

    conn.create_scalar_function("subnet_of_or_equals", 2, flags, |ctx| {
        let left: Option<String> = ctx.get(0)?;
        let right: Option<String> = ctx.get(1)?;
        match (left, right) {
            (Some(l), Some(r)) => {
                let l = parse_net(&l)?;
                let r = parse_net(&r)?;
                Ok(l.family() == r.family() && r.contains(&l))
            }
            _ => Ok(false),
        }
    })?;

    Ok(())
}
