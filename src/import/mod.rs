//! Importers
//!
//! Bulk loaders behind `POST /load/`: the subnet CSV inventory export and
//! BIND AXFR text dumps. Both stage entities through the regular flush
//! pipeline so imported rows get the same validation, audit messages and
//! search indexing as interactive edits.

use std::collections::HashMap;

use serde::Serialize;

use crate::app::App;
use crate::error::{Result, UdbError};
use crate::model::{DnsRecord, DnsZone, Entity, RecordType, Subnet, Vrf};
use crate::net::Cidr;

/// What an import run created.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportStats {
    pub vrfs: usize,
    pub zones: usize,
    pub subnets: usize,
    pub records: usize,
    pub skipped: usize,
}

/// Expected CSV header of a subnet inventory export.
const SUBNET_HEADER: [&str; 9] = [
    "IPv6", "IPv4", "VRF", "L3VNI", "L2VNI", "VLAN", "TLD", "Name", "Description",
];

fn parse_int(value: &str) -> Result<Option<i64>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<i64>()
        .map(Some)
        .map_err(|_| UdbError::validation("upload_file", format!("`{trimmed}` is not a number")))
}

/// Import a subnet CSV export. VRFs and DNS zones are created on first
/// sight by name; subnets are staged into one unit of work and committed at
/// the end, so a bad row rejects every subnet of the file.
pub fn import_subnet_csv(app: &App, author_id: Option<i64>, data: &str) -> Result<ImportStats> {
    let mut lines = data.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| UdbError::validation("upload_file", "the CSV file is empty"))?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let index_of = |name: &str| -> Result<usize> {
        columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| UdbError::validation("upload_file", format!("missing CSV column `{name}`")))
    };
    let mut indices = HashMap::new();
    for name in SUBNET_HEADER {
        indices.insert(name, index_of(name)?);
    }
    let field = |row: &[&str], name: &str| -> String {
        row.get(indices[name]).map(|v| v.trim().to_string()).unwrap_or_default()
    };

    let mut stats = ImportStats::default();
    let mut vrf_cache: HashMap<String, i64> = HashMap::new();
    let mut zone_cache: HashMap<String, i64> = HashMap::new();
    let mut session = app.session(author_id);

    for (line_number, line) in lines.enumerate() {
        let row: Vec<&str> = line.split(',').collect();
        let with_line = |e: UdbError| match e {
            UdbError::Validation { field, message } => UdbError::Validation {
                field,
                message: format!("{message} (line {})", line_number + 2),
            },
            other => other,
        };

        let vrf_name = field(&row, "VRF");
        if vrf_name.is_empty() {
            return Err(UdbError::validation(
                "upload_file",
                format!("a VRF is required (line {})", line_number + 2),
            ));
        }
        let vrf_id = match vrf_cache.get(&vrf_name) {
            Some(id) => *id,
            None => {
                let id = match app.store.find_vrf_by_name(&vrf_name)? {
                    Some(vrf) => vrf.meta.id.expect("stored vrf has an id"),
                    None => {
                        stats.vrfs += 1;
                        app.create(author_id, Entity::Vrf(Vrf::new(&vrf_name)))
                            .map_err(with_line)?
                    }
                };
                vrf_cache.insert(vrf_name.clone(), id);
                id
            }
        };

        let zone_name = field(&row, "TLD");
        let zone_id = if zone_name.is_empty() {
            None
        } else {
            let key = zone_name.to_lowercase();
            match zone_cache.get(&key) {
                Some(id) => Some(*id),
                None => {
                    let id = match app.store.find_zone_by_name(&zone_name)? {
                        Some(zone) => zone.meta.id.expect("stored zone has an id"),
                        None => {
                            stats.zones += 1;
                            app.create(author_id, Entity::DnsZone(DnsZone::new(&zone_name)))
                                .map_err(with_line)?
                        }
                    };
                    zone_cache.insert(key, id);
                    Some(id)
                }
            }
        };

        let mut ranges = Vec::new();
        for column in ["IPv6", "IPv4"] {
            let raw = field(&row, column);
            if !raw.is_empty() {
                let cidr = Cidr::parse_normalized(&raw).map_err(|e| {
                    UdbError::validation("upload_file", format!("{e} (line {})", line_number + 2))
                })?;
                ranges.push(cidr);
            }
        }

        let mut subnet = Subnet::new(field(&row, "Name"), vrf_id, ranges);
        subnet.l3vni = parse_int(&field(&row, "L3VNI")).map_err(with_line)?;
        subnet.l2vni = parse_int(&field(&row, "L2VNI")).map_err(with_line)?;
        subnet.vlan = parse_int(&field(&row, "VLAN")).map_err(with_line)?;
        subnet.meta.notes = field(&row, "Description");
        subnet.dnszone_ids = zone_id.into_iter().collect();
        session.create(Entity::Subnet(subnet)).map_err(with_line)?;
        stats.subnets += 1;
    }

    session.commit()?;
    tracing::info!(
        "subnet CSV import: {} subnet(s), {} vrf(s), {} zone(s)",
        stats.subnets,
        stats.vrfs,
        stats.zones
    );
    Ok(stats)
}

/// Import DNS records from a BIND AXFR text dump. Lines look like
/// `bfh.ch. 600 IN A 147.87.0.240`; comments and unsupported record types
/// are skipped.
pub fn import_zone_records(app: &App, author_id: Option<i64>, data: &str) -> Result<ImportStats> {
    let line_re = regex::Regex::new(r"^(\S+)\s+(\d+)\s+IN\s+(\S+)\s+(.+)$").expect("static regex");

    let mut stats = ImportStats::default();
    let mut session = app.session(author_id);

    for line in data.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        let Some(captures) = line_re.captures(trimmed) else {
            stats.skipped += 1;
            tracing::debug!("skipping unparseable zone line: {}", trimmed);
            continue;
        };
        let rtype = match captures[3].parse::<RecordType>() {
            Ok(rtype) => rtype,
            Err(_) => {
                stats.skipped += 1;
                tracing::debug!("skipping unsupported record type {}", &captures[3]);
                continue;
            }
        };
        let name = captures[1].trim_end_matches('.');
        let ttl: i64 = captures[2]
            .parse()
            .map_err(|_| UdbError::validation("upload_file", "invalid TTL"))?;
        let value = match rtype {
            // Domain-valued records drop the absolute-name dot.
            RecordType::Cname | RecordType::Ns | RecordType::Ptr => {
                captures[4].trim().trim_end_matches('.').to_string()
            }
            _ => captures[4].trim().to_string(),
        };

        let mut record = DnsRecord::new(name, rtype, value);
        record.ttl = ttl;
        session.create(Entity::DnsRecord(record))?;
        stats.records += 1;
    }

    session.commit()?;
    tracing::info!(
        "zone import: {} record(s), {} skipped",
        stats.records,
        stats.skipped
    );
    Ok(stats)
}

/// Dispatch for the `/load/` importer entry point.
pub fn import_file(app: &App, author_id: Option<i64>, type_file: &str, data: &str) -> Result<ImportStats> {
    match type_file {
        "subnet" => import_subnet_csv(app, author_id, data),
        "dnsrecord" => import_zone_records(app, author_id, data),
        other => Err(UdbError::validation(
            "type_file",
            format!("unsupported import type `{other}`"),
        )),
    }
}
