//! VRF, Subnet and DNS zone entities

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ref_value, Meta, NameLookup};
use crate::error::{Result, UdbError};
use crate::net::Cidr;

/// Virtual Routing and Forwarding instance: a routing-table namespace every
/// subnet belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vrf {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
}

impl Vrf {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            meta: Meta::default(),
            name: name.trim().to_string(),
        }
    }

    pub fn summary(&self) -> String {
        self.name.clone()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(UdbError::validation("name", "VRF name cannot be empty"));
        }
        Ok(())
    }

    pub fn audit_fields(&self, _names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("name".into(), Value::String(self.name.clone()));
        fields
    }
}

/// A named set of CIDR ranges within a VRF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    pub vrf_id: i64,
    pub l3vni: Option<i64>,
    pub l2vni: Option<i64>,
    pub vlan: Option<i64>,
    pub dhcp: bool,
    pub ranges: Vec<Cidr>,
    /// DNS zones allowed to hold records inside this subnet
    #[serde(default)]
    pub dnszone_ids: Vec<i64>,
}

impl Subnet {
    pub fn new(name: impl Into<String>, vrf_id: i64, ranges: Vec<Cidr>) -> Self {
        Self {
            meta: Meta::default(),
            name: name.into(),
            vrf_id,
            l3vni: None,
            l2vni: None,
            vlan: None,
            dhcp: false,
            ranges,
            dnszone_ids: Vec::new(),
        }
    }

    pub fn summary(&self) -> String {
        self.name.clone()
    }

    /// Flattened text of all ranges, indexed for search.
    pub fn range_string(&self) -> String {
        self.ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Sort ranges into canonical order and drop duplicates. Called from the
    /// before-flush hook so stored order is deterministic.
    pub fn normalize_ranges(&mut self) {
        self.ranges.sort();
        self.ranges.dedup();
        self.dnszone_ids.sort_unstable();
        self.dnszone_ids.dedup();
    }

    pub fn validate(&self) -> Result<()> {
        if self.ranges.is_empty() {
            return Err(UdbError::validation(
                "ranges",
                "at least one IPv6 or IPv4 network is required",
            ));
        }
        // Ranges of one subnet must not overlap or nest into each other.
        for (i, a) in self.ranges.iter().enumerate() {
            for b in self.ranges.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(UdbError::validation(
                        "ranges",
                        format!("`{a}` and `{b}` overlap within the same subnet"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn audit_fields(&self, names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("name".into(), Value::String(self.name.clone()));
        fields.insert(
            "vrf".into(),
            ref_value(Some(self.vrf_id), names.vrf_name(self.vrf_id)),
        );
        fields.insert("l3vni".into(), self.l3vni.map(Value::from).unwrap_or(Value::Null));
        fields.insert("l2vni".into(), self.l2vni.map(Value::from).unwrap_or(Value::Null));
        fields.insert("vlan".into(), self.vlan.map(Value::from).unwrap_or(Value::Null));
        fields.insert("dhcp".into(), Value::Bool(self.dhcp));
        fields.insert(
            "ranges".into(),
            Value::Array(
                self.ranges
                    .iter()
                    .map(|r| Value::String(r.to_string()))
                    .collect(),
            ),
        );
        fields.insert(
            "dnszones".into(),
            Value::Array(
                self.dnszone_ids
                    .iter()
                    .map(|id| ref_value(Some(*id), names.zone_name(*id)))
                    .collect(),
            ),
        );
        fields
    }
}

/// A DNS zone; the dotted name is stored lowercase and is unique among
/// non-deleted zones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsZone {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    /// Subnets whose addresses this zone may name
    #[serde(default)]
    pub subnet_ids: Vec<i64>,
}

impl DnsZone {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            meta: Meta::default(),
            name: name.trim().to_lowercase(),
            subnet_ids: Vec::new(),
        }
    }

    pub fn summary(&self) -> String {
        self.name.clone()
    }

    pub fn validate(&self) -> Result<()> {
        if !is_domain_name(&self.name) || !self.name.contains('.') {
            return Err(UdbError::validation("name", "expected a valid FQDN"));
        }
        Ok(())
    }

    pub fn audit_fields(&self, names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("name".into(), Value::String(self.name.clone()));
        fields.insert(
            "subnets".into(),
            Value::Array(
                self.subnet_ids
                    .iter()
                    .map(|id| ref_value(Some(*id), names.subnet_name(*id)))
                    .collect(),
            ),
        );
        fields
    }
}

/// Loose domain-name check shared by zones and records: dot-separated labels
/// of letters, digits, `-` and `_`, with `*` allowed as the leftmost label.
pub fn is_domain_name(value: &str) -> bool {
    if value.is_empty() || value.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = value.split('.').collect();
    labels.iter().enumerate().all(|(i, label)| {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if *label == "*" {
            return i == 0;
        }
        label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}
