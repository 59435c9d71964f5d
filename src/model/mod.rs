//! Entity model
//!
//! Plain data records for every tracked entity kind. Entities carry a common
//! [`Meta`] block (id, soft-delete status, owner, notes, timestamps) next to
//! their own fields; persistence lives in [`crate::store`], consistency hooks
//! in [`crate::session`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, UdbError};

mod message;
mod network;
mod records;
mod rule;
mod user;

pub use message::{Follower, Message, MessageType};
pub use network::{DnsZone, Subnet, Vrf};
pub use records::{DhcpRecord, DnsRecord, IpRow, MacRow, RecordType};
pub use rule::{Rule, RuleViolation, Severity};
pub use user::{Role, User};

/// Soft-delete status carried by every entity.
///
/// Deleted rows stay in the database and keep their history; they only
/// disappear from default queries and from uniqueness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Deleted,
    Disabled,
    Enabled,
}

impl Status {
    pub fn as_i64(self) -> i64 {
        match self {
            Status::Deleted => 0,
            Status::Disabled => 1,
            Status::Enabled => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Status> {
        match value {
            0 => Ok(Status::Deleted),
            1 => Ok(Status::Disabled),
            2 => Ok(Status::Enabled),
            other => Err(UdbError::Fatal(format!("invalid status value {other}"))),
        }
    }

    pub fn is_deleted(self) -> bool {
        matches!(self, Status::Deleted)
    }
}

/// Entity kind discriminator, used to address rows across the weakly-linked
/// tables (messages, followers, rule violations, search projection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    User,
    Vrf,
    Subnet,
    DnsZone,
    DnsRecord,
    DhcpRecord,
    Rule,
    Ip,
    Mac,
}

impl Kind {
    /// Table name, also the `model_name` value stored in weak links.
    pub fn table(self) -> &'static str {
        match self {
            Kind::User => "user",
            Kind::Vrf => "vrf",
            Kind::Subnet => "subnet",
            Kind::DnsZone => "dnszone",
            Kind::DnsRecord => "dnsrecord",
            Kind::DhcpRecord => "dhcprecord",
            Kind::Rule => "rule",
            Kind::Ip => "ip",
            Kind::Mac => "mac",
        }
    }

    pub fn from_table(name: &str) -> Option<Kind> {
        match name {
            "user" => Some(Kind::User),
            "vrf" => Some(Kind::Vrf),
            "subnet" => Some(Kind::Subnet),
            "dnszone" => Some(Kind::DnsZone),
            "dnsrecord" => Some(Kind::DnsRecord),
            "dhcprecord" => Some(Kind::DhcpRecord),
            "rule" => Some(Kind::Rule),
            "ip" => Some(Kind::Ip),
            "mac" => Some(Kind::Mac),
            _ => None,
        }
    }

    /// Human-facing name used in notifications and audit rendering.
    pub fn display_name(self) -> &'static str {
        match self {
            Kind::User => "User",
            Kind::Vrf => "VRF",
            Kind::Subnet => "Subnet",
            Kind::DnsZone => "DNS Zone",
            Kind::DnsRecord => "DNS Record",
            Kind::DhcpRecord => "DHCP Record",
            Kind::Rule => "Rule",
            Kind::Ip => "IP Address",
            Kind::Mac => "MAC Address",
        }
    }

    /// Write order inside a flush: referenced tables first, synthesised
    /// aggregate rows last.
    pub fn flush_rank(self) -> u8 {
        match self {
            Kind::User => 0,
            Kind::Vrf => 1,
            Kind::Subnet => 2,
            Kind::DnsZone => 3,
            Kind::DnsRecord => 4,
            Kind::DhcpRecord => 5,
            Kind::Rule => 6,
            Kind::Ip => 7,
            Kind::Mac => 8,
        }
    }

    /// Kinds federated into the search projection.
    pub fn searchable() -> &'static [Kind] {
        &[
            Kind::DhcpRecord,
            Kind::DnsRecord,
            Kind::DnsZone,
            Kind::Subnet,
            Kind::Vrf,
        ]
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Common columns shared by every entity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub id: Option<i64>,
    pub status: Status,
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Default for Meta {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: None,
            status: Status::Enabled,
            owner_id: None,
            notes: String::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Change set computed at commit time: `field -> (old, new)`, technical
/// fields omitted. Serialised as `{"field": [old, new]}` inside messages.
pub type ChangeSet = BTreeMap<String, (Value, Value)>;

/// Render a change set to its stored JSON form.
pub fn changes_to_json(changes: &ChangeSet) -> Value {
    let map: serde_json::Map<String, Value> = changes
        .iter()
        .map(|(k, (old, new))| (k.clone(), Value::Array(vec![old.clone(), new.clone()])))
        .collect();
    Value::Object(map)
}

/// Parse a stored change payload back into a change set. Non-conforming
/// payloads (free-text bodies) yield `None`.
pub fn changes_from_json(value: &Value) -> Option<ChangeSet> {
    let map = value.as_object()?;
    let mut out = ChangeSet::new();
    for (k, v) in map {
        let arr = v.as_array()?;
        if arr.len() != 2 {
            return None;
        }
        out.insert(k.clone(), (arr[0].clone(), arr[1].clone()));
    }
    Some(out)
}

/// Diff two audit field maps, omitting unchanged fields.
pub fn diff_fields(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, new_value) in new {
        let old_value = old.get(key).cloned().unwrap_or(Value::Null);
        if &old_value != new_value {
            changes.insert(key.clone(), (old_value, new_value.clone()));
        }
    }
    for (key, old_value) in old {
        if !new.contains_key(key) {
            changes.insert(key.clone(), (old_value.clone(), Value::Null));
        }
    }
    changes
}

/// Resolve referenced row ids to their display names so audit entries stay
/// readable after renames. Implemented by the store; [`NoLookup`] serves
/// detached contexts (tests, imports).
pub trait NameLookup {
    fn user_name(&self, id: i64) -> Option<String>;
    fn vrf_name(&self, id: i64) -> Option<String>;
    fn zone_name(&self, id: i64) -> Option<String>;
    fn subnet_name(&self, id: i64) -> Option<String>;
}

/// Name resolver that resolves nothing; ids fall back to `#id` strings.
pub struct NoLookup;

impl NameLookup for NoLookup {
    fn user_name(&self, _id: i64) -> Option<String> {
        None
    }
    fn vrf_name(&self, _id: i64) -> Option<String> {
        None
    }
    fn zone_name(&self, _id: i64) -> Option<String> {
        None
    }
    fn subnet_name(&self, _id: i64) -> Option<String> {
        None
    }
}

pub(crate) fn ref_value(id: Option<i64>, name: Option<String>) -> Value {
    match (id, name) {
        (Some(_), Some(name)) => Value::String(name),
        (Some(id), None) => Value::String(format!("#{id}")),
        (None, _) => Value::Null,
    }
}

/// A tracked entity of any kind.
#[derive(Debug, Clone)]
pub enum Entity {
    Vrf(Vrf),
    Subnet(Subnet),
    DnsZone(DnsZone),
    DnsRecord(DnsRecord),
    DhcpRecord(DhcpRecord),
    Ip(IpRow),
    Mac(MacRow),
    User(User),
    Rule(Rule),
}

macro_rules! for_each_entity {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Entity::Vrf($inner) => $body,
            Entity::Subnet($inner) => $body,
            Entity::DnsZone($inner) => $body,
            Entity::DnsRecord($inner) => $body,
            Entity::DhcpRecord($inner) => $body,
            Entity::Ip($inner) => $body,
            Entity::Mac($inner) => $body,
            Entity::User($inner) => $body,
            Entity::Rule($inner) => $body,
        }
    };
}

impl Entity {
    pub fn kind(&self) -> Kind {
        match self {
            Entity::Vrf(_) => Kind::Vrf,
            Entity::Subnet(_) => Kind::Subnet,
            Entity::DnsZone(_) => Kind::DnsZone,
            Entity::DnsRecord(_) => Kind::DnsRecord,
            Entity::DhcpRecord(_) => Kind::DhcpRecord,
            Entity::Ip(_) => Kind::Ip,
            Entity::Mac(_) => Kind::Mac,
            Entity::User(_) => Kind::User,
            Entity::Rule(_) => Kind::Rule,
        }
    }

    pub fn meta(&self) -> &Meta {
        for_each_entity!(self, e => &e.meta)
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        for_each_entity!(self, e => &mut e.meta)
    }

    pub fn id(&self) -> Option<i64> {
        self.meta().id
    }

    pub fn status(&self) -> Status {
        self.meta().status
    }

    /// One-line display string used in tables, audit entries and search.
    pub fn summary(&self) -> String {
        for_each_entity!(self, e => e.summary())
    }

    /// Synchronous, relation-free validation; relational invariants are
    /// covered by flush hooks and enforced rules.
    pub fn validate(&self) -> Result<()> {
        for_each_entity!(self, e => e.validate())
    }

    /// User-meaningful fields for audit diffing. Reference columns resolve to
    /// display names through `names`.
    pub fn audit_fields(&self, names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = for_each_entity!(self, e => e.audit_fields(names));
        let meta = self.meta();
        fields.insert("notes".into(), Value::String(meta.notes.clone()));
        fields.insert("status".into(), Value::from(meta.status.as_i64()));
        fields.insert(
            "owner".into(),
            ref_value(meta.owner_id, meta.owner_id.and_then(|id| names.user_name(id))),
        );
        fields
    }

    /// Serialise to the wire row shape used by `data.json` endpoints.
    pub fn to_json(&self) -> Value {
        let mut value = for_each_entity!(self, e => serde_json::to_value(e).unwrap_or(Value::Null));
        if let Value::Object(map) = &mut value {
            map.insert("summary".into(), Value::String(self.summary()));
        }
        value
    }
}
