//! DNS and DHCP records plus the synthesised IP / MAC aggregate rows

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::network::is_domain_name;
use super::{Meta, NameLookup};
use crate::error::{Result, UdbError};
use crate::net::Mac;

/// Closed set of supported DNS record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "PTR")]
    Ptr,
    #[serde(rename = "CNAME")]
    Cname,
    #[serde(rename = "NS")]
    Ns,
    #[serde(rename = "MX")]
    Mx,
    #[serde(rename = "TXT")]
    Txt,
    #[serde(rename = "SOA")]
    Soa,
    #[serde(rename = "SRV")]
    Srv,
    #[serde(rename = "CAA")]
    Caa,
}

impl RecordType {
    pub const ALL: [RecordType; 10] = [
        RecordType::A,
        RecordType::Aaaa,
        RecordType::Ptr,
        RecordType::Cname,
        RecordType::Ns,
        RecordType::Mx,
        RecordType::Txt,
        RecordType::Soa,
        RecordType::Srv,
        RecordType::Caa,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Ptr => "PTR",
            RecordType::Cname => "CNAME",
            RecordType::Ns => "NS",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Soa => "SOA",
            RecordType::Srv => "SRV",
            RecordType::Caa => "CAA",
        }
    }
}

impl FromStr for RecordType {
    type Err = UdbError;

    fn from_str(s: &str) -> Result<Self> {
        RecordType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| UdbError::validation("type", format!("`{s}` is not a supported record type")))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A DNS record. Names are stored lowercase; A/AAAA/PTR records expose the
/// address they describe through [`DnsRecord::ip_value`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(flatten)]
    pub meta: Meta,
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: RecordType,
    pub ttl: i64,
    pub value: String,
}

impl DnsRecord {
    pub fn new(name: impl Into<String>, rtype: RecordType, value: impl Into<String>) -> Self {
        let name: String = name.into();
        let value: String = value.into();
        Self {
            meta: Meta::default(),
            name: name.trim().to_lowercase(),
            rtype,
            ttl: 3600,
            value: value.trim().to_string(),
        }
    }

    pub fn summary(&self) -> String {
        format!("{} = {} ({})", self.name, self.value, self.rtype)
    }

    /// The hostname this record names. For PTR records that is the value.
    pub fn hostname(&self) -> &str {
        match self.rtype {
            RecordType::Ptr => &self.value,
            _ => &self.name,
        }
    }

    /// The IP address described by an A, AAAA or PTR record.
    pub fn ip_value(&self) -> Option<IpAddr> {
        match self.rtype {
            RecordType::A => self.value.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
            RecordType::Aaaa => self.value.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
            RecordType::Ptr => parse_reverse_ipv4(&self.name).or_else(|| parse_reverse_ipv6(&self.name)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !is_domain_name(self.hostname()) {
            let field = if self.rtype == RecordType::Ptr { "value" } else { "name" };
            return Err(UdbError::validation(field, "expected a valid FQDN"));
        }
        if self.value.is_empty() {
            return Err(UdbError::validation("value", "value must not be empty"));
        }
        if self.ttl <= 0 {
            return Err(UdbError::validation("ttl", "TTL must be positive"));
        }
        match self.rtype {
            RecordType::A => {
                if self.ip_value().is_none() {
                    return Err(UdbError::validation("value", "value must be a valid IPv4 address"));
                }
            }
            RecordType::Aaaa => {
                if self.ip_value().is_none() {
                    return Err(UdbError::validation("value", "value must be a valid IPv6 address"));
                }
            }
            RecordType::Ptr => {
                if self.ip_value().is_none() {
                    return Err(UdbError::validation(
                        "name",
                        "PTR records must end with `.in-addr.arpa` or `.ip6.arpa` \
                         and define a valid IPv4 or IPv6 address",
                    ));
                }
            }
            RecordType::Cname | RecordType::Ns => {
                if !is_domain_name(self.value.trim_end_matches('.')) {
                    return Err(UdbError::validation("value", "value must be a valid domain name"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn audit_fields(&self, _names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("name".into(), Value::String(self.name.clone()));
        fields.insert("type".into(), Value::String(self.rtype.to_string()));
        fields.insert("ttl".into(), Value::from(self.ttl));
        fields.insert("value".into(), Value::String(self.value.clone()));
        fields
    }
}

/// A DHCP reservation binding an IP address to a MAC address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpRecord {
    #[serde(flatten)]
    pub meta: Meta,
    pub ip: IpAddr,
    pub mac: Mac,
}

impl DhcpRecord {
    pub fn new(ip: IpAddr, mac: Mac) -> Self {
        Self {
            meta: Meta::default(),
            ip,
            mac,
        }
    }

    pub fn summary(&self) -> String {
        format!("{} ({})", self.ip, self.mac)
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    pub fn audit_fields(&self, _names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("ip".into(), Value::String(self.ip.to_string()));
        fields.insert("mac".into(), Value::String(self.mac.to_string()));
        fields
    }
}

/// Aggregate row for an IP address. Synthesised on first reference by any DNS
/// or DHCP record and never removed; carries notes and an owner of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRow {
    #[serde(flatten)]
    pub meta: Meta,
    pub ip: IpAddr,
}

impl IpRow {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            meta: Meta::default(),
            ip,
        }
    }

    pub fn summary(&self) -> String {
        self.ip.to_string()
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Reverse DNS pointer name for this address.
    pub fn reverse_pointer(&self) -> String {
        reverse_pointer(&self.ip)
    }

    pub fn audit_fields(&self, _names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("ip".into(), Value::String(self.ip.to_string()));
        fields
    }
}

/// Aggregate row for a MAC address, same lifecycle as [`IpRow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacRow {
    #[serde(flatten)]
    pub meta: Meta,
    pub mac: Mac,
}

impl MacRow {
    pub fn new(mac: Mac) -> Self {
        Self {
            meta: Meta::default(),
            mac,
        }
    }

    pub fn summary(&self) -> String {
        self.mac.to_string()
    }

    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    pub fn audit_fields(&self, _names: &dyn NameLookup) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("mac".into(), Value::String(self.mac.to_string()));
        fields
    }
}

/// Reverse PTR name for any address, e.g. `4.3.2.1.in-addr.arpa`.
pub fn reverse_pointer(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for octet in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", octet & 0xf));
                nibbles.push(format!("{:x}", octet >> 4));
            }
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

/// Decode a reverse IPv4 name (`16.155.10.in-addr.arpa`) back into the
/// address it describes. Partial names resolve against a zero-filled address.
fn parse_reverse_ipv4(name: &str) -> Option<IpAddr> {
    let prefix = name.strip_suffix(".in-addr.arpa")?;
    let groups: Vec<&str> = prefix.split('.').collect();
    if groups.is_empty() || groups.len() > 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, part) in groups.iter().rev().enumerate() {
        octets[i] = part.parse::<u8>().ok()?;
    }
    Some(IpAddr::V4(Ipv4Addr::from(octets)))
}

/// Decode a full reverse IPv6 name (32 nibble labels under `.ip6.arpa`).
fn parse_reverse_ipv6(name: &str) -> Option<IpAddr> {
    let prefix = name.strip_suffix(".ip6.arpa")?;
    let groups: Vec<&str> = prefix.split('.').collect();
    if groups.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, part) in groups.iter().rev().enumerate() {
        if part.len() != 1 {
            return None;
        }
        let nibble = u8::from_str_radix(part, 16).ok()?;
        if i % 2 == 0 {
            octets[i / 2] = nibble << 4;
        } else {
            octets[i / 2] |= nibble;
        }
    }
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_round_trip() {
        for t in RecordType::ALL {
            assert_eq!(t.as_str().parse::<RecordType>().unwrap(), t);
        }
        assert!("SPF".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_a_record_requires_ipv4() {
        assert!(DnsRecord::new("foo.bfh.ch", RecordType::A, "147.87.250.3")
            .validate()
            .is_ok());
        assert!(DnsRecord::new("foo.bfh.ch", RecordType::A, "2001:db8::1")
            .validate()
            .is_err());
        assert!(DnsRecord::new("foo.bfh.ch", RecordType::A, "not-an-ip")
            .validate()
            .is_err());
    }

    #[test]
    fn test_aaaa_record_requires_ipv6() {
        assert!(DnsRecord::new("foo.bfh.ch", RecordType::Aaaa, "2001:db8::1")
            .validate()
            .is_ok());
        assert!(DnsRecord::new("foo.bfh.ch", RecordType::Aaaa, "147.87.250.3")
            .validate()
            .is_err());
    }

    #[test]
    fn test_ptr_record_name_must_be_reverse() {
        let ptr = DnsRecord::new("3.250.87.147.in-addr.arpa", RecordType::Ptr, "foo.bfh.ch");
        assert!(ptr.validate().is_ok());
        assert_eq!(ptr.ip_value(), Some("147.87.250.3".parse().unwrap()));

        let bad = DnsRecord::new("foo.bfh.ch", RecordType::Ptr, "bar.bfh.ch");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_ptr_ipv6_round_trip() {
        let addr: IpAddr = "2001:db8::567:89ab".parse().unwrap();
        let name = reverse_pointer(&addr);
        assert!(name.ends_with(".ip6.arpa"));
        let ptr = DnsRecord::new(&name, RecordType::Ptr, "foo.bfh.ch");
        assert_eq!(ptr.ip_value(), Some(addr));
    }

    #[test]
    fn test_record_summary_format() {
        let record = DnsRecord::new("foo.bfh.ch", RecordType::A, "147.87.250.3");
        assert_eq!(record.summary(), "foo.bfh.ch = 147.87.250.3 (A)");
    }

    #[test]
    fn test_record_name_lowercased() {
        let record = DnsRecord::new("Foo.BFH.ch", RecordType::A, "147.87.250.3");
        assert_eq!(record.name, "foo.bfh.ch");
    }

    #[test]
    fn test_cname_value_must_be_domain() {
        assert!(DnsRecord::new("bar.bfh.ch", RecordType::Cname, "www.bar.bfh.ch")
            .validate()
            .is_ok());
        assert!(DnsRecord::new("bar.bfh.ch", RecordType::Cname, "not valid!")
            .validate()
            .is_err());
    }

    #[test]
    fn test_dhcp_summary() {
        let record = DhcpRecord::new(
            "1.2.3.4".parse().unwrap(),
            Mac::parse("02:42:d7:e4:aa:59").unwrap(),
        );
        assert_eq!(record.summary(), "1.2.3.4 (02:42:d7:e4:aa:59)");
    }

    #[test]
    fn test_reverse_pointer_ipv4() {
        assert_eq!(
            reverse_pointer(&"147.87.250.3".parse().unwrap()),
            "3.250.87.147.in-addr.arpa"
        );
    }
}
