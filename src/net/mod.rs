//! Network value types
//!
//! CIDR ranges, MAC addresses and the undefined-network-id sentinel shared by
//! every network entity. Ranges are kept canonical (host bits zero) from the
//! moment they are parsed, so the rest of the core never has to re-check.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::UdbError;

/// Address family of an IP or CIDR value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Numeric form stored in the database (`family()` SQL function)
    pub fn as_u8(self) -> u8 {
        match self {
            Family::V4 => 4,
            Family::V6 => 6,
        }
    }

    pub fn of(ip: &IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Parse failure for any network value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub input: String,
    pub reason: String,
}

impl ParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`: {}", self.input, self.reason)
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for UdbError {
    fn from(e: ParseError) -> Self {
        UdbError::Validation {
            field: "value".to_string(),
            message: e.to_string(),
        }
    }
}

/// A canonical CIDR range: address plus prefix, host bits zeroed.
///
/// Ordering is by numeric network address first, then prefix length with the
/// broader range first, which yields the natural containment-tree order when
/// ranges are sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr(IpNet);

impl Cidr {
    /// Parse a CIDR string, rejecting non-canonical input (host bits set).
    pub fn parse(s: &str) -> Result<Cidr, ParseError> {
        let trimmed = s.trim();
        let net: IpNet = trimmed
            .parse()
            .map_err(|_| ParseError::new(trimmed, "does not appear to be a valid IPv6 or IPv4 network"))?;
        if net.addr() != net.network() {
            return Err(ParseError::new(trimmed, "host bits must be zero"));
        }
        Ok(Cidr(net))
    }

    /// Parse a CIDR string, zeroing host bits instead of rejecting them.
    /// A bare address is accepted as a full-length prefix.
    pub fn parse_normalized(s: &str) -> Result<Cidr, ParseError> {
        let trimmed = s.trim();
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Cidr(IpNet::from(ip)));
        }
        let net: IpNet = trimmed
            .parse()
            .map_err(|_| ParseError::new(trimmed, "does not appear to be a valid IPv6 or IPv4 network"))?;
        Ok(Cidr(net.trunc()))
    }

    pub fn family(&self) -> Family {
        match self.0 {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// First address of the range
    pub fn network(&self) -> IpAddr {
        self.0.network()
    }

    /// Last address of the range
    pub fn broadcast(&self) -> IpAddr {
        self.0.broadcast()
    }

    /// True when `ip` falls inside this range.
    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }

    /// True when `other` is equal to or nested inside this range.
    pub fn contains(&self, other: &Cidr) -> bool {
        self.0.contains(&other.0)
    }

    /// True when the two ranges share any address.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.family() == other.family() && (self.contains(other) || other.contains(self))
    }

    /// Enumerate every supernet of this range, nearest first (`/p-1` … `/0`).
    pub fn supernets(&self) -> Vec<Cidr> {
        let mut out = Vec::with_capacity(self.prefix_len() as usize);
        let mut cur = self.0;
        while let Some(sup) = cur.supernet() {
            out.push(Cidr(sup.trunc()));
            cur = sup;
        }
        out
    }

    /// Sortable big-endian key: `[family, address bytes…]` for the first
    /// address of the range. Shared with the `ip_sort_key` encoding so IPs and
    /// range bounds compare against each other in SQL.
    pub fn start_key(&self) -> Vec<u8> {
        ip_sort_key(&self.network())
    }

    /// Sortable key for the last address of the range.
    pub fn end_key(&self) -> Vec<u8> {
        ip_sort_key(&self.broadcast())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Cidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cidr::parse(s)
    }
}

impl Ord for Cidr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_key()
            .cmp(&other.start_key())
            .then(self.prefix_len().cmp(&other.prefix_len()))
    }
}

impl PartialOrd for Cidr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cidr::parse_normalized(&s).map_err(serde::de::Error::custom)
    }
}

/// Sortable big-endian key for a bare address: `[family, address bytes…]`.
/// IPv4 sorts before IPv6 because of the leading family byte.
pub fn ip_sort_key(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => {
            let mut key = Vec::with_capacity(5);
            key.push(4u8);
            key.extend_from_slice(&v4.octets());
            key
        }
        IpAddr::V6(v6) => {
            let mut key = Vec::with_capacity(17);
            key.push(6u8);
            key.extend_from_slice(&v6.octets());
            key
        }
    }
}

/// Parse a bare IP address with a structured error.
pub fn parse_ip(s: &str) -> Result<IpAddr, ParseError> {
    let trimmed = s.trim();
    trimmed
        .parse()
        .map_err(|_| ParseError::new(trimmed, "must be a valid IPv4 or IPv6 address"))
}

/// A 48-bit MAC address, canonicalised to lowercase colon form.
///
/// Accepts `:`/`-` separated pairs, Cisco dotted quads (`aabb.ccdd.eeff`) and
/// bare 12-digit hex on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac([u8; 6]);

impl Mac {
    pub fn parse(s: &str) -> Result<Mac, ParseError> {
        let trimmed = s.trim();
        let hex: String = trimmed
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::new(trimmed, "expected a valid mac"));
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            // Slice bounds are safe: length checked above.
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseError::new(trimmed, "expected a valid mac"))?;
        }
        Ok(Mac(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for Mac {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mac::parse(s)
    }
}

impl Serialize for Mac {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Mac::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Mapping between an absent network identifier and the never-null stored
/// form. VNI and VLAN columns store `-1` for "undefined" so they can carry a
/// NOT NULL constraint.
pub mod network_id {
    pub const UNDEFINED: i64 = -1;

    pub fn to_stored(value: Option<i64>) -> i64 {
        value.unwrap_or(UNDEFINED)
    }

    pub fn from_stored(value: i64) -> Option<i64> {
        if value == UNDEFINED {
            None
        } else {
            Some(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_canonical() {
        let c = Cidr::parse("192.168.1.0/24").unwrap();
        assert_eq!(c.to_string(), "192.168.1.0/24");
        assert_eq!(c.prefix_len(), 24);
        assert_eq!(c.family(), Family::V4);
    }

    #[test]
    fn test_cidr_rejects_host_bits() {
        assert!(Cidr::parse("192.168.1.5/24").is_err());
        let normalized = Cidr::parse_normalized("192.168.1.5/24").unwrap();
        assert_eq!(normalized.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_cidr_parse_bare_address() {
        let c = Cidr::parse_normalized("2001:db8::1").unwrap();
        assert_eq!(c.prefix_len(), 128);
        assert_eq!(c.family(), Family::V6);
    }

    #[test]
    fn test_cidr_parse_invalid() {
        let err = Cidr::parse("not-a-network").unwrap_err();
        assert_eq!(err.input, "not-a-network");
    }

    #[test]
    fn test_cidr_contains() {
        let outer = Cidr::parse("10.0.0.0/8").unwrap();
        let inner = Cidr::parse("10.1.0.0/16").unwrap();
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.contains_ip(&"10.255.0.1".parse().unwrap()));
        assert!(!outer.contains_ip(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_overlaps() {
        let a = Cidr::parse("10.0.0.0/8").unwrap();
        let b = Cidr::parse("10.1.0.0/16").unwrap();
        let c = Cidr::parse("192.168.0.0/16").unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_cidr_ordering_broader_first() {
        let mut ranges = vec![
            Cidr::parse("10.0.0.0/16").unwrap(),
            Cidr::parse("10.0.0.0/8").unwrap(),
            Cidr::parse("9.0.0.0/8").unwrap(),
        ];
        ranges.sort();
        assert_eq!(
            ranges.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            vec!["9.0.0.0/8", "10.0.0.0/8", "10.0.0.0/16"]
        );
    }

    #[test]
    fn test_cidr_supernets() {
        let c = Cidr::parse("192.168.1.0/24").unwrap();
        let sups = c.supernets();
        assert_eq!(sups.len(), 24);
        assert_eq!(sups[0].to_string(), "192.168.0.0/23");
        assert_eq!(sups.last().unwrap().to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_ip_sort_key_families() {
        let v4 = ip_sort_key(&"255.255.255.255".parse().unwrap());
        let v6 = ip_sort_key(&"::1".parse().unwrap());
        // IPv4 always sorts before IPv6
        assert!(v4 < v6);
    }

    #[test]
    fn test_mac_canonical_forms() {
        for input in [
            "02:42:D7:E4:AA:59",
            "02-42-d7-e4-aa-59",
            "0242.d7e4.aa59",
            "0242d7e4aa59",
        ] {
            let mac = Mac::parse(input).unwrap();
            assert_eq!(mac.to_string(), "02:42:d7:e4:aa:59");
        }
    }

    #[test]
    fn test_mac_invalid() {
        assert!(Mac::parse("02:42:d7:e4:aa").is_err());
        assert!(Mac::parse("02:42:d7:e4:aa:zz").is_err());
        assert!(Mac::parse("").is_err());
    }

    #[test]
    fn test_network_id_round_trip() {
        assert_eq!(network_id::to_stored(None), -1);
        assert_eq!(network_id::to_stored(Some(14)), 14);
        assert_eq!(network_id::from_stored(-1), None);
        assert_eq!(network_id::from_stored(10), Some(10));
    }
}
