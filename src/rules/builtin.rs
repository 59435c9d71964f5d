//! Builtin rule catalogue
//!
//! Seeded into the rule table at boot and re-synced on every start, so the
//! statements always match the running schema. Enforced rules carry the
//! relational invariants of the DNS/DHCP model; soft rules surface
//! operational smells without blocking commits.

use crate::model::{Kind, Severity};

/// Declaration of one builtin rule.
pub struct BuiltinRule {
    pub name: &'static str,
    pub model: Kind,
    pub severity: Severity,
    pub field: &'static str,
    pub description: &'static str,
    pub statement: String,
}

const DNS_LABEL: &str = "d.name || ' = ' || d.value || ' (' || d.type || ')'";

/// The full catalogue, in seed order.
pub fn builtin_rules() -> Vec<BuiltinRule> {
    vec![
        BuiltinRule {
            name: "dns_record_without_zone",
            model: Kind::DnsRecord,
            severity: Severity::Enforced,
            field: "name",
            description: "Hostname must be defined within a valid DNS Zone.",
            statement: concat_statement(&format!(
                "SELECT d.id AS id, {DNS_LABEL} AS label
                 FROM dnsrecord d
                 WHERE d.type NOT IN ('PTR', 'SOA') AND d.status = 2
                   AND NOT EXISTS (
                     SELECT 1 FROM dnszone z
                     WHERE z.status = 2
                       AND (d.name = z.name OR d.name LIKE '%.' || z.name))"
            )),
        },
        BuiltinRule {
            name: "dns_ptr_without_zone",
            model: Kind::DnsRecord,
            severity: Severity::Enforced,
            field: "value",
            description: "PTR target must be defined within a valid DNS Zone.",
            statement: concat_statement(&format!(
                "SELECT d.id AS id, {DNS_LABEL} AS label
                 FROM dnsrecord d
                 WHERE d.type = 'PTR' AND d.status = 2
                   AND NOT EXISTS (
                     SELECT 1 FROM dnszone z
                     WHERE z.status = 2
                       AND (d.value = z.name OR d.value LIKE '%.' || z.name))"
            )),
        },
        BuiltinRule {
            name: "dns_soa_without_zone",
            model: Kind::DnsRecord,
            severity: Severity::Enforced,
            field: "name",
            description: "SOA record must be defined on a DNS Zone.",
            statement: concat_statement(&format!(
                "SELECT d.id AS id, {DNS_LABEL} AS label
                 FROM dnsrecord d
                 WHERE d.type = 'SOA' AND d.status = 2
                   AND NOT EXISTS (
                     SELECT 1 FROM dnszone z WHERE z.status = 2 AND z.name = d.name)"
            )),
        },
        BuiltinRule {
            name: "dns_cname_not_unique",
            model: Kind::DnsRecord,
            severity: Severity::Enforced,
            field: "name",
            description: "You cannot define other record types when an alias for a canonical name (CNAME) is defined.",
            statement: concat_statement(&format!(
                "SELECT DISTINCT d.id AS id, {DNS_LABEL} AS label
                 FROM dnsrecord d
                 JOIN dnsrecord o ON lower(o.name) = lower(d.name) AND o.id != d.id
                 WHERE ((d.type = 'CNAME' AND o.type != 'CNAME')
                        OR (d.type != 'CNAME' AND o.type = 'CNAME'))
                   AND d.status = 2 AND o.status = 2"
            )),
        },
        BuiltinRule {
            name: "dns_fwd_outside_zone_subnets",
            model: Kind::DnsRecord,
            severity: Severity::Enforced,
            field: "value",
            description: "IP address must be defined within an allowed subnet of the DNS Zone.",
            statement: concat_statement(&format!(
                "SELECT d.id AS id, {DNS_LABEL} AS label
                 FROM dnsrecord d
                 WHERE d.type IN ('A', 'AAAA') AND d.status = 2
                   AND NOT EXISTS (
                     SELECT 1 FROM dnszone z
                     JOIN dnszone_subnet zs ON zs.dnszone_id = z.id
                     JOIN subnet s ON s.id = zs.subnet_id
                     JOIN subnet_range r ON r.subnet_id = s.id
                     WHERE (d.name = z.name OR d.name LIKE '%.' || z.name)
                       AND z.status = 2 AND s.status = 2
                       AND subnet_of_or_equals(d.generated_ip, r.range))"
            )),
        },
        BuiltinRule {
            name: "dns_ptr_without_forward",
            model: Kind::DnsRecord,
            severity: Severity::Soft,
            field: "value",
            description: "PTR record should have a corresponding forward record with the same hostname and IP address.",
            statement: concat_statement(&format!(
                "SELECT d.id AS id, {DNS_LABEL} AS label
                 FROM dnsrecord d
                 WHERE d.type = 'PTR' AND d.status = 2
                   AND NOT EXISTS (
                     SELECT 1 FROM dnsrecord f
                     WHERE f.status = 2 AND f.type IN ('A', 'AAAA')
                       AND f.generated_ip = d.generated_ip
                       AND lower(f.name) = lower(d.value))"
            )),
        },
        BuiltinRule {
            name: "dns_cname_on_zone",
            model: Kind::DnsRecord,
            severity: Severity::Soft,
            field: "name",
            description: "An alias for the canonical name (CNAME) should not be defined on a DNS Zone.",
            statement: concat_statement(&format!(
                "SELECT d.id AS id, {DNS_LABEL} AS label
                 FROM dnsrecord d
                 JOIN dnszone z ON z.name = d.name AND z.status = 2
                 WHERE d.type = 'CNAME' AND d.status = 2"
            )),
        },
        BuiltinRule {
            name: "dhcp_outside_dhcp_subnet",
            model: Kind::DhcpRecord,
            severity: Severity::Soft,
            field: "ip",
            description: "The IP address is not within any DHCP-enabled subnet.",
            statement: concat_statement(
                "SELECT h.id AS id, h.ip || ' (' || h.mac || ')' AS label
                 FROM dhcprecord h
                 WHERE h.status = 2
                   AND NOT EXISTS (
                     SELECT 1 FROM subnet s
                     JOIN subnet_range r ON r.subnet_id = s.id
                     WHERE s.dhcp = 1 AND s.status = 2
                       AND subnet_of_or_equals(h.ip, r.range))",
            ),
        },
        BuiltinRule {
            name: "dhcp_duplicate_ip",
            model: Kind::DhcpRecord,
            severity: Severity::Soft,
            field: "ip",
            description: "Multiple DHCP reservations exist for the same IP address.",
            statement: concat_statement(
                "SELECT DISTINCT h.id AS id, h.ip || ' (' || h.mac || ')' AS label
                 FROM dhcprecord h
                 JOIN dhcprecord o ON o.ip = h.ip AND o.id != h.id
                 WHERE h.status = 2 AND o.status = 2",
            ),
        },
    ]
}

/// Collapse the indented source formatting into a single-line statement so
/// the stored text stays readable in the rule table.
fn concat_statement(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}
