//! Builtin consistency hooks
//!
//! Static declaration of the `(kind, phase) -> hook` table. Hooks keep the
//! derived columns and aggregate rows in step with the records that
//! reference them; relational invariants live in the enforced rules.

use super::{FlushCtx, HookRegistry, Phase};
use crate::error::{Result, UdbError};
use crate::model::{Entity, Kind};

/// Build the boot-time hook registry.
pub fn registry() -> HookRegistry {
    let mut registry = HookRegistry::new();
    registry.register(Kind::Subnet, Phase::BeforeFlush, subnet_before_flush);
    registry.register(Kind::DnsZone, Phase::BeforeFlush, dnszone_before_flush);
    registry.register(Kind::DnsRecord, Phase::BeforeFlush, dnsrecord_before_flush);
    registry.register(Kind::DhcpRecord, Phase::BeforeFlush, dhcprecord_before_flush);
    registry.register(Kind::Rule, Phase::BeforeFlush, crate::rules::rule_before_flush);
    registry
}

/// Canonicalise ranges, check the VRF reference and record the parent touch
/// when ranges changed.
fn subnet_before_flush(ctx: &mut FlushCtx<'_>, index: usize) -> Result<()> {
    let (vrf_id, ranges_changed) = {
        let original_ranges = match ctx.original(index) {
            Some(Entity::Subnet(original)) => Some(original.ranges.clone()),
            _ => None,
        };
        let Entity::Subnet(subnet) = ctx.entity_mut(index) else {
            return Ok(());
        };
        subnet.normalize_ranges();
        let changed = match original_ranges {
            Some(original) => original != subnet.ranges,
            None => true,
        };
        (subnet.vrf_id, changed)
    };

    if !ctx.vrf_is_live(vrf_id)? {
        return Err(UdbError::validation("vrf", "VRF does not exist or is deleted"));
    }
    if ranges_changed {
        ctx.touch_parent(Kind::Vrf, vrf_id, index);
    }
    Ok(())
}

/// Zone names are compared lowercase everywhere; normalise before write.
fn dnszone_before_flush(ctx: &mut FlushCtx<'_>, index: usize) -> Result<()> {
    if let Entity::DnsZone(zone) = ctx.entity_mut(index) {
        zone.name = zone.name.trim().trim_end_matches('.').to_lowercase();
    }
    Ok(())
}

/// Keep the record name canonical and materialise the aggregate IP row for
/// address-bearing records.
fn dnsrecord_before_flush(ctx: &mut FlushCtx<'_>, index: usize) -> Result<()> {
    let ip = {
        let Entity::DnsRecord(record) = ctx.entity_mut(index) else {
            return Ok(());
        };
        record.name = record.name.trim().trim_end_matches('.').to_lowercase();
        if record.meta.status.is_deleted() {
            None
        } else {
            record.ip_value()
        }
    };
    if let Some(ip) = ip {
        ctx.ensure_ip(&ip)?;
    }
    Ok(())
}

/// Materialise the aggregate IP and MAC rows a reservation references.
fn dhcprecord_before_flush(ctx: &mut FlushCtx<'_>, index: usize) -> Result<()> {
    let refs = {
        let Entity::DhcpRecord(record) = ctx.entity(index) else {
            return Ok(());
        };
        if record.meta.status.is_deleted() {
            None
        } else {
            Some((record.ip, record.mac))
        }
    };
    if let Some((ip, mac)) = refs {
        ctx.ensure_ip(&ip)?;
        ctx.ensure_mac(&mac)?;
    }
    Ok(())
}
