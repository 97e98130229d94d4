//! Free address lookup on a controller-managed bridge
//!
//! Reads the bridge's own address and its DHCP lease table from the
//! controller and hands them to the allocator as the reserved set.

use crate::controller::NetworkController;
use crate::error::{Error, Result};
use crate::network::ip::AllocationRange;
use crate::network::reservation::{Reservation, Reservations};
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// Bridge config key holding explicit DHCP ranges
const DHCP_RANGES_KEY: &str = "ipv4.dhcp.ranges";

/// Bridge config key holding the bridge's own CIDR
const ADDRESS_KEY: &str = "ipv4.address";

/// Everything the allocator needs to know about a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeLeases {
    pub subnet: Ipv4Net,
    pub bridge_address: Ipv4Addr,
    pub leased: Vec<Ipv4Addr>,
    pub range: AllocationRange,
}

impl BridgeLeases {
    /// Addresses the allocator must skip
    pub fn reserved(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.leased
            .iter()
            .copied()
            .chain(std::iter::once(self.bridge_address))
    }
}

/// Parse a single `start-end` DHCP range
fn parse_dhcp_range(bridge: &str, raw: &str) -> Result<AllocationRange> {
    let ranges: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .collect();

    let [range] = ranges.as_slice() else {
        return Err(Error::UnsupportedConfiguration(format!(
            "bridge '{}' defines {} ranges in `{}`; only one contiguous range is supported",
            bridge,
            ranges.len(),
            DHCP_RANGES_KEY
        )));
    };

    let (start, end) = range.split_once('-').ok_or_else(|| {
        Error::UnsupportedConfiguration(format!(
            "bridge '{}' has malformed `{}` value '{}'",
            bridge, DHCP_RANGES_KEY, range
        ))
    })?;

    let parse = |s: &str| -> Result<Ipv4Addr> {
        s.trim()
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("DHCP range bound '{}'", s.trim())))
    };
    Ok(AllocationRange::new(parse(start)?, parse(end)?))
}

/// Collect the subnet, bridge address and current leases of `bridge`
pub fn bridge_leases(controller: &dyn NetworkController, bridge: &str) -> Result<BridgeLeases> {
    let (network, _) = controller.get_network(bridge)?;

    let range = match network.config.get(DHCP_RANGES_KEY) {
        Some(raw) if !raw.trim().is_empty() => parse_dhcp_range(bridge, raw)?,
        _ => AllocationRange::default(),
    };

    let raw_address = network
        .config
        .get(ADDRESS_KEY)
        .map(String::as_str)
        .unwrap_or_default();
    let bridge_net: Ipv4Net = raw_address.parse().map_err(|_| {
        Error::InvalidAddress(format!(
            "bridge '{}' has no IPv4 CIDR in `{}` (got '{}')",
            bridge, ADDRESS_KEY, raw_address
        ))
    })?;

    let mut leased = Vec::new();
    for lease in controller.get_network_leases(bridge)? {
        let addr: IpAddr = lease.address.parse().map_err(|_| {
            Error::InvalidAddress(format!(
                "lease address '{}' on bridge '{}'",
                lease.address, bridge
            ))
        })?;
        // IPv6 leases can't collide with IPv4 candidates
        if let IpAddr::V4(v4) = addr {
            leased.push(v4);
        }
    }

    debug!(bridge, subnet = %bridge_net.trunc(), leases = leased.len(), "read bridge leases");

    Ok(BridgeLeases {
        subnet: bridge_net.trunc(),
        bridge_address: bridge_net.addr(),
        leased,
        range,
    })
}

/// Find an address on `bridge` that is neither leased nor the bridge's own
pub fn find_free_ip_bridge(
    controller: &dyn NetworkController,
    reservations: &Reservations,
    bridge: &str,
) -> Result<Ipv4Addr> {
    Ok(propose_bridge_ip(controller, reservations, bridge)?.commit())
}

/// Propose an address on `bridge`; commit it once the lease is written
pub fn propose_bridge_ip<'a>(
    controller: &dyn NetworkController,
    reservations: &'a Reservations,
    bridge: &str,
) -> Result<Reservation<'a>> {
    let leases = bridge_leases(controller, bridge)?;
    reservations.propose(leases.subnet, leases.reserved(), leases.range)
}
