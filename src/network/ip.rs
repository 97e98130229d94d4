//! IPv4 address allocation within a subnet
//!
//! Provides:
//! - Random-probe selection of a free host address
//! - Inclusive start/end narrowing of the candidate range
//! - Bounded probing with an explicit exhaustion error

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use rand::{Rng, RngExt};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// Random probes are never fewer than this, even for tiny ranges
const MIN_PROBES: u64 = 64;

/// Default upper bound on random probes before falling back to a sweep
pub const DEFAULT_MAX_PROBES: u64 = 65_536;

/// Optional inclusive bounds narrowing the candidate addresses
///
/// Unset bounds default to the first and last usable host of the subnet.
/// The network and broadcast addresses are excluded regardless of bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationRange {
    pub start: Option<Ipv4Addr>,
    pub end: Option<Ipv4Addr>,
}

impl AllocationRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Resolve to concrete inclusive bounds inside the subnet's usable hosts
    ///
    /// Returns `None` when no usable host remains (e.g. /31, /32).
    fn resolve(&self, subnet: &Ipv4Net) -> Result<Option<(u32, u32)>> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(Error::InvalidAddressRange {
                    subnet: subnet.to_string(),
                    start: start.to_string(),
                    end: end.to_string(),
                });
            }
        }

        let network = u32::from(subnet.network());
        let broadcast = u32::from(subnet.broadcast());

        let mut lo = network.saturating_add(1);
        let mut hi = broadcast.saturating_sub(1);
        if let Some(start) = self.start {
            lo = lo.max(u32::from(start));
        }
        if let Some(end) = self.end {
            hi = hi.min(u32::from(end));
        }

        if lo > hi || lo <= network || hi >= broadcast {
            return Ok(None);
        }
        Ok(Some((lo, hi)))
    }
}

/// Picks unused addresses by random probing
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    max_probes: u64,
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self {
            max_probes: DEFAULT_MAX_PROBES,
        }
    }
}

impl AddressAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of random probes before the sweep fallback
    pub fn with_max_probes(mut self, max_probes: u64) -> Self {
        self.max_probes = max_probes.max(1);
        self
    }

    /// Find an address in `subnet` that is not reserved and lies within `range`
    pub fn find_free_ip(
        &self,
        subnet: Ipv4Net,
        reserved: impl IntoIterator<Item = Ipv4Addr>,
        range: AllocationRange,
    ) -> Result<Ipv4Addr> {
        self.find_free_ip_with(&mut rand::rng(), subnet, reserved, range)
    }

    /// Same as [`find_free_ip`](Self::find_free_ip) with a caller-supplied RNG
    pub fn find_free_ip_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        subnet: Ipv4Net,
        reserved: impl IntoIterator<Item = Ipv4Addr>,
        range: AllocationRange,
    ) -> Result<Ipv4Addr> {
        let subnet = subnet.trunc();

        let mut reserved: HashSet<u32> = reserved.into_iter().map(u32::from).collect();
        reserved.insert(u32::from(subnet.network()));
        reserved.insert(u32::from(subnet.broadcast()));

        let exhausted = || Error::AddressSpaceExhausted {
            subnet: subnet.to_string(),
        };

        let (lo, hi) = range.resolve(&subnet)?.ok_or_else(exhausted)?;
        let size = u64::from(hi - lo) + 1;

        let prefix = u32::from(subnet.network());
        let hostmask = u32::from(subnet.hostmask());

        let probes = (size * 4).max(MIN_PROBES).min(self.max_probes);
        for _ in 0..probes {
            let candidate = prefix | (rng.random::<u32>() & hostmask);
            if candidate < lo || candidate > hi {
                continue;
            }
            if reserved.contains(&candidate) {
                continue;
            }
            return Ok(Ipv4Addr::from(candidate));
        }

        debug!(%subnet, probes, "random probing found nothing, sweeping range");

        // Sweep from a random offset so repeated calls don't pile onto `lo`
        let offset = rng.random_range(0..size);
        for i in 0..size {
            let candidate = lo + ((offset + i) % size) as u32;
            if !reserved.contains(&candidate) {
                return Ok(Ipv4Addr::from(candidate));
            }
        }

        Err(exhausted())
    }
}

/// Find a free address using the default allocator
pub fn find_free_ip(
    subnet: Ipv4Net,
    reserved: impl IntoIterator<Item = Ipv4Addr>,
    range: AllocationRange,
) -> Result<Ipv4Addr> {
    AddressAllocator::new().find_free_ip(subnet, reserved, range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_never_returns_reserved_or_special() {
        let subnet = net("10.0.0.0/24");
        let reserved = [ip("10.0.0.5"), ip("10.0.0.1")];
        let forbidden = [ip("10.0.0.0"), ip("10.0.0.1"), ip("10.0.0.5"), ip("10.0.0.255")];
        let mut rng = StdRng::seed_from_u64(7);
        let allocator = AddressAllocator::new();

        for _ in 0..500 {
            let got = allocator
                .find_free_ip_with(&mut rng, subnet, reserved, AllocationRange::default())
                .unwrap();
            assert!(subnet.contains(&got));
            assert!(!forbidden.contains(&got), "got forbidden {}", got);
        }
    }

    #[test]
    fn test_explicit_range_is_inclusive() {
        let subnet = net("10.0.0.0/24");
        let mut rng = StdRng::seed_from_u64(1);
        let allocator = AddressAllocator::new();

        let single = AllocationRange::new(ip("10.0.0.7"), ip("10.0.0.7"));
        let got = allocator
            .find_free_ip_with(&mut rng, subnet, [], single)
            .unwrap();
        assert_eq!(got, ip("10.0.0.7"));

        let range = AllocationRange::new(ip("10.0.0.10"), ip("10.0.0.20"));
        for _ in 0..300 {
            let got = allocator
                .find_free_ip_with(&mut rng, subnet, [], range)
                .unwrap();
            assert!(got >= ip("10.0.0.10") && got <= ip("10.0.0.20"));
        }
    }

    #[test]
    fn test_range_never_includes_network_or_broadcast() {
        let subnet = net("192.168.1.0/30");
        let range = AllocationRange::new(ip("192.168.1.0"), ip("192.168.1.3"));
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..100 {
            let got = AddressAllocator::new()
                .find_free_ip_with(&mut rng, subnet, [], range)
                .unwrap();
            assert!(got == ip("192.168.1.1") || got == ip("192.168.1.2"));
        }
    }

    #[test]
    fn test_last_free_address_is_found() {
        let subnet = net("10.1.2.0/24");
        let reserved: Vec<Ipv4Addr> = (1..=254)
            .filter(|h| *h != 77)
            .map(|h| Ipv4Addr::new(10, 1, 2, h))
            .collect();
        let mut rng = StdRng::seed_from_u64(11);

        let got = AddressAllocator::new()
            .with_max_probes(4)
            .find_free_ip_with(&mut rng, subnet, reserved, AllocationRange::default())
            .unwrap();
        assert_eq!(got, ip("10.1.2.77"));
    }

    #[test]
    fn test_exhausted_subnet() {
        let subnet = net("10.0.0.0/30");
        let err = find_free_ip(
            subnet,
            [ip("10.0.0.1"), ip("10.0.0.2")],
            AllocationRange::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::AddressSpaceExhausted { .. }));
    }

    #[test]
    fn test_subnets_without_usable_hosts() {
        for s in ["10.0.0.0/31", "10.0.0.7/32", "255.255.255.255/32", "0.0.0.0/32"] {
            let err = find_free_ip(net(s), [], AllocationRange::default()).unwrap_err();
            assert!(
                matches!(err, Error::AddressSpaceExhausted { .. }),
                "{} should be exhausted",
                s
            );
        }
    }

    #[test]
    fn test_inverted_range_rejected() {
        let range = AllocationRange::new(ip("10.0.0.20"), ip("10.0.0.10"));
        let err = find_free_ip(net("10.0.0.0/24"), [], range).unwrap_err();
        assert!(matches!(err, Error::InvalidAddressRange { .. }));
    }

    #[test]
    fn test_host_bits_in_subnet_are_ignored() {
        let mut rng = StdRng::seed_from_u64(5);
        let got = AddressAllocator::new()
            .find_free_ip_with(&mut rng, net("172.16.4.9/22"), [], AllocationRange::default())
            .unwrap();
        assert!(net("172.16.4.0/22").contains(&got));
        assert_ne!(got, ip("172.16.4.0"));
        assert_ne!(got, ip("172.16.7.255"));
    }
}
