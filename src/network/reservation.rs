//! Two-phase address reservation
//!
//! Random-probe allocation alone has a check-then-use window: two callers
//! can read the same lease snapshot and pick the same address. Within one
//! process, `Reservations` closes that window. A proposal holds its address
//! under a per-subnet lock until it is committed (the lease was written) or
//! dropped (it was abandoned). Cross-process safety still relies on the
//! authoritative lease table.

use crate::error::Result;
use crate::network::ip::{AddressAllocator, AllocationRange};
use ipnet::Ipv4Net;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct SubnetBook {
    /// Proposed but not yet committed
    pending: HashSet<Ipv4Addr>,
    /// Committed and not yet released
    held: HashSet<Ipv4Addr>,
}

/// Tracks in-flight and committed addresses per subnet
#[derive(Debug, Default)]
pub struct Reservations {
    allocator: AddressAllocator,
    books: Mutex<HashMap<Ipv4Net, SubnetBook>>,
}

impl Reservations {
    pub fn new(allocator: AddressAllocator) -> Self {
        Self {
            allocator,
            books: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ipv4Net, SubnetBook>> {
        // Poisoning leaves both sets intact
        self.books.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Propose a free address, treating pending and held ones as reserved
    pub fn propose(
        &self,
        subnet: Ipv4Net,
        reserved: impl IntoIterator<Item = Ipv4Addr>,
        range: AllocationRange,
    ) -> Result<Reservation<'_>> {
        let subnet = subnet.trunc();
        let mut books = self.lock();
        let book = books.entry(subnet).or_default();

        let taken = book.pending.iter().chain(book.held.iter()).copied();
        let reserved: Vec<Ipv4Addr> = reserved.into_iter().chain(taken).collect();

        let address = self.allocator.find_free_ip(subnet, reserved, range)?;
        book.pending.insert(address);
        debug!(%subnet, %address, "proposed address");

        Ok(Reservation {
            owner: self,
            subnet,
            address,
            committed: false,
        })
    }

    /// Return a committed address to the pool
    pub fn release(&self, subnet: Ipv4Net, address: Ipv4Addr) {
        let subnet = subnet.trunc();
        if let Some(book) = self.lock().get_mut(&subnet) {
            book.held.remove(&address);
        }
    }

    /// Whether `address` is currently pending or held
    pub fn is_taken(&self, subnet: Ipv4Net, address: Ipv4Addr) -> bool {
        self.lock()
            .get(&subnet.trunc())
            .is_some_and(|b| b.pending.contains(&address) || b.held.contains(&address))
    }
}

/// An address proposed by [`Reservations::propose`]
///
/// Dropping it without calling [`commit`](Reservation::commit) frees the address.
#[must_use = "an uncommitted reservation is released when dropped"]
#[derive(Debug)]
pub struct Reservation<'a> {
    owner: &'a Reservations,
    subnet: Ipv4Net,
    address: Ipv4Addr,
    committed: bool,
}

impl Reservation<'_> {
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Mark the address as in use until it is released
    pub fn commit(mut self) -> Ipv4Addr {
        let mut books = self.owner.lock();
        let book = books.entry(self.subnet).or_default();
        book.pending.remove(&self.address);
        book.held.insert(self.address);
        self.committed = true;
        self.address
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(book) = self.owner.lock().get_mut(&self.subnet) {
            book.pending.remove(&self.address);
        }
    }
}
