//! Bridge network provisioning
//!
//! Provides:
//! - IPv4 address allocation within a subnet
//! - Two-phase reservations on top of the allocator
//! - Free-address lookup against a bridge's DHCP leases
//! - Idempotent reconciliation of the managed bridge

pub mod bridge;
pub mod ip;
pub mod leases;
pub mod reservation;

pub use bridge::{BridgeSpec, ensure_bridge};
pub use ip::{AddressAllocator, AllocationRange, find_free_ip};
pub use leases::{BridgeLeases, bridge_leases, find_free_ip_bridge, propose_bridge_ip};
pub use reservation::{Reservation, Reservations};
