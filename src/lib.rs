//! lxe-net - network provisioning for the LXE container runtime shim
//!
//! Allocates IPv4 addresses on a controller-managed bridge, reconciles the
//! bridge itself against the LXD API, and attaches containers to pod
//! networks through CNI plugins.

pub mod cni;
pub mod context;
pub mod controller;
pub mod error;
pub mod manifest;
pub mod network;
pub mod orchestrator;

pub use context::Context;
pub use error::{Error, Result};
