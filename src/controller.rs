//! Remote network controller (LXD) interface
//!
//! Provides:
//! - The `NetworkController` trait consumed by the bridge manager and lease source
//! - LXD network resource types
//! - An HTTP implementation in [`http`]

mod http;

pub use http::HttpController;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Network type string LXD uses for managed bridges
pub const BRIDGE_TYPE: &str = "bridge";

/// A network as returned by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub managed: bool,

    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Network {
    /// The user-modifiable part of this network
    pub fn writable(&self) -> NetworkPut {
        NetworkPut {
            description: self.description.clone(),
            config: self.config.clone(),
        }
    }
}

/// Writable fields of a network, sent on update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPut {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Request body for creating a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworksPost {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    /// Not part of the wire format; LXD marks networks it creates as managed
    #[serde(skip)]
    pub managed: bool,

    #[serde(flatten)]
    pub put: NetworkPut,
}

/// A DHCP lease on a managed network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLease {
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub hwaddr: String,

    pub address: String,

    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Operations on the remote network controller
///
/// Errors must report an absent network as [`Error::NotFound`](crate::error::Error::NotFound)
/// and a stale version token as [`Error::Conflict`](crate::error::Error::Conflict).
pub trait NetworkController {
    /// Fetch a network and its current version token (ETag)
    fn get_network(&self, name: &str) -> Result<(Network, String)>;

    fn create_network(&self, network: &NetworksPost) -> Result<()>;

    /// Replace a network's writable fields, guarded by `etag`
    fn update_network(&self, name: &str, put: &NetworkPut, etag: &str) -> Result<()>;

    fn get_network_leases(&self, name: &str) -> Result<Vec<NetworkLease>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory controller shared by the network module tests

    use super::*;
    use crate::error::Error;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    pub struct MemoryController {
        pub networks: RefCell<HashMap<String, (Network, u64)>>,
        pub leases: RefCell<HashMap<String, Vec<NetworkLease>>>,
        pub writes: Cell<usize>,
        /// Bump the version between get and update to simulate a racing writer
        pub race_next_update: Cell<bool>,
    }

    impl MemoryController {
        pub fn with_network(self, network: Network) -> Self {
            self.networks
                .borrow_mut()
                .insert(network.name.clone(), (network, 1));
            self
        }

        pub fn with_leases(self, name: &str, addresses: &[&str]) -> Self {
            let leases = addresses
                .iter()
                .map(|a| NetworkLease {
                    address: a.to_string(),
                    kind: "dynamic".to_string(),
                    ..Default::default()
                })
                .collect();
            self.leases.borrow_mut().insert(name.to_string(), leases);
            self
        }

        pub fn network(&self, name: &str) -> Option<Network> {
            self.networks.borrow().get(name).map(|(n, _)| n.clone())
        }
    }

    impl NetworkController for MemoryController {
        fn get_network(&self, name: &str) -> Result<(Network, String)> {
            self.networks
                .borrow()
                .get(name)
                .map(|(n, v)| (n.clone(), format!("etag-{}", v)))
                .ok_or_else(|| Error::not_found("network", name))
        }

        fn create_network(&self, network: &NetworksPost) -> Result<()> {
            self.writes.set(self.writes.get() + 1);
            let created = Network {
                name: network.name.clone(),
                description: network.put.description.clone(),
                kind: network.kind.clone(),
                managed: true,
                config: network.put.config.clone(),
            };
            self.networks
                .borrow_mut()
                .insert(network.name.clone(), (created, 1));
            Ok(())
        }

        fn update_network(&self, name: &str, put: &NetworkPut, etag: &str) -> Result<()> {
            self.writes.set(self.writes.get() + 1);
            let mut networks = self.networks.borrow_mut();
            let (network, version) = networks
                .get_mut(name)
                .ok_or_else(|| Error::not_found("network", name))?;

            if self.race_next_update.replace(false) {
                *version += 1;
            }
            if etag != format!("etag-{}", version) {
                return Err(Error::Conflict(format!("network '{}' was modified", name)));
            }

            network.description = put.description.clone();
            network.config = put.config.clone();
            *version += 1;
            Ok(())
        }

        fn get_network_leases(&self, name: &str) -> Result<Vec<NetworkLease>> {
            Ok(self.leases.borrow().get(name).cloned().unwrap_or_default())
        }
    }
}
