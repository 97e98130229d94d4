//! Managed bridge reconciliation
//!
//! Provides:
//! - Creation of the runtime's bridge network on the controller
//! - Merge of the required keys into an existing bridge, guarded by its ETag
//! - Type checking of pre-existing networks with the same name

use crate::controller::{BRIDGE_TYPE, NetworkController, NetworkPut, NetworksPost};
use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, info};

const DESCRIPTION: &str = "managed by LXE, default bridge";

/// Desired state of the managed bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSpec {
    /// Bridge address with prefix (e.g. "10.22.0.1/16") or "auto"
    pub address: String,
}

impl BridgeSpec {
    /// Desired bridge state for an optional network CIDR
    ///
    /// An empty `cidr` asks the controller to pick a subnet. Otherwise the
    /// bridge takes the first host address of the network.
    pub fn new(cidr: &str) -> Result<Self> {
        let address = if cidr.is_empty() {
            "auto".to_string()
        } else {
            let net: Ipv4Net = cidr
                .parse()
                .map_err(|_| Error::InvalidAddress(format!("bridge cidr '{}'", cidr)))?;
            let net = net.trunc();
            let first = u32::from(net.network()).checked_add(1).map(Ipv4Addr::from);
            match first {
                Some(first) if net.prefix_len() <= 30 => format!("{}/{}", first, net.prefix_len()),
                _ => {
                    return Err(Error::InvalidAddress(format!(
                        "bridge cidr '{}' has no usable host address",
                        cidr
                    )));
                }
            }
        };

        Ok(Self { address })
    }

    /// Configuration keys this manager owns on the bridge
    ///
    /// DHCP and NAT are always enabled.
    pub fn config(&self) -> HashMap<String, String> {
        [
            ("ipv4.address", self.address.clone()),
            ("ipv4.dhcp", true.to_string()),
            ("ipv4.nat", true.to_string()),
            ("ipv6.address", "none".to_string()),
            // dnsmasq with port=0 serves DHCP only; name resolution comes from elsewhere
            ("raw.dnsmasq", "port=0".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Ensure `name` exists as a managed bridge with the required configuration
///
/// Absent networks are created. An existing bridge is left alone when
/// `create_only` is set, otherwise the required keys are merged over its
/// configuration and written back with the ETag read in this same call. A
/// concurrent writer makes that update fail with a conflict, which is
/// returned to the caller rather than retried.
///
/// The bridge is always NATed; `nat = false` is accepted but has no effect.
pub fn ensure_bridge(
    controller: &dyn NetworkController,
    name: &str,
    cidr: &str,
    nat: bool,
    create_only: bool,
) -> Result<()> {
    if !nat {
        debug!(bridge = name, "NAT cannot be disabled on the managed bridge");
    }
    let spec = BridgeSpec::new(cidr)?;

    let (network, etag) = match controller.get_network(name) {
        Ok(found) => found,
        Err(e) if e.is_not_found() => {
            info!(bridge = name, address = %spec.address, "creating bridge");
            return controller.create_network(&NetworksPost {
                name: name.to_string(),
                kind: BRIDGE_TYPE.to_string(),
                managed: true,
                put: NetworkPut {
                    description: DESCRIPTION.to_string(),
                    config: spec.config(),
                },
            });
        }
        Err(e) => return Err(e),
    };

    if network.kind != BRIDGE_TYPE {
        return Err(Error::TypeMismatch {
            name: name.to_string(),
            expected: BRIDGE_TYPE.to_string(),
            actual: network.kind,
        });
    }

    if create_only {
        debug!(bridge = name, "bridge exists, creation only requested");
        return Ok(());
    }

    let mut put = network.writable();
    put.config.extend(spec.config());

    debug!(bridge = name, %etag, "reconciling bridge configuration");
    controller.update_network(name, &put, &etag)
}
