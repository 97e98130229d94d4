//! CNI result payload
//!
//! The attach result is stored verbatim on the sandbox and re-parsed here
//! when status is requested.

use crate::error::Result;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// CNI result object (0.3.x through 1.x)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub dns: Dns,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Only present before 1.0.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Index into `interfaces`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Interface and address information reported by status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStatus {
    pub interfaces: Vec<Interface>,
    pub ips: Vec<AddressStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressStatus {
    /// Interface name, when the result identifies one
    pub interface: Option<String>,
    pub address: IpNet,
    pub gateway: Option<IpAddr>,
}

impl CniResult {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// First address in the result, if any
    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ips.first().map(|ip| ip.address.addr())
    }

    pub fn status(&self) -> NetworkStatus {
        let ips = self
            .ips
            .iter()
            .map(|ip| AddressStatus {
                interface: ip
                    .interface
                    .and_then(|idx| self.interfaces.get(idx))
                    .map(|iface| iface.name.clone()),
                address: ip.address,
                gateway: ip.gateway,
            })
            .collect();

        NetworkStatus {
            interfaces: self.interfaces.clone(),
            ips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stored_result() {
        let raw = br#"{"cniVersion":"0.4.0","ips":[{"version":"4","interface":2,"address":"10.22.0.64/16","gateway":"10.22.0.1"}]}"#;
        let result = CniResult::parse(raw).unwrap();

        assert_eq!(result.cni_version, "0.4.0");
        assert_eq!(result.primary_ip(), Some("10.22.0.64".parse().unwrap()));

        let status = result.status();
        assert_eq!(status.ips.len(), 1);
        assert_eq!(status.ips[0].address, "10.22.0.64/16".parse::<IpNet>().unwrap());
        assert_eq!(status.ips[0].gateway, Some("10.22.0.1".parse().unwrap()));
        // index 2 does not resolve without an interfaces list
        assert_eq!(status.ips[0].interface, None);
    }

    #[test]
    fn test_interface_index_resolves_name() {
        let raw = br#"{
            "cniVersion": "1.0.0",
            "interfaces": [
                {"name": "cni0", "mac": "aa:bb:cc:dd:ee:ff"},
                {"name": "eth0", "sandbox": "/proc/42/ns/net"}
            ],
            "ips": [{"interface": 1, "address": "10.22.0.7/16"}],
            "dns": {"nameservers": ["10.22.0.1"]}
        }"#;
        let status = CniResult::parse(raw).unwrap().status();

        assert_eq!(status.interfaces.len(), 2);
        assert_eq!(status.ips[0].interface.as_deref(), Some("eth0"));
        assert_eq!(status.ips[0].gateway, None);
    }

    #[test]
    fn test_empty_result() {
        let result = CniResult::parse(br#"{"cniVersion":"0.4.0"}"#).unwrap();
        assert_eq!(result.primary_ip(), None);
        assert!(result.status().ips.is_empty());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(CniResult::parse(b"not json").is_err());
        assert!(CniResult::parse(br#"{"ips":[{"address":"bogus"}]}"#).is_err());
    }
}
