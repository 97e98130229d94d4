//! Configuration file parsing for lxe-net
//!
//! Parses `lxe-net.toml` configuration files using serde

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Load configuration from a file
pub fn load(path: &Path) -> Result<NetConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: NetConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetConfig {
    /// Remote network controller (LXD) connection
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Managed default bridge
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// CNI plugin locations
    #[serde(default)]
    pub cni: CniConfig,

    /// Address allocation tuning
    #[serde(default)]
    pub allocation: AllocationConfig,
}

impl NetConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = &self.controller.url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::ConfigValidation(format!(
                "controller url must be http(s), got '{}'",
                url
            )));
        }

        if self.controller.timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "controller timeout_secs must be greater than zero".into(),
            ));
        }

        if !self.bridge.cidr.is_empty() {
            let net: Ipv4Net = self.bridge.cidr.parse().map_err(|e| {
                Error::ConfigValidation(format!(
                    "Invalid bridge cidr '{}': {}",
                    self.bridge.cidr, e
                ))
            })?;
            if net.prefix_len() > 30 {
                return Err(Error::ConfigValidation(format!(
                    "Bridge cidr '{}' has no room for hosts",
                    self.bridge.cidr
                )));
            }
        }

        if self.bridge.name.is_empty() {
            return Err(Error::ConfigValidation("bridge name is empty".into()));
        }

        if self.cni.bin_paths.is_empty() {
            return Err(Error::ConfigValidation(
                "cni bin_paths must list at least one directory".into(),
            ));
        }

        if self.cni.plugin_timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "cni plugin_timeout_secs must be greater than zero".into(),
            ));
        }

        if self.allocation.max_probes == Some(0) {
            return Err(Error::ConfigValidation(
                "allocation max_probes must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

fn default_controller_url() -> String {
    "https://127.0.0.1:8443".into()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Remote network controller settings
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Base URL of the LXD API (without `/1.0`)
    #[serde(default = "default_controller_url")]
    pub url: String,

    /// Bearer token for authentication
    pub token: Option<String>,

    /// Global timeout for a single request in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry/backoff configuration for reads
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: default_controller_url(),
            token: None,
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    4
}

fn default_jitter_factor() -> f64 {
    0.25
}

/// Retry/backoff configuration for controller reads
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_bridge_name() -> String {
    "lxebr0".into()
}

/// Managed bridge settings
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Bridge network name
    #[serde(default = "default_bridge_name")]
    pub name: String,

    /// IPv4 CIDR for the bridge; empty lets the controller pick one
    #[serde(default)]
    pub cidr: String,

    /// Only create the bridge; never reconcile an existing one
    #[serde(default)]
    pub create_only: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            cidr: String::new(),
            create_only: false,
        }
    }
}

fn default_bin_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/opt/cni/bin")]
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("/etc/cni/net.d")
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/run/netns")
}

fn default_interface() -> String {
    "eth0".into()
}

fn default_plugin_timeout_secs() -> u64 {
    60
}

/// CNI plugin and configuration locations
#[derive(Debug, Clone, Deserialize)]
pub struct CniConfig {
    /// Directories searched for plugin binaries
    #[serde(default = "default_bin_paths")]
    pub bin_paths: Vec<PathBuf>,

    /// Directory holding network configuration lists
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,

    /// Base directory for named network namespaces
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    /// Interface name created inside the container
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Timeout for a single plugin invocation in seconds
    #[serde(default = "default_plugin_timeout_secs")]
    pub plugin_timeout_secs: u64,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            bin_paths: default_bin_paths(),
            conf_dir: default_conf_dir(),
            netns_dir: default_netns_dir(),
            interface: default_interface(),
            plugin_timeout_secs: default_plugin_timeout_secs(),
        }
    }
}

/// Address allocation tuning
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllocationConfig {
    /// Upper bound on random probes before sweeping the range
    pub max_probes: Option<u64>,
}
