//! CNI network configuration loading
//!
//! Reads the first network configuration from a directory. `.conflist`
//! files describe a plugin chain; `.conf` and `.json` files hold a single
//! plugin and are wrapped into a one-element chain.

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const EXTENSIONS: &[&str] = &["conf", "conflist", "json"];

/// A chain of CNI plugins sharing one network name and version
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkList {
    pub name: String,
    pub cni_version: String,
    pub disable_check: bool,
    /// Raw plugin configurations, in invocation order
    pub plugins: Vec<Map<String, Value>>,
    /// File or directory the list was loaded from
    pub origin: PathBuf,
}

#[derive(Deserialize)]
struct RawList {
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "disableCheck", default)]
    disable_check: bool,
    #[serde(default)]
    plugins: Vec<Map<String, Value>>,
}

impl NetworkList {
    /// List with no plugins, for a node without CNI configuration
    pub fn unconfigured(origin: &Path) -> Self {
        Self {
            name: String::new(),
            cni_version: String::new(),
            disable_check: false,
            plugins: Vec::new(),
            origin: origin.to_path_buf(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.plugins.is_empty()
    }

    /// Parse a `.conflist` document
    pub fn from_conflist(bytes: &[u8], origin: &Path) -> Result<Self> {
        let raw: RawList = serde_json::from_slice(bytes)
            .map_err(|e| Error::CniConfig(format!("{}: {}", origin.display(), e)))?;

        if raw.name.is_empty() {
            return Err(Error::CniConfig(format!(
                "{}: network list has no name",
                origin.display()
            )));
        }
        if raw.plugins.is_empty() {
            return Err(Error::CniConfig(format!(
                "{}: network list '{}' has no plugins",
                origin.display(),
                raw.name
            )));
        }

        let list = Self {
            name: raw.name,
            cni_version: raw.cni_version,
            disable_check: raw.disable_check,
            plugins: raw.plugins,
            origin: origin.to_path_buf(),
        };
        for plugin in &list.plugins {
            plugin_type(plugin)
                .map_err(|e| Error::CniConfig(format!("{}: {}", origin.display(), e)))?;
        }
        Ok(list)
    }

    /// Parse a single-plugin `.conf` document
    pub fn from_conf(bytes: &[u8], origin: &Path) -> Result<Self> {
        let plugin: Map<String, Value> = serde_json::from_slice(bytes)
            .map_err(|e| Error::CniConfig(format!("{}: {}", origin.display(), e)))?;

        let name = plugin
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(Error::CniConfig(format!(
                "{}: network has no name",
                origin.display()
            )));
        }
        plugin_type(&plugin)
            .map_err(|e| Error::CniConfig(format!("{}: {}", origin.display(), e)))?;

        let cni_version = plugin
            .get("cniVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            name,
            cni_version,
            disable_check: false,
            plugins: vec![plugin],
            origin: origin.to_path_buf(),
        })
    }
}

/// The `type` field of a plugin configuration, naming its binary
pub fn plugin_type(plugin: &Map<String, Value>) -> Result<&str> {
    match plugin.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() && !kind.contains('/') => Ok(kind),
        Some(kind) => Err(Error::CniConfig(format!("invalid plugin type '{}'", kind))),
        None => Err(Error::CniConfig("plugin has no type".into())),
    }
}

/// Load the first network configuration found in `dir`
///
/// A missing or empty directory yields an unconfigured list.
pub fn load_network_list(dir: &Path) -> Result<NetworkList> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "no CNI configuration directory");
            return Ok(NetworkList::unconfigured(dir));
        }
        Err(e) => return Err(e.into()),
    };

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let wanted = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXTENSIONS.contains(&ext));
        if wanted && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let Some(path) = files.first() else {
        debug!(dir = %dir.display(), "no CNI configuration files");
        return Ok(NetworkList::unconfigured(dir));
    };

    let bytes = fs::read(path)?;
    let list = if path.extension().is_some_and(|ext| ext == "conflist") {
        NetworkList::from_conflist(&bytes, path)?
    } else {
        NetworkList::from_conf(&bytes, path)?
    };

    debug!(
        network = %list.name,
        version = %list.cni_version,
        plugins = list.plugins.len(),
        file = %path.display(),
        "loaded CNI network list"
    );
    Ok(list)
}
