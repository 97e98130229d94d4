//! CNI plugin invocation
//!
//! Provides:
//! - The `CniLibrary` seam used by pod and container networks
//! - `ExecCni`, which runs plugin binaries over the CNI exec protocol
//! - Cancellation and per-plugin timeouts for plugin processes

use crate::cni::config::{NetworkList, plugin_type};
use crate::context::Context;
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a running plugin is polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long output is collected after a plugin exits while its pipes stay open
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Per-container parameters passed to every plugin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub args: Vec<(String, String)>,
}

impl RuntimeConf {
    /// `CNI_ARGS` encoding: `K1=V1;K2=V2`
    pub fn cni_args(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Add, delete and check operations over a network list
pub trait CniLibrary: Send + Sync {
    /// Run ADD through the chain and return the final raw result
    fn add_network_list(
        &self,
        ctx: &Context,
        list: &NetworkList,
        rt: &RuntimeConf,
    ) -> Result<Vec<u8>>;

    /// Run DEL through the chain in reverse
    fn del_network_list(&self, ctx: &Context, list: &NetworkList, rt: &RuntimeConf) -> Result<()>;

    /// Run CHECK through the chain against a previously stored result
    fn check_network_list(
        &self,
        ctx: &Context,
        list: &NetworkList,
        rt: &RuntimeConf,
        prev_result: &[u8],
    ) -> Result<()>;
}

/// Error object printed by a failing plugin
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Whether `version` is at least 0.4.0, the first with CHECK
fn supports_check(version: &str) -> bool {
    let mut parts = version.split('.').map(|p| p.parse::<u32>());
    let major = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    (major, minor) >= (0, 4)
}

/// Runs CNI plugin binaries found in a set of search directories
#[derive(Debug, Clone)]
pub struct ExecCni {
    bin_paths: Vec<PathBuf>,
    plugin_timeout: Duration,
}

impl ExecCni {
    pub fn new(bin_paths: Vec<PathBuf>, plugin_timeout: Duration) -> Self {
        Self {
            bin_paths,
            plugin_timeout,
        }
    }

    fn find_plugin(&self, kind: &str) -> Result<PathBuf> {
        self.bin_paths
            .iter()
            .map(|dir| dir.join(kind))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                Error::CniConfig(format!(
                    "plugin '{}' not found in {:?}",
                    kind, self.bin_paths
                ))
            })
    }

    /// Plugin stdin: its own config plus the list's name, version and prior result
    fn plugin_config(
        list: &NetworkList,
        plugin: &Map<String, Value>,
        prev_result: Option<&Value>,
    ) -> Result<Vec<u8>> {
        let mut conf = plugin.clone();
        conf.insert("name".into(), Value::String(list.name.clone()));
        if !list.cni_version.is_empty() {
            conf.insert("cniVersion".into(), Value::String(list.cni_version.clone()));
        }
        if let Some(prev) = prev_result {
            conf.insert("prevResult".into(), prev.clone());
        }
        Ok(serde_json::to_vec(&conf)?)
    }

    /// Execute one plugin and return its stdout
    fn invoke(
        &self,
        ctx: &Context,
        command: &str,
        plugin: &Map<String, Value>,
        rt: &RuntimeConf,
        stdin: &[u8],
    ) -> Result<Vec<u8>> {
        let kind = plugin_type(plugin)?;
        let path = self.find_plugin(kind)?;
        let cni_path = std::env::join_paths(&self.bin_paths)
            .map_err(|e| Error::CniConfig(format!("CNI bin path: {}", e)))?;

        debug!(
            plugin = kind,
            command,
            container = %rt.container_id,
            netns = %rt.netns,
            "invoking CNI plugin"
        );

        let mut child = Command::new(&path)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.netns)
            .env("CNI_IFNAME", &rt.if_name)
            .env("CNI_ARGS", rt.cni_args())
            .env("CNI_PATH", cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(input) = child.stdin.take() {
            feed(input, stdin.to_vec(), kind.to_string());
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let ctx = ctx.child_with_timeout(self.plugin_timeout);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Err(e) = ctx.check() {
                        warn!(plugin = kind, command, error = %e, "terminating CNI plugin");
                        kill(&mut child);
                        return Err(e);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    kill(&mut child);
                    return Err(e.into());
                }
            }
        };

        // A forked helper can hold the pipes open past the plugin's exit
        let grace = ctx.remaining().map_or(OUTPUT_GRACE, |left| left.min(OUTPUT_GRACE));
        let until = Instant::now() + grace;
        let stdout = collect(&stdout, until);
        let stderr = collect(&stderr, until);

        if status.success() {
            return Ok(stdout);
        }

        let (code, message) = match serde_json::from_slice::<PluginError>(&stdout) {
            Ok(err) if err.details.is_empty() => (err.code, err.msg),
            Ok(err) => (err.code, format!("{}; {}", err.msg, err.details)),
            Err(_) => {
                let text = String::from_utf8_lossy(&stderr).trim().to_string();
                let text = if text.is_empty() {
                    format!("exited with {}", status)
                } else {
                    text
                };
                (0, text)
            }
        };

        Err(Error::Cni {
            plugin: kind.to_string(),
            command: command.to_string(),
            code,
            message,
        })
    }
}

/// Write the plugin config from a detached thread
fn feed<W: Write + Send + 'static>(mut input: W, data: Vec<u8>, plugin: String) {
    thread::spawn(move || match input.write_all(&data) {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => {
            debug!(plugin = %plugin, error = %e, "writing CNI plugin config failed");
        }
        _ => {}
    });
}

/// Forward a pipe's contents in chunks until it closes
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        });
    }
    rx
}

/// Gather drained output until the pipe closes or `until` passes
fn collect(rx: &Receiver<Vec<u8>>, until: Instant) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match rx.recv_timeout(until.saturating_duration_since(Instant::now())) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Timeout) => {
                debug!(bytes = out.len(), "CNI plugin output still open after exit");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    out
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl CniLibrary for ExecCni {
    fn add_network_list(
        &self,
        ctx: &Context,
        list: &NetworkList,
        rt: &RuntimeConf,
    ) -> Result<Vec<u8>> {
        if !list.is_configured() {
            return Err(Error::not_found(
                "CNI network configuration",
                list.origin.display().to_string(),
            ));
        }

        let mut prev: Option<Value> = None;
        let mut raw: Option<Vec<u8>> = None;
        for plugin in &list.plugins {
            ctx.check()?;
            let stdin = Self::plugin_config(list, plugin, prev.as_ref())?;
            let out = self.invoke(ctx, "ADD", plugin, rt, &stdin)?;
            if out.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            prev = Some(serde_json::from_slice(&out)?);
            raw = Some(out);
        }

        raw.map(|out| out.trim_ascii().to_vec()).ok_or_else(|| Error::Cni {
            plugin: list.name.clone(),
            command: "ADD".to_string(),
            code: 0,
            message: "no plugin returned a result".to_string(),
        })
    }

    fn del_network_list(&self, ctx: &Context, list: &NetworkList, rt: &RuntimeConf) -> Result<()> {
        let mut failed = None;
        let mut gone = None;
        for plugin in list.plugins.iter().rev() {
            ctx.check()?;
            let stdin = Self::plugin_config(list, plugin, None)?;
            match self.invoke(ctx, "DEL", plugin, rt, &stdin) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(container = %rt.container_id, error = %e, "CNI DEL found nothing to remove");
                    gone.get_or_insert(e);
                }
                Err(e) => {
                    warn!(container = %rt.container_id, error = %e, "CNI DEL failed");
                    failed.get_or_insert(e);
                }
            }
        }

        // Not-found only surfaces when every failure was not-found
        match failed.or(gone) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_network_list(
        &self,
        ctx: &Context,
        list: &NetworkList,
        rt: &RuntimeConf,
        prev_result: &[u8],
    ) -> Result<()> {
        if !supports_check(&list.cni_version) || list.disable_check {
            debug!(network = %list.name, version = %list.cni_version, "skipping CNI CHECK");
            return Ok(());
        }

        let prev: Value = serde_json::from_slice(prev_result)?;
        for plugin in &list.plugins {
            ctx.check()?;
            let stdin = Self::plugin_config(list, plugin, Some(&prev))?;
            self.invoke(ctx, "CHECK", plugin, rt, &stdin)?;
        }
        Ok(())
    }
}
