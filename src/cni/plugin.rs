//! Pod and container networks
//!
//! A `CniPlugin` builds one `PodNetwork` per sandbox. Each pod network
//! hands out `ContainerNetwork`s, which attach to, check and tear down the
//! network namespace of a container's process.

use crate::cni::config::{NetworkList, load_network_list};
use crate::cni::exec::{CniLibrary, ExecCni, RuntimeConf};
use crate::cni::result::{CniResult, NetworkStatus};
use crate::cni::state::{Lifecycle, NetworkState};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manifest::CniConfig;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Key of the raw attach result in a sandbox's network data
pub const RESULT_KEY: &str = "result";

pub const ANNOTATION_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
pub const ANNOTATION_POD_NAME: &str = "io.kubernetes.pod.name";

/// Network namespace of a running process
pub fn netns_for_pid(pid: i64) -> String {
    format!("/proc/{}/ns/net", pid)
}

/// Runtime facts about a container handed to network operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertiesRunning {
    /// Process ID; 0 when no process is running
    pub pid: i64,
    /// Persisted network data, holding the attach result under `RESULT_KEY`
    pub data: HashMap<String, String>,
}

impl PropertiesRunning {
    pub fn new(pid: i64) -> Self {
        Self {
            pid,
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, String>) -> Self {
        self.data = data;
        self
    }
}

/// Data produced by a successful attach, ready to persist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkResult {
    pub data: HashMap<String, String>,
}

impl NetworkResult {
    /// Raw CNI result payload
    pub fn raw(&self) -> Option<&str> {
        self.data.get(RESULT_KEY).map(String::as_str)
    }
}

/// Annotations identifying a pod to CNI plugins
pub fn pod_annotations(namespace: &str, name: &str) -> HashMap<String, String> {
    HashMap::from([
        (ANNOTATION_POD_NAMESPACE.to_string(), namespace.to_string()),
        (ANNOTATION_POD_NAME.to_string(), name.to_string()),
    ])
}

fn cni_args(
    sandbox_id: &str,
    annotations: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut args = vec![("IgnoreUnknown".to_string(), "1".to_string())];
    if let Some(namespace) = annotations.get(ANNOTATION_POD_NAMESPACE) {
        args.push(("K8S_POD_NAMESPACE".to_string(), namespace.clone()));
    }
    if let Some(name) = annotations.get(ANNOTATION_POD_NAME) {
        args.push(("K8S_POD_NAME".to_string(), name.clone()));
    }
    args.push((
        "K8S_POD_INFRA_CONTAINER_ID".to_string(),
        sandbox_id.to_string(),
    ));
    args
}

/// Entry point for CNI-backed networking
#[derive(Clone)]
pub struct CniPlugin {
    config: CniConfig,
    library: Arc<dyn CniLibrary>,
}

impl CniPlugin {
    pub fn new(config: CniConfig, library: Arc<dyn CniLibrary>) -> Self {
        Self { config, library }
    }

    /// Plugin running CNI binaries from the configured search path
    pub fn from_config(config: &CniConfig) -> Self {
        let exec = ExecCni::new(
            config.bin_paths.clone(),
            Duration::from_secs(config.plugin_timeout_secs),
        );
        Self::new(config.clone(), Arc::new(exec))
    }

    /// Build the network of one sandbox
    ///
    /// Fails only when the configuration directory holds malformed content;
    /// an absent network configuration is not an error here.
    pub fn pod_network(
        &self,
        sandbox_id: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<PodNetwork> {
        let list = load_network_list(&self.config.conf_dir)?;
        let runtime = RuntimeConf {
            container_id: sandbox_id.to_string(),
            netns: self.config.netns_dir.join(sandbox_id).display().to_string(),
            if_name: self.config.interface.clone(),
            args: cni_args(sandbox_id, annotations),
        };

        Ok(PodNetwork {
            shared: Arc::new(PodShared {
                sandbox_id: sandbox_id.to_string(),
                list,
                runtime,
                annotations: annotations.clone(),
                library: Arc::clone(&self.library),
            }),
            containers: HashMap::new(),
        })
    }

    /// Attach a running container to its pod's network
    pub fn attach_interface(
        &self,
        ctx: &Context,
        namespace: &str,
        sandbox: &str,
        container_id: &str,
        pid: i64,
    ) -> Result<NetworkResult> {
        let mut pod = self.pod_network(sandbox, &pod_annotations(namespace, sandbox))?;
        pod.container_network(container_id, &HashMap::new())
            .when_started(ctx, &PropertiesRunning::new(pid))
    }

    /// Detach a container from its pod's network; `pid` may be 0
    pub fn detach_interface(
        &self,
        ctx: &Context,
        namespace: &str,
        sandbox: &str,
        container_id: &str,
        pid: i64,
    ) -> Result<()> {
        let mut pod = self.pod_network(sandbox, &pod_annotations(namespace, sandbox))?;
        let result = pod
            .container_network(container_id, &HashMap::new())
            .when_deleted(ctx, Some(&PropertiesRunning::new(pid)));
        pod.remove_container(container_id);
        result
    }

    /// Check a container's network against its stored attach result
    pub fn interface_status(
        &self,
        ctx: &Context,
        namespace: &str,
        sandbox: &str,
        container_id: &str,
        props: &PropertiesRunning,
    ) -> Result<NetworkStatus> {
        let mut pod = self.pod_network(sandbox, &pod_annotations(namespace, sandbox))?;
        pod.container_network(container_id, &HashMap::new())
            .status(ctx, props)
    }
}

/// State shared by a pod network and its container networks
struct PodShared {
    sandbox_id: String,
    list: NetworkList,
    runtime: RuntimeConf,
    annotations: HashMap<String, String>,
    library: Arc<dyn CniLibrary>,
}

/// Network of one sandbox
pub struct PodNetwork {
    shared: Arc<PodShared>,
    containers: HashMap<String, ContainerNetwork>,
}

impl PodNetwork {
    pub fn sandbox_id(&self) -> &str {
        &self.shared.sandbox_id
    }

    pub fn network_list(&self) -> &NetworkList {
        &self.shared.list
    }

    /// Runtime configuration template for this pod's containers
    pub fn runtime_conf(&self) -> &RuntimeConf {
        &self.shared.runtime
    }

    /// Network of `container_id`, created on first request
    pub fn container_network(
        &mut self,
        container_id: &str,
        annotations: &HashMap<String, String>,
    ) -> &mut ContainerNetwork {
        let shared = &self.shared;
        self.containers
            .entry(container_id.to_string())
            .or_insert_with(|| ContainerNetwork::new(Arc::clone(shared), container_id, annotations))
    }

    pub fn get(&self, container_id: &str) -> Option<&ContainerNetwork> {
        self.containers.get(container_id)
    }

    /// Forget a container, typically once it has been torn down
    pub fn remove_container(&mut self, container_id: &str) -> Option<ContainerNetwork> {
        self.containers.remove(container_id)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// Network of one container within a pod
///
/// Not internally synchronized: callers serialize attach, status and
/// teardown for the same container.
pub struct ContainerNetwork {
    pod: Arc<PodShared>,
    runtime: RuntimeConf,
    lifecycle: Lifecycle,
}

impl ContainerNetwork {
    fn new(pod: Arc<PodShared>, container_id: &str, annotations: &HashMap<String, String>) -> Self {
        let mut merged = pod.annotations.clone();
        merged.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));

        let runtime = RuntimeConf {
            container_id: container_id.to_string(),
            args: cni_args(&pod.sandbox_id, &merged),
            ..pod.runtime.clone()
        };

        Self {
            pod,
            runtime,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.runtime.container_id
    }

    pub fn runtime_conf(&self) -> &RuntimeConf {
        &self.runtime
    }

    pub fn state(&self) -> NetworkState {
        self.lifecycle.state()
    }

    fn target(&self) -> String {
        format!("{}/{}", self.pod.sandbox_id, self.runtime.container_id)
    }

    /// Attach the network once the container's process is running
    pub fn when_started(&mut self, ctx: &Context, props: &PropertiesRunning) -> Result<NetworkResult> {
        self.lifecycle.require(NetworkState::Unattached, "attach")?;
        if props.pid <= 0 {
            return Err(Error::NoProcess(self.runtime.container_id.clone()));
        }
        ctx.check()?;

        let runtime = RuntimeConf {
            netns: netns_for_pid(props.pid),
            ..self.runtime.clone()
        };
        let raw = self
            .pod
            .library
            .add_network_list(ctx, &self.pod.list, &runtime)
            .map_err(|e| e.context("attach", self.target()))?;

        self.runtime = runtime;
        self.lifecycle.attach()?;
        info!(
            sandbox = %self.pod.sandbox_id,
            container = %self.runtime.container_id,
            pid = props.pid,
            "attached container network"
        );

        let raw = String::from_utf8_lossy(&raw).into_owned();
        Ok(NetworkResult {
            data: HashMap::from([(RESULT_KEY.to_string(), raw)]),
        })
    }

    /// Tear down the network, tolerating resources that are already gone
    pub fn when_deleted(&mut self, ctx: &Context, props: Option<&PropertiesRunning>) -> Result<()> {
        if self.state() == NetworkState::TornDown {
            debug!(container = %self.runtime.container_id, "network already torn down");
            return Ok(());
        }

        let pid = props.map_or(0, |p| p.pid);
        let netns = netns_for_pid(pid);
        let runtime = RuntimeConf {
            netns: if pid > 0 && Path::new(&netns).exists() {
                netns
            } else {
                String::new()
            },
            ..self.runtime.clone()
        };

        match self.pod.library.del_network_list(ctx, &self.pod.list, &runtime) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(container = %self.runtime.container_id, error = %e, "network already removed");
            }
            Err(e) => return Err(e.context("detach", self.target())),
        }

        self.lifecycle.teardown()?;
        info!(
            sandbox = %self.pod.sandbox_id,
            container = %self.runtime.container_id,
            pid,
            "tore down container network"
        );
        Ok(())
    }

    /// Check the network and report what the stored attach result describes
    pub fn status(&self, ctx: &Context, props: &PropertiesRunning) -> Result<NetworkStatus> {
        if self.state() == NetworkState::TornDown {
            return Err(Error::not_found("container network", self.target()));
        }
        let raw = props
            .data
            .get(RESULT_KEY)
            .ok_or_else(|| Error::not_found("network result", self.target()))?;
        let result = CniResult::parse(raw.as_bytes())?;

        let mut runtime = self.runtime.clone();
        if props.pid > 0 {
            runtime.netns = netns_for_pid(props.pid);
        }
        self.pod
            .library
            .check_network_list(ctx, &self.pod.list, &runtime, raw.as_bytes())
            .map_err(|e| e.context("status", self.target()))?;

        Ok(result.status())
    }
}
