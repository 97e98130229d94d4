//! CNI-based pod and container networking
//!
//! Provides:
//! - Network list loading from the CNI configuration directory
//! - Plugin invocation over the CNI exec protocol
//! - Pod and container network handles with an attach/teardown lifecycle
//! - Parsing of stored attach results for status reporting

pub mod config;
pub mod exec;
pub mod plugin;
pub mod result;
pub mod state;

pub use config::{NetworkList, load_network_list};
pub use exec::{CniLibrary, ExecCni, RuntimeConf};
pub use plugin::{
    CniPlugin, ContainerNetwork, NetworkResult, PodNetwork, PropertiesRunning, RESULT_KEY,
    netns_for_pid, pod_annotations,
};
pub use result::{CniResult, NetworkStatus};
pub use state::NetworkState;
