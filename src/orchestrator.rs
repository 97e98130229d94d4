//! Container lifecycle glue for CNI networking
//!
//! Resolves a container's sandbox and process, drives the CNI plugin, and
//! persists the attach result onto the sandbox.

use crate::cni::{CniPlugin, NetworkStatus, PropertiesRunning};
use crate::context::Context;
use crate::error::Result;
use std::collections::HashMap;
use tracing::{debug, info};

/// Identity of a sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxMetadata {
    pub namespace: String,
    pub name: String,
}

/// Network settings persisted with a sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxNetworkConfig {
    /// Mode specific data; the CNI result lives under `cni::RESULT_KEY`
    pub mode_data: HashMap<String, String>,
}

/// Process state of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessState {
    pub pid: i64,
}

/// A persisted sandbox record
pub trait Sandbox {
    fn metadata(&self) -> &SandboxMetadata;
    fn network_config(&self) -> &SandboxNetworkConfig;
    fn network_config_mut(&mut self) -> &mut SandboxNetworkConfig;
    /// Persist the sandbox
    fn apply(&mut self) -> Result<()>;
}

/// A container record able to resolve its sandbox and process
pub trait Container {
    type Sandbox: Sandbox;

    fn id(&self) -> &str;
    fn sandbox(&self) -> Result<Self::Sandbox>;
    /// Current process state; a not-found error means no process exists
    fn state(&self) -> Result<ProcessState>;
}

/// Attaches and detaches containers on lifecycle events
#[derive(Clone)]
pub struct AttachOrchestrator {
    plugin: CniPlugin,
}

impl AttachOrchestrator {
    pub fn new(plugin: CniPlugin) -> Self {
        Self { plugin }
    }

    /// Attach a started container and record the result on its sandbox
    pub fn attach_cni<C: Container>(&self, ctx: &Context, container: &C) -> Result<()> {
        let mut sandbox = container.sandbox()?;
        let state = container.state()?;
        let meta = sandbox.metadata().clone();

        let result = self.plugin.attach_interface(
            ctx,
            &meta.namespace,
            &meta.name,
            container.id(),
            state.pid,
        )?;

        sandbox.network_config_mut().mode_data.extend(result.data);
        sandbox.apply()?;

        info!(
            namespace = %meta.namespace,
            sandbox = %meta.name,
            container = container.id(),
            "stored CNI result"
        );
        Ok(())
    }

    /// Detach a container; its process may already be gone
    pub fn detach_cni<C: Container>(&self, ctx: &Context, container: &C) -> Result<()> {
        let sandbox = container.sandbox()?;
        let pid = running_pid(container)?;
        let meta = sandbox.metadata();

        self.plugin
            .detach_interface(ctx, &meta.namespace, &meta.name, container.id(), pid)
    }

    /// Check a container's network against the result stored on its sandbox
    pub fn status_cni<C: Container>(&self, ctx: &Context, container: &C) -> Result<NetworkStatus> {
        let sandbox = container.sandbox()?;
        let pid = running_pid(container)?;
        let meta = sandbox.metadata();
        let props =
            PropertiesRunning::new(pid).with_data(sandbox.network_config().mode_data.clone());

        self.plugin
            .interface_status(ctx, &meta.namespace, &meta.name, container.id(), &props)
    }
}

/// Process ID of `container`, or 0 when its process no longer exists
fn running_pid<C: Container>(container: &C) -> Result<i64> {
    match container.state() {
        Ok(state) => Ok(state.pid),
        Err(e) if e.is_not_found() => {
            debug!(container = container.id(), "process already gone");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::testing::{RESULT, RecordingLibrary};
    use crate::cni::{CniLibrary, RESULT_KEY};
    use crate::error::Error;
    use crate::manifest::CniConfig;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::sync::Arc;

    struct FakeSandbox {
        meta: SandboxMetadata,
        network: SandboxNetworkConfig,
        store: Rc<RefCell<Option<SandboxNetworkConfig>>>,
        fail_apply: bool,
    }

    impl Sandbox for FakeSandbox {
        fn metadata(&self) -> &SandboxMetadata {
            &self.meta
        }

        fn network_config(&self) -> &SandboxNetworkConfig {
            &self.network
        }

        fn network_config_mut(&mut self) -> &mut SandboxNetworkConfig {
            &mut self.network
        }

        fn apply(&mut self) -> Result<()> {
            if self.fail_apply {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            *self.store.borrow_mut() = Some(self.network.clone());
            Ok(())
        }
    }

    enum Process {
        Running(i64),
        Gone,
        Broken,
    }

    struct FakeContainer {
        id: String,
        has_sandbox: bool,
        process: Process,
        fail_apply: bool,
        store: Rc<RefCell<Option<SandboxNetworkConfig>>>,
    }

    impl FakeContainer {
        fn new(process: Process) -> Self {
            Self {
                id: "c1".to_string(),
                has_sandbox: true,
                process,
                fail_apply: false,
                store: Rc::new(RefCell::new(None)),
            }
        }

        fn stored(&self) -> Option<SandboxNetworkConfig> {
            self.store.borrow().clone()
        }
    }

    impl Container for FakeContainer {
        type Sandbox = FakeSandbox;

        fn id(&self) -> &str {
            &self.id
        }

        fn sandbox(&self) -> Result<FakeSandbox> {
            if !self.has_sandbox {
                return Err(Error::not_found("sandbox", "web"));
            }
            Ok(FakeSandbox {
                meta: SandboxMetadata {
                    namespace: "default".to_string(),
                    name: "web".to_string(),
                },
                network: self.stored().unwrap_or_default(),
                store: Rc::clone(&self.store),
                fail_apply: self.fail_apply,
            })
        }

        fn state(&self) -> Result<ProcessState> {
            match self.process {
                Process::Running(pid) => Ok(ProcessState { pid }),
                Process::Gone => Err(Error::not_found("container", self.id.clone())),
                Process::Broken => Err(Error::Io(std::io::Error::other("state db locked"))),
            }
        }
    }

    fn orchestrator(library: &Arc<RecordingLibrary>) -> AttachOrchestrator {
        let library: Arc<dyn CniLibrary> = library.clone();
        let config = CniConfig {
            conf_dir: PathBuf::from("/nonexistent/net.d"),
            ..CniConfig::default()
        };
        AttachOrchestrator::new(CniPlugin::new(config, library))
    }

    #[test]
    fn test_attach_persists_result() {
        let library = Arc::new(RecordingLibrary::default());
        let container = FakeContainer::new(Process::Running(42));

        orchestrator(&library)
            .attach_cni(&Context::background(), &container)
            .unwrap();

        let stored = container.stored().unwrap();
        assert_eq!(stored.mode_data[RESULT_KEY], RESULT);

        let calls = library.calls();
        assert_eq!(calls[0].0, "ADD");
        assert_eq!(calls[0].1.netns, "/proc/42/ns/net");
        assert!(calls[0].1.cni_args().contains("K8S_POD_NAMESPACE=default"));
    }

    #[test]
    fn test_attach_without_process_fails() {
        let library = Arc::new(RecordingLibrary::default());
        let container = FakeContainer::new(Process::Gone);

        let err = orchestrator(&library)
            .attach_cni(&Context::background(), &container)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(container.stored().is_none());
        assert!(library.calls().is_empty());
    }

    #[test]
    fn test_attach_zero_pid_fails() {
        let library = Arc::new(RecordingLibrary::default());
        let container = FakeContainer::new(Process::Running(0));

        let err = orchestrator(&library)
            .attach_cni(&Context::background(), &container)
            .unwrap_err();
        assert!(matches!(err, Error::NoProcess(_)));
        assert!(container.stored().is_none());
    }

    #[test]
    fn test_attach_plugin_failure_commits_nothing() {
        let library = Arc::new(RecordingLibrary::default());
        library.fail_next(Error::Cni {
            plugin: "bridge".into(),
            command: "ADD".into(),
            code: 7,
            message: "bad config".into(),
        });
        let container = FakeContainer::new(Process::Running(42));

        assert!(
            orchestrator(&library)
                .attach_cni(&Context::background(), &container)
                .is_err()
        );
        assert!(container.stored().is_none());
    }

    #[test]
    fn test_attach_persist_failure_surfaces() {
        let library = Arc::new(RecordingLibrary::default());
        let mut container = FakeContainer::new(Process::Running(42));
        container.fail_apply = true;

        let err = orchestrator(&library)
            .attach_cni(&Context::background(), &container)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(container.stored().is_none());
    }

    #[test]
    fn test_detach_with_process_gone() {
        let library = Arc::new(RecordingLibrary::default());
        let container = FakeContainer::new(Process::Gone);

        orchestrator(&library)
            .detach_cni(&Context::background(), &container)
            .unwrap();

        let calls = library.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "DEL");
        assert_eq!(calls[0].1.netns, "");
    }

    #[test]
    fn test_detach_other_state_error_is_fatal() {
        let library = Arc::new(RecordingLibrary::default());
        let container = FakeContainer::new(Process::Broken);

        assert!(
            orchestrator(&library)
                .detach_cni(&Context::background(), &container)
                .is_err()
        );
        assert!(library.calls().is_empty());
    }

    #[test]
    fn test_detach_missing_sandbox_is_fatal() {
        let library = Arc::new(RecordingLibrary::default());
        let mut container = FakeContainer::new(Process::Running(42));
        container.has_sandbox = false;

        assert!(
            orchestrator(&library)
                .detach_cni(&Context::background(), &container)
                .is_err()
        );
    }

    #[test]
    fn test_status_after_attach() {
        let library = Arc::new(RecordingLibrary::default());
        let container = FakeContainer::new(Process::Running(42));
        let orchestrator = orchestrator(&library);
        let ctx = Context::background();

        assert!(orchestrator.status_cni(&ctx, &container).unwrap_err().is_not_found());

        orchestrator.attach_cni(&ctx, &container).unwrap();
        let status = orchestrator.status_cni(&ctx, &container).unwrap();
        assert_eq!(status.ips[0].address.to_string(), "10.22.0.64/16");
    }
}
