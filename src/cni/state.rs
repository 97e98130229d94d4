//! Container network state machine
//!
//! Tracks one container's attachment using the state-machines crate in
//! dynamic mode, driven by runtime lifecycle events.

use crate::error::Error;
use state_machines::state_machine;

state_machine! {
    name: ContainerNetworkMachine,
    dynamic: true,
    initial: Unattached,
    states: [Unattached, Attached, TornDown],
    events {
        attach {
            transition: { from: Unattached, to: Attached }
        }
        teardown {
            transition: { from: [Unattached, Attached], to: TornDown }
        }
    }
}

/// Attachment state of a container network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unattached,
    Attached,
    TornDown,
}

impl NetworkState {
    /// Parse state from the machine's state name
    pub fn from_name(s: &str) -> Self {
        match s {
            "Attached" => NetworkState::Attached,
            "TornDown" => NetworkState::TornDown,
            _ => NetworkState::Unattached,
        }
    }
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkState::Unattached => "unattached",
            NetworkState::Attached => "attached",
            NetworkState::TornDown => "torn down",
        };
        write!(f, "{}", s)
    }
}

/// State holder for one container's network
pub struct Lifecycle {
    machine: DynamicContainerNetworkMachine<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: ContainerNetworkMachine::new(()).into_dynamic(),
        }
    }

    pub fn state(&self) -> NetworkState {
        NetworkState::from_name(self.machine.current_state())
    }

    /// Fail unless the network is currently `expected`
    pub fn require(&self, expected: NetworkState, action: &str) -> crate::error::Result<()> {
        let current = self.state();
        if current != expected {
            return Err(Error::InvalidTransition(format!(
                "cannot {} a network that is {}",
                action, current
            )));
        }
        Ok(())
    }

    /// Trigger attach event
    pub fn attach(&mut self) -> crate::error::Result<()> {
        self.machine
            .handle(ContainerNetworkMachineEvent::Attach)
            .map_err(|e| Error::InvalidTransition(format!("attach: {:?}", e)))
    }

    /// Trigger teardown event
    pub fn teardown(&mut self) -> crate::error::Result<()> {
        self.machine
            .handle(ContainerNetworkMachineEvent::Teardown)
            .map_err(|e| Error::InvalidTransition(format!("teardown: {:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = ContainerNetworkMachine::new(()).into_dynamic();
        assert_eq!(machine.current_state(), "Unattached");
    }

    #[test]
    fn test_attach_then_teardown() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.attach().unwrap();
        assert_eq!(lifecycle.state(), NetworkState::Attached);

        lifecycle.teardown().unwrap();
        assert_eq!(lifecycle.state(), NetworkState::TornDown);
    }

    #[test]
    fn test_teardown_without_attach() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.teardown().unwrap();
        assert_eq!(lifecycle.state(), NetworkState::TornDown);
    }

    #[test]
    fn test_torn_down_is_terminal() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.teardown().unwrap();
        assert!(lifecycle.attach().is_err());
        assert!(lifecycle.teardown().is_err());
    }

    #[test]
    fn test_double_attach_rejected() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.attach().unwrap();
        assert!(lifecycle.attach().is_err());
        assert!(lifecycle.require(NetworkState::Unattached, "attach").is_err());
    }

    #[test]
    fn test_rejected_transition_is_invalid_transition() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.teardown().unwrap();
        let err = lifecycle.attach().unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }
}
