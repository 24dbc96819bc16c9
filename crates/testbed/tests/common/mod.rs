//! Shared fixtures for testbed integration tests

#![allow(dead_code)]

use std::sync::Arc;
use testbed::control::Call;
use testbed::{HypervisorProvider, MemoryControlPlane, Operation};
use testbed_config::{HypervisorConfig, ManagementNetwork, Timeouts};
use testbed_exec::backends::scripted::ScriptedShell;

/// Image backing the `debian-12` distribution
pub const DEBIAN_IMAGE: u32 = 9000;

/// Install a subscriber that writes through the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Settings with fast polling and a `debian-12` image
pub fn config() -> HypervisorConfig {
    let mut config = HypervisorConfig::new(ManagementNetwork::new(
        "vmbr0",
        "10.0.0.10/24".parse().unwrap(),
    ))
    .with_image("debian-12", DEBIAN_IMAGE);
    config.internet_bridge = Some("vmbr99".to_string());
    config.ssh.public_key = Some("ssh-ed25519 AAAA test@testbed".to_string());
    config.timeouts = Timeouts {
        task_ms: 200,
        task_poll_ms: 1,
        ssh_connect_ms: 200,
        ssh_poll_ms: 1,
        ssh_retry_ms: 1,
    };
    config
}

/// A provider wired to in-memory doubles
pub struct Harness {
    /// Control plane the provider talks to
    pub control: Arc<MemoryControlPlane>,
    /// Remote shell the provider's nodes talk to
    pub shell: ScriptedShell,
    /// The provider under test
    pub provider: HypervisorProvider,
}

impl Harness {
    /// Default settings, a control plane holding only the image and the
    /// management bridge, and a shell where every command succeeds
    pub fn new() -> Self {
        Self::with(config(), default_control(), ScriptedShell::new())
    }

    /// Custom settings, control plane and shell
    pub fn with(config: HypervisorConfig, control: MemoryControlPlane, shell: ScriptedShell) -> Self {
        init_tracing();
        let control = Arc::new(control);
        let provider =
            HypervisorProvider::new(control.clone(), Arc::new(shell.clone()), config).unwrap();
        Self {
            control,
            shell,
            provider,
        }
    }

    /// Number of clone operations submitted
    pub fn clones(&self) -> usize {
        self.control
            .count_operations(|op| matches!(op, Operation::Clone { .. }))
    }

    /// Number of delete operations submitted
    pub fn deletes(&self) -> usize {
        self.control
            .count_operations(|op| matches!(op, Operation::Delete { .. }))
    }

    /// Number of network reloads submitted
    pub fn network_reloads(&self) -> usize {
        self.control
            .count_operations(|op| matches!(op, Operation::ApplyNetwork))
    }

    /// Names of every bridge created
    pub fn created_bridges(&self) -> Vec<String> {
        self.control
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateBridge(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}

/// Control plane holding the `debian-12` image and the management bridge
pub fn default_control() -> MemoryControlPlane {
    MemoryControlPlane::new()
        .with_machine(DEBIAN_IMAGE)
        .with_network("vmbr0")
}
