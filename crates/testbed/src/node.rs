//! Handle for one provisioned machine

use crate::blueprint::Template;
use crate::control::{ControlPlane, Operation, PowerState};
use crate::error::Result;
use crate::network::Interface;
use crate::task::{TaskPolicy, run_operation};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use testbed_exec::{SshExecutor, SshOutput};
use tracing::{debug, info, warn};

/// Connect timeout used by [`Node::ssh`] when the provider sets none
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider services every node of a build shares
#[derive(Clone)]
pub(crate) struct NodeRuntime {
    pub(crate) control: Arc<dyn ControlPlane>,
    pub(crate) executor: SshExecutor,
    pub(crate) policy: TaskPolicy,
    pub(crate) ssh_timeout: Duration,
}

/// A provisioned machine
///
/// Nodes are created stopped. Interface 0 is the management interface,
/// which is what [`ssh`](Node::ssh) connects to.
pub struct Node {
    template: Arc<Template>,
    id: u32,
    management_address: IpAddr,
    interfaces: Vec<Interface>,
    runtime: NodeRuntime,
    closed: AtomicBool,
}

impl Node {
    pub(crate) fn new(
        template: Arc<Template>,
        id: u32,
        management_address: IpAddr,
        interfaces: Vec<Interface>,
        runtime: NodeRuntime,
    ) -> Self {
        Self {
            template,
            id,
            management_address,
            interfaces,
            runtime,
            closed: AtomicBool::new(false),
        }
    }

    /// Template the node was built from
    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Display name, taken from the template
    pub fn name(&self) -> &str {
        self.template.name()
    }

    /// Machine id assigned by the provider
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Address of the management interface
    pub fn management_address(&self) -> IpAddr {
        self.management_address
    }

    /// Interfaces, management first
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Interface at `index`
    pub fn interface(&self, index: usize) -> Option<&Interface> {
        self.interfaces.get(index)
    }

    /// Power the machine on and wait for the task
    pub async fn start(&self) -> Result<()> {
        info!("Starting {} ({})", self.name(), self.id);
        self.run(Operation::Start { id: self.id }).await
    }

    /// Shut the machine down gracefully and wait for the task
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping {} ({})", self.name(), self.id);
        self.run(Operation::Shutdown { id: self.id }).await
    }

    /// Current power state
    pub async fn power_state(&self) -> Result<PowerState> {
        self.runtime.control.machine_status(self.id).await
    }

    /// Run `command` over SSH with the provider's connect timeout
    ///
    /// A non-zero exit code is returned, not raised.
    pub async fn ssh(&self, command: &str) -> Result<SshOutput> {
        self.ssh_with_timeout(command, self.runtime.ssh_timeout)
            .await
    }

    /// Run `command` over SSH, giving up connecting after `timeout`
    pub async fn ssh_with_timeout(&self, command: &str, timeout: Duration) -> Result<SshOutput> {
        debug!("Running `{}` on {}", command, self.name());
        Ok(self
            .runtime
            .executor
            .run(self.management_address, command, timeout)
            .await?)
    }

    /// Run `command` over SSH; a non-zero exit is a
    /// [`RemoteExecFailure`](crate::Error::RemoteExecFailure)
    pub async fn must_ssh(&self, command: &str) -> Result<SshOutput> {
        self.must_ssh_with_timeout(command, self.runtime.ssh_timeout)
            .await
    }

    /// [`must_ssh`](Self::must_ssh) with an explicit connect timeout
    pub async fn must_ssh_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<SshOutput> {
        debug!("Running `{}` on {}", command, self.name());
        Ok(self
            .runtime
            .executor
            .must_run(self.management_address, command, timeout)
            .await?)
    }

    /// Destroy the machine, powering it off first if it is running
    ///
    /// Only the first call does anything. Safe on a node that was never
    /// started. The delete is attempted even when powering off fails; the
    /// first error is returned.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let stopped = match self.power_state().await {
            Ok(PowerState::Running) => self.run(Operation::Stop { id: self.id }).await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = &stopped {
            warn!("Failed to power off {} ({}): {}", self.name(), self.id, e);
        }

        info!("Deleting {} ({})", self.name(), self.id);
        let deleted = self.run(Operation::Delete { id: self.id }).await;
        stopped.and(deleted)
    }

    async fn run(&self, operation: Operation) -> Result<()> {
        run_operation(
            self.runtime.control.as_ref(),
            operation,
            self.runtime.policy,
        )
        .await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("id", &self.id)
            .field("management_address", &self.management_address)
            .field("interfaces", &self.interfaces)
            .finish_non_exhaustive()
    }
}
