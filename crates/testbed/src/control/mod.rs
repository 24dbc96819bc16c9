//! Control-plane capability required by the hypervisor provider
//!
//! The provider never speaks a wire protocol itself. It needs a client that
//! can submit asynchronous operations, report their status, list occupied
//! resources and perform a handful of synchronous calls; anything
//! implementing [`ControlPlane`] will do.

pub mod memory;

pub use memory::{Call, MemoryControlPlane};

use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque reference to an in-progress asynchronous operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub String);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a submitted task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Still running
    Pending,
    /// Finished successfully
    Done,
    /// Finished unsuccessfully
    Failed(String),
}

/// Power state of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// The machine is running
    Running,
    /// The machine is powered off
    Stopped,
}

/// Asynchronous operations; each one yields a [`TaskHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Clone the image machine into a new machine with id `id`
    Clone {
        /// Image (template machine) id
        image: u32,
        /// Id of the new machine
        id: u32,
        /// Display name
        name: String,
        /// Free-form description
        description: String,
    },
    /// Power on
    Start {
        /// Machine id
        id: u32,
    },
    /// Graceful shutdown
    Shutdown {
        /// Machine id
        id: u32,
    },
    /// Hard power off
    Stop {
        /// Machine id
        id: u32,
    },
    /// Destroy the machine
    Delete {
        /// Machine id
        id: u32,
    },
    /// Reload host networking so created or deleted bridges take effect
    ApplyNetwork,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Clone { image, id, .. } => write!(f, "clone of image {image} into {id}"),
            Operation::Start { id } => write!(f, "start of machine {id}"),
            Operation::Shutdown { id } => write!(f, "shutdown of machine {id}"),
            Operation::Stop { id } => write!(f, "stop of machine {id}"),
            Operation::Delete { id } => write!(f, "deletion of machine {id}"),
            Operation::ApplyNetwork => f.write_str("network reload"),
        }
    }
}

/// Partial machine configuration update
///
/// Unset fields are left untouched by the control plane. `net` and
/// `ipconfig` are keyed by interface index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineConfig {
    /// CPU sockets
    pub sockets: Option<u32>,
    /// Cores per socket
    pub cores: Option<u32>,
    /// Memory in MiB
    pub memory_mb: Option<u32>,
    /// User created on first boot
    pub ci_user: Option<String>,
    /// Public keys authorized for `ci_user`
    pub ssh_keys: Option<String>,
    /// Network attachment descriptor per interface
    pub net: BTreeMap<usize, String>,
    /// IP configuration descriptor per interface
    pub ipconfig: BTreeMap<usize, String>,
}

impl MachineConfig {
    /// Fold `update` into this configuration
    pub fn merge(&mut self, update: MachineConfig) {
        if update.sockets.is_some() {
            self.sockets = update.sockets;
        }
        if update.cores.is_some() {
            self.cores = update.cores;
        }
        if update.memory_mb.is_some() {
            self.memory_mb = update.memory_mb;
        }
        if update.ci_user.is_some() {
            self.ci_user = update.ci_user;
        }
        if update.ssh_keys.is_some() {
            self.ssh_keys = update.ssh_keys;
        }
        self.net.extend(update.net);
        self.ipconfig.extend(update.ipconfig);
    }
}

/// Client for a hypervisor control plane
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Submit an asynchronous operation
    async fn submit(&self, operation: Operation) -> Result<TaskHandle>;

    /// Current status of a submitted task
    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus>;

    /// Ids of every machine known to the control plane
    async fn list_machine_ids(&self) -> Result<BTreeSet<u32>>;

    /// Names of every network starting with `prefix`
    async fn list_network_names(&self, prefix: &str) -> Result<BTreeSet<String>>;

    /// Apply a configuration update to a machine
    async fn configure_machine(&self, id: u32, config: MachineConfig) -> Result<()>;

    /// Power state of a machine
    async fn machine_status(&self, id: u32) -> Result<PowerState>;

    /// Create a bridge; it takes effect after [`Operation::ApplyNetwork`]
    async fn create_bridge(&self, name: &str, comment: &str) -> Result<()>;

    /// Delete a bridge
    async fn delete_bridge(&self, name: &str) -> Result<()>;
}
