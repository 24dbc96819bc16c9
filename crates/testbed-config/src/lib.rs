//! # Testbed Configuration
//!
//! YAML configuration for testbed providers.
//!
//! A configuration file names the images backing each distribution, the
//! management network new machines are attached to, and the timeouts used
//! while waiting on the control plane and on SSH.
//!
//! ```yaml
//! version: "1.0"
//! provider:
//!   images:
//!     debian-12: 9000
//!   management:
//!     bridge: vmbr0
//!     network: 10.0.0.10/24
//!   internet_bridge: vmbr1
//!   ssh:
//!     public_key: "${TESTBED_SSH_KEY}"
//! ```

#![warn(missing_docs)]

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod parser;

pub use parser::{parse_file, parse_str, substitute_env_vars};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable not found
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Hypervisor provider settings
    pub provider: HypervisorConfig,
}

/// Settings for a hypervisor backed provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HypervisorConfig {
    /// Image (template machine) id registered for each distribution
    pub images: BTreeMap<String, u32>,

    /// Management network every machine's first interface joins
    pub management: ManagementNetwork,

    /// Lowest machine id handed out
    #[serde(default = "default_initial_machine_id")]
    pub initial_machine_id: u32,

    /// Bridge for the general-purpose egress interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internet_bridge: Option<String>,

    /// Bridge creation settings
    #[serde(default)]
    pub bridges: BridgeSettings,

    /// Maximum number of interfaces a template may request
    #[serde(default = "default_max_interfaces")]
    pub max_interfaces: usize,

    /// Description attached to every cloned machine
    #[serde(default = "default_description")]
    pub description: String,

    /// Polling and deadline settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Remote shell settings
    #[serde(default)]
    pub ssh: SshSettings,
}

impl HypervisorConfig {
    /// Minimal configuration with default settings
    pub fn new(management: ManagementNetwork) -> Self {
        Self {
            images: BTreeMap::new(),
            management,
            initial_machine_id: default_initial_machine_id(),
            internet_bridge: None,
            bridges: BridgeSettings::default(),
            max_interfaces: default_max_interfaces(),
            description: default_description(),
            timeouts: Timeouts::default(),
            ssh: SshSettings::default(),
        }
    }

    /// Register the image backing a distribution
    pub fn with_image(mut self, distribution: impl Into<String>, image: u32) -> Self {
        self.images.insert(distribution.into(), image);
        self
    }
}

/// Management network settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagementNetwork {
    /// Bridge the management interface is attached to
    pub bridge: String,

    /// Address of the machine with the initial id, with the network prefix
    pub network: IpNet,
}

impl ManagementNetwork {
    /// Create management settings
    pub fn new(bridge: impl Into<String>, network: IpNet) -> Self {
        Self {
            bridge: bridge.into(),
            network,
        }
    }
}

/// Bridge creation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSettings {
    /// Whether blueprints may request bridges at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name prefix; the numeric suffix is allocated
    #[serde(default = "default_bridge_prefix")]
    pub prefix: String,

    /// Comment attached to created bridges
    #[serde(default = "default_description")]
    pub comment: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_bridge_prefix(),
            comment: default_description(),
        }
    }
}

/// Polling intervals and deadlines, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    /// Deadline for an asynchronous control-plane task
    pub task_ms: u64,
    /// Interval between task status polls
    pub task_poll_ms: u64,
    /// Default deadline for opening an SSH session
    pub ssh_connect_ms: u64,
    /// Interval between SSH channel liveness polls
    pub ssh_poll_ms: u64,
    /// Delay between failed SSH session attempts
    pub ssh_retry_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            task_ms: 30_000,
            task_poll_ms: 1_000,
            ssh_connect_ms: 30_000,
            ssh_poll_ms: 100,
            ssh_retry_ms: 500,
        }
    }
}

impl Timeouts {
    /// Task deadline
    pub fn task(&self) -> Duration {
        Duration::from_millis(self.task_ms)
    }

    /// Task poll interval
    pub fn task_poll(&self) -> Duration {
        Duration::from_millis(self.task_poll_ms)
    }

    /// SSH connect deadline
    pub fn ssh_connect(&self) -> Duration {
        Duration::from_millis(self.ssh_connect_ms)
    }

    /// SSH channel poll interval
    pub fn ssh_poll(&self) -> Duration {
        Duration::from_millis(self.ssh_poll_ms)
    }

    /// SSH retry delay
    pub fn ssh_retry(&self) -> Duration {
        Duration::from_millis(self.ssh_retry_ms)
    }
}

/// Remote shell settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshSettings {
    /// User created on first boot and used to log in
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Public key authorized for `user` on first boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Private key used to log in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    /// SSH port, 22 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            public_key: None,
            identity_file: None,
            port: None,
        }
    }
}

fn default_initial_machine_id() -> u32 {
    100
}

fn default_max_interfaces() -> usize {
    32
}

fn default_description() -> String {
    "created by testbed".to_string()
}

fn default_bridge_prefix() -> String {
    "vmbr".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_true() -> bool {
    true
}
