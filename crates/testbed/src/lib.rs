//! # Testbed
//!
//! Turns a declarative [`Blueprint`] (machine templates plus requested
//! bridges) into a live [`Environment`] of provisioned virtual machines.
//!
//! A [`Provider`] validates the blueprint, allocates machine ids, addresses
//! and bridge names, provisions everything through its control plane and
//! then runs each template's [`SetupStage`]s in ordered waves. If anything
//! fails after the first resource exists, the partial environment is torn
//! down before the error is returned.
//!
//! ```no_run
//! use std::sync::Arc;
//! use testbed::{HypervisorProvider, MemoryControlPlane, Provider, SetupStage, Template};
//!
//! # async fn run() -> testbed::Result<()> {
//! let provider = HypervisorProvider::from_config_file(
//!     "testbed.yaml",
//!     Arc::new(MemoryControlPlane::new()),
//! )?;
//!
//! let web = Template::new("debian-12", "web")
//!     .with_interfaces(2)
//!     .with_setup(SetupStage::new(|_env, node| async move {
//!         node.start().await?;
//!         node.must_ssh("systemctl start nginx").await?;
//!         Ok(())
//!     }));
//!
//! let env = provider.build(&web.solo_blueprint()).await?;
//! env.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod allocate;
pub mod blueprint;
pub mod control;
pub mod environment;
pub mod error;
pub mod hypervisor;
pub mod network;
pub mod node;
pub mod provider;
pub mod scheduler;
pub mod task;

pub use blueprint::{Blueprint, BridgeRequest, DEFAULT_ORDER, SetupStage, Template};
pub use control::{ControlPlane, MemoryControlPlane, Operation, PowerState, TaskHandle, TaskStatus};
pub use environment::Environment;
pub use error::{Error, Result};
pub use hypervisor::HypervisorProvider;
pub use network::{Bridge, ConfigurableInterface, Interface, ManagementInterface};
pub use node::Node;
pub use provider::{Provider, ProviderId};
pub use scheduler::SetupScheduler;
pub use testbed_exec::SshOutput;
