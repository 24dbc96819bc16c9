//! Provider backed by a hypervisor control plane
//!
//! Machines are cloned from per-distribution images and numbered from the
//! configured initial id. Each machine's management address is the base
//! management address offset by how far its id is past the initial id.
//! Bridges are named by a prefix and the lowest unused numeric suffix.
//!
//! Provisioning is sequential. Anything created before a failure is torn
//! down again before the failure is returned.

use crate::allocate::{lowest_free_id, lowest_free_suffix, management_address};
use crate::blueprint::{Blueprint, BridgeRequest, Template};
use crate::control::{ControlPlane, MachineConfig, Operation};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::network::{Bridge, ConfigurableInterface, Interface, InterfaceSettings, ManagementInterface};
use crate::node::{Node, NodeRuntime};
use crate::provider::{Provider, ProviderId};
use crate::scheduler::{SetupScheduler, setup_jobs};
use crate::task::{TaskPolicy, await_task, run_operation};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use testbed_config::HypervisorConfig;
use testbed_exec::{OpenSshShell, RemoteShell, SshConfig, SshExecutor};
use tracing::{debug, info, warn};

/// Name reported by [`HypervisorProvider`]
pub const PROVIDER_NAME: &str = "hypervisor";

/// Builds environments on a hypervisor
pub struct HypervisorProvider {
    id: ProviderId,
    config: HypervisorConfig,
    runtime: NodeRuntime,
}

/// Members created so far by one build
#[derive(Default)]
struct Provisioned {
    nodes: Vec<Arc<Node>>,
    bridges: Vec<Arc<Bridge>>,
    claimed_ids: BTreeSet<u32>,
    claimed_bridges: BTreeSet<String>,
}

impl HypervisorProvider {
    /// Create a provider from validated settings
    pub fn new(
        control: Arc<dyn ControlPlane>,
        shell: Arc<dyn RemoteShell>,
        config: HypervisorConfig,
    ) -> Result<Self> {
        testbed_config::parser::validate_provider(&config)?;

        let executor = SshExecutor::new(shell)
            .with_poll_interval(config.timeouts.ssh_poll())
            .with_retry_delay(config.timeouts.ssh_retry());
        let runtime = NodeRuntime {
            control,
            executor,
            policy: TaskPolicy::from_timeouts(&config.timeouts),
            ssh_timeout: config.timeouts.ssh_connect(),
        };

        Ok(Self {
            id: ProviderId::new(),
            config,
            runtime,
        })
    }

    /// Create a provider from a configuration file, reaching machines with
    /// the system `ssh` client
    pub fn from_config_file(path: impl AsRef<Path>, control: Arc<dyn ControlPlane>) -> Result<Self> {
        let config = testbed_config::parse_file(path)?.provider;

        let mut ssh = SshConfig::new(config.ssh.user.clone());
        if let Some(port) = config.ssh.port {
            ssh = ssh.with_port(port);
        }
        if let Some(identity) = &config.ssh.identity_file {
            ssh = ssh.with_identity_file(identity.clone());
        }

        Self::new(control, Arc::new(OpenSshShell::new(ssh)), config)
    }

    /// Settings in use
    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    fn control(&self) -> &dyn ControlPlane {
        self.runtime.control.as_ref()
    }

    fn impossible(&self, reason: String) -> Error {
        Error::ImpossibleBlueprint {
            provider: PROVIDER_NAME.to_string(),
            reason,
        }
    }

    /// Reject anything this provider cannot build, without side effects
    fn validate(&self, blueprint: &Blueprint) -> Result<()> {
        for template in blueprint.templates() {
            self.validate_template(template)?;
        }
        if !blueprint.bridges().is_empty() && !self.config.bridges.enabled {
            return Err(self.impossible("bridge creation is disabled".to_string()));
        }
        Ok(())
    }

    fn validate_template(&self, template: &Template) -> Result<()> {
        let name = template.name();
        if !self.config.images.contains_key(template.distribution()) {
            return Err(self.impossible(format!(
                "no image registered for distribution `{}`",
                template.distribution()
            )));
        }
        if template.interfaces() == 0 {
            return Err(self.impossible(format!(
                "template `{name}` needs at least one interface for management"
            )));
        }
        if template.interfaces() > self.config.max_interfaces {
            return Err(self.impossible(format!(
                "template `{name}` requests {} interfaces, at most {} are supported",
                template.interfaces(),
                self.config.max_interfaces
            )));
        }
        if template.cores() == 0 || template.memory_mb() == 0 {
            return Err(self.impossible(format!(
                "template `{name}` needs at least one core and some memory"
            )));
        }
        Ok(())
    }

    /// Provision every node, then every bridge
    async fn provision(&self, blueprint: &Blueprint, provisioned: &mut Provisioned) -> Result<()> {
        for template in blueprint.templates() {
            self.provision_node(template, provisioned).await?;
        }
        for request in blueprint.bridges() {
            self.provision_bridge(request, provisioned).await?;
        }
        Ok(())
    }

    async fn provision_node(&self, template: &Arc<Template>, provisioned: &mut Provisioned) -> Result<()> {
        let image = *self
            .config
            .images
            .get(template.distribution())
            .ok_or_else(|| {
                self.impossible(format!(
                    "no image registered for distribution `{}`",
                    template.distribution()
                ))
            })?;
        let initial_id = self.config.initial_machine_id;

        let mut occupied = self.control().list_machine_ids().await?;
        occupied.extend(&provisioned.claimed_ids);
        let id = lowest_free_id(initial_id, &occupied)?;
        provisioned.claimed_ids.insert(id);

        let network = self.config.management.network;
        let address = management_address(network.addr(), initial_id, id)?;
        if !network.contains(&address) {
            return Err(Error::InvalidArgument(format!(
                "management address {address} for machine {id} is outside {network}"
            )));
        }
        info!(
            "Provisioning {} ({}) as machine {} at {}",
            template.name(),
            template.distribution(),
            id,
            address
        );

        let management = ManagementInterface::new(
            address,
            network.prefix_len(),
            self.config.management.bridge.clone(),
        );
        let mut config = MachineConfig {
            sockets: Some(1),
            cores: Some(template.cores()),
            memory_mb: Some(template.memory_mb()),
            ci_user: Some(self.config.ssh.user.clone()),
            ssh_keys: self.config.ssh.public_key.clone(),
            net: BTreeMap::from([(0, management.net_descriptor())]),
            ipconfig: BTreeMap::from([(0, management.ip_descriptor())]),
        };

        let mut interfaces = Vec::with_capacity(template.interfaces());
        interfaces.push(Interface::Management(management));
        for index in 1..template.interfaces() {
            // Interface 1 is the egress interface, the rest start unattached
            let settings = if index == 1 {
                InterfaceSettings::dhcp(self.config.internet_bridge.clone())
            } else {
                InterfaceSettings::new(None)
            };
            config.net.insert(index, settings.net_descriptor());
            let ip = settings.ip_descriptor();
            if !ip.is_empty() {
                config.ipconfig.insert(index, ip);
            }
            interfaces.push(Interface::Configurable(ConfigurableInterface::new(
                self.id,
                id,
                index,
                self.runtime.control.clone(),
                settings,
            )));
        }

        let node = Arc::new(Node::new(
            template.clone(),
            id,
            address,
            interfaces,
            self.runtime.clone(),
        ));

        let task = self
            .control()
            .submit(Operation::Clone {
                image,
                id,
                name: template.name().to_string(),
                description: self.config.description.clone(),
            })
            .await?;
        // From here on the machine may exist and must be cleaned up
        provisioned.nodes.push(node);

        await_task(self.control(), &task, self.runtime.policy).await?;
        debug!("Configuring machine {}: {:?}", id, config);
        self.control().configure_machine(id, config).await
    }

    async fn provision_bridge(&self, request: &BridgeRequest, provisioned: &mut Provisioned) -> Result<()> {
        let prefix = &self.config.bridges.prefix;

        let mut names = self.control().list_network_names(prefix).await?;
        names.extend(provisioned.claimed_bridges.iter().cloned());
        let name = format!(
            "{prefix}{}",
            lowest_free_suffix(prefix, names.iter().map(String::as_str))?
        );
        provisioned.claimed_bridges.insert(name.clone());

        info!("Creating bridge {}", name);
        let comment = request.comment().unwrap_or(&self.config.bridges.comment);
        self.control().create_bridge(&name, comment).await?;
        provisioned.bridges.push(Arc::new(Bridge::new(
            name,
            self.id,
            self.runtime.control.clone(),
        )));

        run_operation(self.control(), Operation::ApplyNetwork, self.runtime.policy).await
    }

    /// Wrap members in an environment that reloads networking after close
    /// when it owns bridges
    fn environment(&self, nodes: Vec<Arc<Node>>, bridges: Vec<Arc<Bridge>>) -> Environment {
        let has_bridges = !bridges.is_empty();
        let env = Environment::new(nodes, bridges);
        if !has_bridges {
            return env;
        }

        let control = self.runtime.control.clone();
        let policy = self.runtime.policy;
        env.with_teardown_hook(move || {
            let control = control.clone();
            async move { run_operation(control.as_ref(), Operation::ApplyNetwork, policy).await }
        })
    }

    /// Close `env` after a failed build, keeping `cause` as the reported error
    async fn abandon(&self, env: &Environment, cause: Error) -> Error {
        warn!("Build failed, releasing provisioned resources: {}", cause);
        if let Err(e) = env.close().await {
            warn!("Cleanup after failed build was incomplete: {}", e);
        }
        cause
    }
}

#[async_trait]
impl Provider for HypervisorProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn id(&self) -> ProviderId {
        self.id
    }

    async fn build(&self, blueprint: &Blueprint) -> Result<Arc<Environment>> {
        // Dropped on every return path below
        let scheduler = SetupScheduler::new();

        info!(
            "Building blueprint with {} machines and {} bridges",
            blueprint.templates().len(),
            blueprint.bridges().len()
        );
        self.validate(blueprint)?;

        let mut provisioned = Provisioned::default();
        if let Err(e) = self.provision(blueprint, &mut provisioned).await {
            let env = self.environment(provisioned.nodes, provisioned.bridges);
            return Err(self.abandon(&env, e).await);
        }

        let env = Arc::new(self.environment(provisioned.nodes, provisioned.bridges));
        if let Err(e) = scheduler.run(setup_jobs(&env)).await {
            return Err(self.abandon(&env, e).await);
        }

        info!("Environment ready with {} machines", env.nodes().len());
        Ok(env)
    }
}

impl std::fmt::Debug for HypervisorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorProvider")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MemoryControlPlane;
    use testbed_config::ManagementNetwork;
    use testbed_exec::backends::scripted::ScriptedShell;

    fn provider(control: &Arc<MemoryControlPlane>, config: HypervisorConfig) -> HypervisorProvider {
        HypervisorProvider::new(control.clone(), Arc::new(ScriptedShell::new()), config).unwrap()
    }

    fn config() -> HypervisorConfig {
        HypervisorConfig::new(ManagementNetwork::new(
            "vmbr0",
            "10.0.0.10/24".parse().unwrap(),
        ))
        .with_image("debian-12", 9000)
    }

    #[test]
    fn test_validation_messages() {
        let control = Arc::new(MemoryControlPlane::new());
        let mut config = config();
        config.max_interfaces = 4;
        config.bridges.enabled = false;
        let provider = provider(&control, config);

        let cases = [
            (
                Template::new("arch", "a").solo_blueprint(),
                "no image registered for distribution `arch`",
            ),
            (
                Template::new("debian-12", "b").with_interfaces(0).solo_blueprint(),
                "template `b` needs at least one interface for management",
            ),
            (
                Template::new("debian-12", "c").with_interfaces(5).solo_blueprint(),
                "template `c` requests 5 interfaces, at most 4 are supported",
            ),
            (
                Template::new("debian-12", "d").with_cores(0).solo_blueprint(),
                "template `d` needs at least one core and some memory",
            ),
            (
                Blueprint::new().with_bridge(BridgeRequest::new()),
                "bridge creation is disabled",
            ),
        ];

        for (blueprint, reason) in cases {
            match provider.validate(&blueprint) {
                Err(Error::ImpossibleBlueprint { provider, reason: actual }) => {
                    assert_eq!(provider, PROVIDER_NAME);
                    assert_eq!(actual, reason);
                }
                other => panic!("expected rejection for `{reason}`, got {other:?}"),
            }
        }
        assert!(control.calls().is_empty());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let control = Arc::new(MemoryControlPlane::new());
        let mut config = config();
        config.images.clear();

        let result = HypervisorProvider::new(control, Arc::new(ScriptedShell::new()), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbed.yaml");
        std::fs::write(
            &path,
            r#"
version: "1.0"
provider:
  images:
    debian-12: 9000
  management:
    bridge: vmbr0
    network: 10.0.0.10/24
  ssh:
    user: admin
    port: 2222
"#,
        )
        .unwrap();

        let provider =
            HypervisorProvider::from_config_file(&path, Arc::new(MemoryControlPlane::new())).unwrap();
        assert_eq!(provider.name(), PROVIDER_NAME);
        assert_eq!(provider.config().ssh.user, "admin");
        assert_eq!(provider.config().images["debian-12"], 9000);
    }
}
