//! Network interfaces and bridges
//!
//! Interface 0 of every node is the management interface: its address is
//! derived from the machine id and nothing about it can change. All other
//! interfaces are configurable, and every setter writes the interface's
//! complete attachment and IP descriptors to the control plane in a single
//! update before returning.

use crate::control::{ControlPlane, MachineConfig};
use crate::error::{Error, Result};
use crate::provider::ProviderId;
use futures::lock::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Netmask applied to a v4 address until one is set explicitly
pub const DEFAULT_NETMASK_V4: u8 = 24;

/// Netmask applied to a v6 address until one is set explicitly
pub const DEFAULT_NETMASK_V6: u8 = 64;

/// A shared network segment created for one environment
pub struct Bridge {
    name: String,
    provider: ProviderId,
    control: Arc<dyn ControlPlane>,
    closed: AtomicBool,
}

impl Bridge {
    pub(crate) fn new(name: String, provider: ProviderId, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            name,
            provider,
            control,
            closed: AtomicBool::new(false),
        }
    }

    /// Bridge name on the host
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider instance that created the bridge
    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// Delete the bridge
    ///
    /// Only the first call reaches the control plane. Host networking still
    /// has to be reloaded for the deletion to take effect, which the owning
    /// environment does once after all members are closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Deleting bridge {}", self.name);
        self.control.delete_bridge(&self.name).await
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Network attachment point of a node
#[derive(Debug)]
pub enum Interface {
    /// Management interface; every mutator fails
    Management(ManagementInterface),
    /// Interface whose settings write through to the control plane
    Configurable(ConfigurableInterface),
}

impl Interface {
    /// Position of the interface on its node
    pub fn index(&self) -> usize {
        match self {
            Interface::Management(_) => 0,
            Interface::Configurable(iface) => iface.index,
        }
    }

    /// The mutable handle, if this interface is configurable
    pub fn configurable(&self) -> Option<&ConfigurableInterface> {
        match self {
            Interface::Management(_) => None,
            Interface::Configurable(iface) => Some(iface),
        }
    }

    /// Name of the bridge the interface is attached to
    pub async fn bridge(&self) -> Option<String> {
        match self {
            Interface::Management(iface) => Some(iface.bridge.clone()),
            Interface::Configurable(iface) => iface.settings().await.bridge,
        }
    }

    /// Statically assigned IPv4 address
    pub async fn address_v4(&self) -> Option<Ipv4Addr> {
        match self {
            Interface::Management(iface) => match iface.address {
                IpAddr::V4(address) => Some(address),
                IpAddr::V6(_) => None,
            },
            Interface::Configurable(iface) => iface.settings().await.address_v4,
        }
    }

    /// Statically assigned IPv6 address
    pub async fn address_v6(&self) -> Option<Ipv6Addr> {
        match self {
            Interface::Management(iface) => match iface.address {
                IpAddr::V4(_) => None,
                IpAddr::V6(address) => Some(address),
            },
            Interface::Configurable(iface) => iface.settings().await.address_v6,
        }
    }

    /// Limit throughput, in MB/s; `None` removes the limit
    pub async fn set_rate(&self, rate: Option<u32>) -> Result<()> {
        match self {
            Interface::Management(iface) => Err(iface.immutable("rate")),
            Interface::Configurable(iface) => iface.set_rate(rate).await,
        }
    }

    /// Bring the link up or down
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        match self {
            Interface::Management(iface) => Err(iface.immutable("link state")),
            Interface::Configurable(iface) => iface.set_enabled(enabled).await,
        }
    }

    /// Attach the interface to `bridge`
    pub async fn set_bridge(&self, bridge: &Bridge) -> Result<()> {
        match self {
            Interface::Management(iface) => Err(iface.immutable("bridge")),
            Interface::Configurable(iface) => iface.set_bridge(bridge).await,
        }
    }

    /// Assign a static IPv4 address
    pub async fn set_address_v4(&self, address: Ipv4Addr) -> Result<()> {
        match self {
            Interface::Management(iface) => Err(iface.immutable("IPv4 address")),
            Interface::Configurable(iface) => iface.set_address_v4(address).await,
        }
    }

    /// Set the IPv4 prefix length
    pub async fn set_netmask_v4(&self, netmask: u8) -> Result<()> {
        match self {
            Interface::Management(iface) => Err(iface.immutable("IPv4 netmask")),
            Interface::Configurable(iface) => iface.set_netmask_v4(netmask).await,
        }
    }

    /// Assign a static IPv6 address
    pub async fn set_address_v6(&self, address: Ipv6Addr) -> Result<()> {
        match self {
            Interface::Management(iface) => Err(iface.immutable("IPv6 address")),
            Interface::Configurable(iface) => iface.set_address_v6(address).await,
        }
    }

    /// Set the IPv6 prefix length
    pub async fn set_netmask_v6(&self, netmask: u8) -> Result<()> {
        match self {
            Interface::Management(iface) => Err(iface.immutable("IPv6 netmask")),
            Interface::Configurable(iface) => iface.set_netmask_v6(netmask).await,
        }
    }
}

/// The management interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementInterface {
    address: IpAddr,
    prefix_len: u8,
    bridge: String,
}

impl ManagementInterface {
    pub(crate) fn new(address: IpAddr, prefix_len: u8, bridge: String) -> Self {
        Self {
            address,
            prefix_len,
            bridge,
        }
    }

    /// Management address
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length of the management network
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Attachment descriptor written at provisioning time
    pub fn net_descriptor(&self) -> String {
        format!("model=virtio,bridge={}", self.bridge)
    }

    /// IP descriptor written at provisioning time
    pub fn ip_descriptor(&self) -> String {
        match self.address {
            IpAddr::V4(address) => format!("ip={}/{}", address, self.prefix_len),
            IpAddr::V6(address) => format!("ip6={}/{}", address, self.prefix_len),
        }
    }

    fn immutable(&self, what: &str) -> Error {
        Error::unsupported(format!("cannot change {what} of the management interface"))
    }
}

/// Everything that determines a configurable interface's descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    /// Attached bridge, by name
    pub bridge: Option<String>,
    /// Link state
    pub enabled: bool,
    /// Throughput limit in MB/s
    pub rate: Option<u32>,
    /// Static IPv4 address
    pub address_v4: Option<Ipv4Addr>,
    /// IPv4 prefix length
    pub netmask_v4: u8,
    /// Static IPv6 address
    pub address_v6: Option<Ipv6Addr>,
    /// IPv6 prefix length
    pub netmask_v6: u8,
    /// Request an IPv4 lease while no static address is set
    pub dhcp: bool,
}

impl InterfaceSettings {
    /// An enabled, unaddressed interface
    pub fn new(bridge: Option<String>) -> Self {
        Self {
            bridge,
            enabled: true,
            rate: None,
            address_v4: None,
            netmask_v4: DEFAULT_NETMASK_V4,
            address_v6: None,
            netmask_v6: DEFAULT_NETMASK_V6,
            dhcp: false,
        }
    }

    /// An enabled interface configured through DHCP
    pub fn dhcp(bridge: Option<String>) -> Self {
        Self {
            dhcp: true,
            ..Self::new(bridge)
        }
    }

    /// Attachment descriptor: `model=virtio[,bridge=X][,link_down=1][,rate=N]`
    pub fn net_descriptor(&self) -> String {
        let mut descriptor = String::from("model=virtio");
        if let Some(bridge) = &self.bridge {
            descriptor.push_str(",bridge=");
            descriptor.push_str(bridge);
        }
        if !self.enabled {
            descriptor.push_str(",link_down=1");
        }
        if let Some(rate) = self.rate {
            descriptor.push_str(&format!(",rate={rate}"));
        }
        descriptor
    }

    /// IP descriptor: `ip=A/N` or `ip=dhcp`, then `ip6=A/N`, comma-joined
    pub fn ip_descriptor(&self) -> String {
        let mut parts = Vec::with_capacity(2);
        match self.address_v4 {
            Some(address) => parts.push(format!("ip={}/{}", address, self.netmask_v4)),
            None if self.dhcp => parts.push("ip=dhcp".to_string()),
            None => {}
        }
        if let Some(address) = self.address_v6 {
            parts.push(format!("ip6={}/{}", address, self.netmask_v6));
        }
        parts.join(",")
    }
}

/// A mutable interface
pub struct ConfigurableInterface {
    provider: ProviderId,
    machine: u32,
    index: usize,
    control: Arc<dyn ControlPlane>,
    settings: Mutex<InterfaceSettings>,
}

impl ConfigurableInterface {
    pub(crate) fn new(
        provider: ProviderId,
        machine: u32,
        index: usize,
        control: Arc<dyn ControlPlane>,
        settings: InterfaceSettings,
    ) -> Self {
        Self {
            provider,
            machine,
            index,
            control,
            settings: Mutex::new(settings),
        }
    }

    /// Position of the interface on its node
    pub fn index(&self) -> usize {
        self.index
    }

    /// Snapshot of the current settings
    pub async fn settings(&self) -> InterfaceSettings {
        self.settings.lock().await.clone()
    }

    /// Limit throughput, in MB/s; `None` removes the limit
    pub async fn set_rate(&self, rate: Option<u32>) -> Result<()> {
        self.update(|s| s.rate = rate).await
    }

    /// Bring the link up or down
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.update(|s| s.enabled = enabled).await
    }

    /// Attach the interface to `bridge`, which must come from the same
    /// provider instance
    pub async fn set_bridge(&self, bridge: &Bridge) -> Result<()> {
        if bridge.provider() != self.provider {
            return Err(Error::unsupported(format!(
                "bridge {} belongs to provider {}, not {}",
                bridge.name(),
                bridge.provider(),
                self.provider
            )));
        }
        let name = bridge.name().to_string();
        self.update(|s| s.bridge = Some(name)).await
    }

    /// Assign a static IPv4 address, replacing any DHCP configuration
    pub async fn set_address_v4(&self, address: Ipv4Addr) -> Result<()> {
        self.update(|s| {
            s.address_v4 = Some(address);
            s.dhcp = false;
        })
        .await
    }

    /// Set the IPv4 prefix length (0-32)
    pub async fn set_netmask_v4(&self, netmask: u8) -> Result<()> {
        if netmask > 32 {
            return Err(Error::InvalidArgument(format!(
                "IPv4 netmask /{netmask} is out of range"
            )));
        }
        self.update(|s| s.netmask_v4 = netmask).await
    }

    /// Assign a static IPv6 address
    pub async fn set_address_v6(&self, address: Ipv6Addr) -> Result<()> {
        self.update(|s| s.address_v6 = Some(address)).await
    }

    /// Set the IPv6 prefix length (0-128)
    pub async fn set_netmask_v6(&self, netmask: u8) -> Result<()> {
        if netmask > 128 {
            return Err(Error::InvalidArgument(format!(
                "IPv6 netmask /{netmask} is out of range"
            )));
        }
        self.update(|s| s.netmask_v6 = netmask).await
    }

    /// Apply `change` and write both descriptors in one update
    ///
    /// The lock is held across the control-plane call so concurrent setters
    /// on the same interface are applied in order. Local settings only change
    /// once the control plane accepted them.
    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut InterfaceSettings),
    {
        let mut settings = self.settings.lock().await;
        let mut next = settings.clone();
        change(&mut next);

        let config = MachineConfig {
            net: BTreeMap::from([(self.index, next.net_descriptor())]),
            ipconfig: BTreeMap::from([(self.index, next.ip_descriptor())]),
            ..Default::default()
        };
        debug!(
            "Reconfiguring interface {} of machine {}: {:?}",
            self.index, self.machine, config
        );
        self.control.configure_machine(self.machine, config).await?;

        *settings = next;
        Ok(())
    }
}

impl fmt::Debug for ConfigurableInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurableInterface")
            .field("provider", &self.provider)
            .field("machine", &self.machine)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Call, MemoryControlPlane};

    fn configurable(
        control: &Arc<MemoryControlPlane>,
        provider: ProviderId,
        settings: InterfaceSettings,
    ) -> Interface {
        Interface::Configurable(ConfigurableInterface::new(
            provider,
            9000,
            1,
            control.clone(),
            settings,
        ))
    }

    fn configure_calls(control: &MemoryControlPlane) -> Vec<MachineConfig> {
        control
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Configure(_, config) => Some(config),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_net_descriptor() {
        let mut settings = InterfaceSettings::new(None);
        assert_eq!(settings.net_descriptor(), "model=virtio");

        settings.bridge = Some("vmbr3".to_string());
        settings.enabled = false;
        settings.rate = Some(10);
        assert_eq!(
            settings.net_descriptor(),
            "model=virtio,bridge=vmbr3,link_down=1,rate=10"
        );
    }

    #[test]
    fn test_ip_descriptor() {
        let mut settings = InterfaceSettings::dhcp(None);
        assert_eq!(settings.ip_descriptor(), "ip=dhcp");

        settings.address_v6 = Some("fd00::5".parse().unwrap());
        assert_eq!(settings.ip_descriptor(), "ip=dhcp,ip6=fd00::5/64");

        settings.address_v4 = Some(Ipv4Addr::new(192, 168, 1, 5));
        settings.netmask_v4 = 16;
        assert_eq!(
            settings.ip_descriptor(),
            "ip=192.168.1.5/16,ip6=fd00::5/64"
        );

        assert_eq!(InterfaceSettings::new(None).ip_descriptor(), "");
    }

    #[test]
    fn test_management_descriptors() {
        let iface = ManagementInterface::new("10.0.0.13".parse().unwrap(), 24, "vmbr0".into());
        assert_eq!(iface.net_descriptor(), "model=virtio,bridge=vmbr0");
        assert_eq!(iface.ip_descriptor(), "ip=10.0.0.13/24");

        let iface = ManagementInterface::new("fd00::d".parse().unwrap(), 64, "vmbr0".into());
        assert_eq!(iface.ip_descriptor(), "ip6=fd00::d/64");
    }

    #[smol_potat::test]
    async fn test_every_management_mutator_fails() {
        let control = Arc::new(MemoryControlPlane::new());
        let bridge = Bridge::new("vmbr1".into(), ProviderId::new(), control.clone());
        let iface = Interface::Management(ManagementInterface::new(
            "10.0.0.13".parse().unwrap(),
            24,
            "vmbr0".into(),
        ));

        let results = vec![
            iface.set_rate(Some(5)).await,
            iface.set_rate(None).await,
            iface.set_enabled(true).await,
            iface.set_enabled(false).await,
            iface.set_bridge(&bridge).await,
            iface.set_address_v4(Ipv4Addr::new(10, 0, 0, 1)).await,
            iface.set_netmask_v4(24).await,
            iface.set_netmask_v4(200).await,
            iface.set_address_v6("fd00::1".parse().unwrap()).await,
            iface.set_netmask_v6(64).await,
        ];
        for result in results {
            assert!(matches!(result, Err(Error::UnsupportedMutation(_))));
        }

        assert!(control.calls().is_empty());
        assert!(iface.configurable().is_none());
        assert_eq!(
            iface.address_v4().await,
            Some(Ipv4Addr::new(10, 0, 0, 13))
        );
        assert_eq!(iface.address_v6().await, None);
    }

    #[smol_potat::test]
    async fn test_each_setter_issues_one_full_update() {
        let control = Arc::new(MemoryControlPlane::new().with_machine(9000));
        let provider = ProviderId::new();
        let iface = configurable(&control, provider, InterfaceSettings::dhcp(Some("vmbr9".into())));

        iface.set_rate(Some(100)).await.unwrap();
        iface.set_address_v4(Ipv4Addr::new(172, 16, 0, 2)).await.unwrap();
        iface.set_netmask_v4(12).await.unwrap();
        iface.set_enabled(false).await.unwrap();

        let updates = configure_calls(&control);
        assert_eq!(updates.len(), 4);
        assert_eq!(updates[0].net[&1], "model=virtio,bridge=vmbr9,rate=100");
        assert_eq!(updates[0].ipconfig[&1], "ip=dhcp");
        assert_eq!(updates[1].ipconfig[&1], "ip=172.16.0.2/24");
        assert_eq!(updates[2].ipconfig[&1], "ip=172.16.0.2/12");
        assert_eq!(
            updates[3].net[&1],
            "model=virtio,bridge=vmbr9,link_down=1,rate=100"
        );
        assert_eq!(updates[3].ipconfig[&1], "ip=172.16.0.2/12");

        assert_eq!(iface.address_v4().await, Some(Ipv4Addr::new(172, 16, 0, 2)));
        assert_eq!(iface.bridge().await.as_deref(), Some("vmbr9"));
    }

    #[smol_potat::test]
    async fn test_bridge_from_other_provider_rejected() {
        let control = Arc::new(MemoryControlPlane::new().with_machine(9000));
        let provider = ProviderId::new();
        let iface = configurable(&control, provider, InterfaceSettings::new(None));

        let foreign = Bridge::new("vmbr4".into(), ProviderId::new(), control.clone());
        assert!(matches!(
            iface.set_bridge(&foreign).await,
            Err(Error::UnsupportedMutation(_))
        ));
        assert!(configure_calls(&control).is_empty());

        let own = Bridge::new("vmbr5".into(), provider, control.clone());
        iface.set_bridge(&own).await.unwrap();
        assert_eq!(
            configure_calls(&control)[0].net[&1],
            "model=virtio,bridge=vmbr5"
        );
    }

    #[smol_potat::test]
    async fn test_netmask_out_of_range() {
        let control = Arc::new(MemoryControlPlane::new().with_machine(9000));
        let iface = configurable(&control, ProviderId::new(), InterfaceSettings::new(None));

        assert!(matches!(
            iface.set_netmask_v4(33).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            iface.set_netmask_v6(129).await,
            Err(Error::InvalidArgument(_))
        ));
        iface.set_netmask_v6(128).await.unwrap();
        assert_eq!(configure_calls(&control).len(), 1);
    }

    #[smol_potat::test]
    async fn test_rejected_update_keeps_settings() {
        let control = Arc::new(MemoryControlPlane::new());
        let iface = ConfigurableInterface::new(
            ProviderId::new(),
            404,
            2,
            control.clone(),
            InterfaceSettings::new(None),
        );

        // Machine 404 does not exist, so the control plane refuses the update
        assert!(iface.set_rate(Some(1)).await.is_err());
        assert_eq!(iface.settings().await.rate, None);
    }

    #[smol_potat::test]
    async fn test_bridge_close_is_idempotent() {
        let control = Arc::new(MemoryControlPlane::new().with_network("vmbr1"));
        let bridge = Bridge::new("vmbr1".into(), ProviderId::new(), control.clone());

        bridge.close().await.unwrap();
        bridge.close().await.unwrap();

        let deletes = control
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::DeleteBridge(_)))
            .count();
        assert_eq!(deletes, 1);
    }
}
