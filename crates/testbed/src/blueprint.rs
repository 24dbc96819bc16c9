//! Declarative topology requests
//!
//! A [`Blueprint`] lists the machines ([`Template`]s) and bridges a test
//! needs. Providers turn it into a live [`Environment`](crate::Environment).

use crate::environment::Environment;
use crate::error::Result;
use crate::node::Node;
use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Order given to stages that do not ask for one
///
/// Mid-range, so explicit orders can land on either side of it.
pub const DEFAULT_ORDER: i32 = i32::MAX / 2;

/// Post-provision setup function
pub type SetupFn = Arc<dyn Fn(Arc<Environment>, Arc<Node>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A unit of post-provision setup with its order
///
/// Stages compare by order only.
#[derive(Clone)]
pub struct SetupStage {
    function: SetupFn,
    order: i32,
}

impl SetupStage {
    /// A stage with the default order
    pub fn new<F, Fut>(function: F) -> Self
    where
        F: Fn(Arc<Environment>, Arc<Node>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::ordered(function, DEFAULT_ORDER)
    }

    /// A stage running in wave `order`
    pub fn ordered<F, Fut>(function: F, order: i32) -> Self
    where
        F: Fn(Arc<Environment>, Arc<Node>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            function: Arc::new(move |env, node| Box::pin(function(env, node))),
            order,
        }
    }

    /// The stage's order
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Start the setup function for `node`
    pub fn invoke(&self, env: Arc<Environment>, node: Arc<Node>) -> BoxFuture<'static, Result<()>> {
        (self.function)(env, node)
    }
}

impl fmt::Debug for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupStage")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl PartialEq for SetupStage {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl Eq for SetupStage {}

impl PartialOrd for SetupStage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SetupStage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.cmp(&other.order)
    }
}

/// A machine to provision
#[derive(Debug, Clone)]
pub struct Template {
    distribution: String,
    name: String,
    cores: u32,
    memory_mb: u32,
    interfaces: usize,
    setup: Vec<SetupStage>,
}

impl Template {
    /// A single-core, 1 GiB machine with one (management) interface
    pub fn new(distribution: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
            name: name.into(),
            cores: 1,
            memory_mb: 1024,
            interfaces: 1,
            setup: Vec::new(),
        }
    }

    /// Set the core count
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    /// Set the memory size in MiB
    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Set the number of interfaces, including the management interface
    pub fn with_interfaces(mut self, interfaces: usize) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Add a setup stage
    pub fn with_setup(mut self, stage: SetupStage) -> Self {
        self.setup.push(stage);
        self
    }

    /// Distribution identifier
    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Core count
    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// Memory size in MiB
    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    /// Requested interface count
    pub fn interfaces(&self) -> usize {
        self.interfaces
    }

    /// Setup stages
    pub fn setup(&self) -> &[SetupStage] {
        &self.setup
    }

    /// A blueprint containing only this template
    pub fn solo_blueprint(self) -> Blueprint {
        Blueprint::new().with_template(self)
    }
}

/// A requested bridge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeRequest {
    comment: Option<String>,
}

impl BridgeRequest {
    /// A bridge with the provider's default comment
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a comment to the bridge
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The requested comment, if any
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

/// Requested topology
#[derive(Debug, Clone, Default)]
pub struct Blueprint {
    templates: Vec<Arc<Template>>,
    bridges: Vec<BridgeRequest>,
}

impl Blueprint {
    /// An empty blueprint
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a machine
    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.push(Arc::new(template));
        self
    }

    /// Add a bridge
    pub fn with_bridge(mut self, bridge: BridgeRequest) -> Self {
        self.bridges.push(bridge);
        self
    }

    /// Requested machines, in insertion order
    pub fn templates(&self) -> &[Arc<Template>] {
        &self.templates
    }

    /// Requested bridges, in insertion order
    pub fn bridges(&self) -> &[BridgeRequest] {
        &self.bridges
    }
}
