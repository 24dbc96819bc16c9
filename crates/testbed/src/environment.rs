//! Everything one build provisioned

use crate::error::Result;
use crate::network::Bridge;
use crate::node::Node;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Provider-level step run once after every member has been closed
pub type TeardownHook = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The nodes and bridges of one build
///
/// Every member was provisioned successfully. Closing the environment
/// releases all of them.
pub struct Environment {
    nodes: Vec<Arc<Node>>,
    bridges: Vec<Arc<Bridge>>,
    teardown: Option<TeardownHook>,
    closed: AtomicBool,
}

impl Environment {
    /// Take ownership of provisioned members
    pub fn new(nodes: Vec<Arc<Node>>, bridges: Vec<Arc<Bridge>>) -> Self {
        Self {
            nodes,
            bridges,
            teardown: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Run `hook` after all members are closed
    pub fn with_teardown_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.teardown = Some(Box::new(move || Box::pin(hook())));
        self
    }

    /// Provisioned nodes, in blueprint order
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Provisioned bridges, in blueprint order
    pub fn bridges(&self) -> &[Arc<Bridge>] {
        &self.bridges
    }

    /// First node named `name`
    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    /// Close every node, then every bridge, then run the teardown hook
    ///
    /// A failing member does not stop the others from being closed; the
    /// first error is returned once everything has been attempted. Calls
    /// after the first return `Ok(())` without doing anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            "Closing environment ({} nodes, {} bridges)",
            self.nodes.len(),
            self.bridges.len()
        );

        let mut first_error = None;
        let mut keep = |result: Result<()>, what: String| {
            if let Err(e) = result {
                warn!("Failed to close {}: {}", what, e);
                first_error.get_or_insert(e);
            }
        };

        for node in &self.nodes {
            keep(
                node.close().await,
                format!("node {} ({})", node.name(), node.id()),
            );
        }
        for bridge in &self.bridges {
            keep(bridge.close().await, format!("bridge {}", bridge.name()));
        }
        if let Some(hook) = &self.teardown {
            keep(hook().await, "environment".to_string());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("nodes", &self.nodes)
            .field("bridges", &self.bridges)
            .field("teardown", &self.teardown.is_some())
            .finish_non_exhaustive()
    }
}
