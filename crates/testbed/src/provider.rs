//! Provider abstraction

use crate::blueprint::Blueprint;
use crate::environment::Environment;
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identity of one provider instance
///
/// Handles created by a provider carry its id so resources from different
/// instances are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(Uuid);

impl ProviderId {
    /// A fresh, unique id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProviderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend able to turn a blueprint into a live environment
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in errors and logs
    fn name(&self) -> &str;

    /// Identity of this instance
    fn id(&self) -> ProviderId;

    /// Provision everything `blueprint` asks for and run its setup stages
    ///
    /// On failure every resource created so far is released before the
    /// error is returned.
    async fn build(&self, blueprint: &Blueprint) -> Result<Arc<Environment>>;
}
