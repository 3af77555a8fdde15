//! Domain Ports - Core trait definitions for the mount daemon
//!
//! These traits define the boundaries between the reconciliation logic and
//! the outside world: the host the mounts live on, and the store holding
//! ClientMount resources. Adapters implement these traits to provide
//! concrete functionality.

use crate::crd::ClientMount;
use crate::error::Result;
use async_trait::async_trait;
use kube::ResourceExt;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Resource Identity
// =============================================================================

/// Identity of a ClientMount resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource(resource: &ClientMount) -> Self {
        Self::new(resource.namespace().unwrap_or_default(), resource.name_any())
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Command Executor Port
// =============================================================================

/// The single chokepoint through which the daemon touches the host.
///
/// Every command and filesystem change goes through here so the whole
/// daemon can be run against a recording executor.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a shell command, returning its combined output
    async fn run(&self, command: &str) -> Result<String>;

    /// Create a directory and all of its parents
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Create (or truncate) an empty file
    async fn create_file(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory or a file
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Change ownership of a path
    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;

    /// Paths matching a glob pattern
    async fn list_paths(&self, pattern: &str) -> Result<Vec<String>>;

    /// Whether storage state is simulated rather than real, in which case
    /// inventory output cannot be trusted to describe the node
    fn simulated(&self) -> bool {
        false
    }
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for reading and writing ClientMount resources
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a resource; `None` once it has been removed
    async fn get(&self, key: &ResourceKey) -> Result<Option<ClientMount>>;

    /// Persist the resource's status
    async fn update_status(&self, resource: &ClientMount) -> Result<()>;

    /// Register a finalizer token on the resource
    async fn add_finalizer(&self, resource: &ClientMount, finalizer: &str) -> Result<()>;

    /// Remove a finalizer token. A resource with a pending deletion and no
    /// finalizers left is removed by the store.
    async fn remove_finalizer(&self, resource: &ClientMount, finalizer: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CommandExecutorRef = Arc<dyn CommandExecutor>;
pub type ResourceStoreRef = Arc<dyn ResourceStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClientMountSpec, ClientMountState};

    #[test]
    fn test_resource_key_from_resource() {
        let mut resource = ClientMount::new(
            "job-1",
            ClientMountSpec {
                node: "compute-0".into(),
                desired_state: ClientMountState::Mounted,
                mounts: vec![],
            },
        );
        resource.metadata.namespace = Some("compute-0".into());

        let key = ResourceKey::from_resource(&resource);
        assert_eq!(key, ResourceKey::new("compute-0", "job-1"));
        assert_eq!(key.to_string(), "compute-0/job-1");
    }
}
