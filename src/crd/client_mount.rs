//! ClientMount CRD
//!
//! Describes the set of file systems a compute node should have mounted
//! (or unmounted), and records per-mount readiness as observed by the
//! node's mount daemon.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

// =============================================================================
// ClientMount CRD
// =============================================================================

/// ClientMount is the desired mount state of a group of file systems on a
/// single node.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "ClientMount",
    plural = "clientmounts",
    shortname = "cm",
    status = "ClientMountStatus",
    namespaced,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.node"}"#,
    printcolumn = r#"{"name": "Desired", "type": "string", "jsonPath": ".spec.desiredState"}"#,
    printcolumn = r#"{"name": "Error", "type": "string", "jsonPath": ".status.error.userMessage"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClientMountSpec {
    /// Name of the node the mounts belong to
    #[serde(default)]
    pub node: String,

    /// Whether the file systems should be mounted or unmounted
    pub desired_state: ClientMountState,

    /// File systems to manage
    #[serde(default)]
    pub mounts: Vec<ClientMountInfo>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Mount state, used both as the desired state and the recorded state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClientMountState {
    Mounted,
    Unmounted,
}

impl std::fmt::Display for ClientMountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientMountState::Mounted => write!(f, "mounted"),
            ClientMountState::Unmounted => write!(f, "unmounted"),
        }
    }
}

/// What kind of object is created at the mount path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MountTargetType {
    Directory,
    File,
}

/// A single mount point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientMountInfo {
    /// Absolute path of the mount point
    pub mount_path: String,

    /// Directory or file mount target
    pub target_type: MountTargetType,

    /// File system type passed to `mount -t` (lustre, gfs2, xfs, ...)
    pub filesystem_type: String,

    /// Mount options, passed with `-o` when non-empty
    #[serde(default)]
    pub options: String,

    /// Backing device
    pub device: ClientMountDevice,

    /// Apply `user_id`/`group_id` ownership to the mount path after mounting
    #[serde(default)]
    pub set_permissions: bool,

    #[serde(default)]
    pub user_id: u32,

    #[serde(default)]
    pub group_id: u32,
}

impl ClientMountInfo {
    /// Stable key identifying this entry's status
    pub fn key(&self) -> &str {
        &self.mount_path
    }
}

/// Backing device of a mount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMountDevice {
    Lustre(ClientMountDeviceLustre),
    Lvm(ClientMountDeviceLvm),
    /// Any device type this daemon does not know how to mount
    #[serde(other)]
    Unsupported,
}

impl ClientMountDevice {
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMountDevice::Lustre(_) => "lustre",
            ClientMountDevice::Lvm(_) => "lvm",
            ClientMountDevice::Unsupported => "unsupported",
        }
    }
}

/// Lustre file system reachable through its management servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientMountDeviceLustre {
    /// MGS NIDs, e.g. `10.0.0.1@tcp`
    pub mgs_addresses: String,
    pub file_system_name: String,
}

/// Logical volume on node-attached storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientMountDeviceLvm {
    pub volume_group: String,
    pub logical_volume: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the ClientMount
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientMountStatus {
    /// First error of the last reconciliation attempt. Serialized as null
    /// when clear so a merge patch removes a stale error.
    #[serde(default)]
    pub error: Option<ResourceError>,

    /// Per-mount status, in spec order
    #[serde(default)]
    pub mounts: Vec<ClientMountInfoStatus>,
}

/// Status of a single mount
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientMountInfoStatus {
    /// Key of the spec entry this status belongs to (its mount path)
    pub key: String,

    /// Desired state this entry was last driven towards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClientMountState>,

    /// Whether the entry reached `state`
    #[serde(default)]
    pub ready: bool,
}

/// Error kind recorded in status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ResourceErrorKind {
    Inventory,
    NotFound,
    Command,
    Unsupported,
    Validation,
    Internal,
}

impl From<ErrorKind> for ResourceErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Inventory => ResourceErrorKind::Inventory,
            ErrorKind::NotFound => ResourceErrorKind::NotFound,
            ErrorKind::Command => ResourceErrorKind::Command,
            ErrorKind::Unsupported => ResourceErrorKind::Unsupported,
            ErrorKind::Validation => ResourceErrorKind::Validation,
            ErrorKind::Internal => ResourceErrorKind::Internal,
        }
    }
}

/// Error recorded in a resource status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceError {
    pub kind: ResourceErrorKind,

    /// Message meant for the owner of the resource
    pub user_message: String,

    /// Full error chain and captured command output
    #[serde(default)]
    pub debug_message: String,

    /// Fatal errors are reported with higher severity; they are retried all the same
    #[serde(default)]
    pub fatal: bool,
}

impl ResourceError {
    /// Build a status error from a daemon error, prefixed with what was being attempted
    pub fn from_error(context: &str, err: &Error) -> Self {
        let mut debug_message = err.to_string();
        if let Some(output) = err.command_output().filter(|o| !o.trim().is_empty()) {
            debug_message.push_str(": ");
            debug_message.push_str(output.trim());
        }

        Self {
            kind: err.kind().into(),
            user_message: format!("{}: {}", context, err.user_message()),
            debug_message,
            fatal: err.is_fatal(),
        }
    }
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = if self.fatal { "fatal" } else { "error" };
        write!(f, "{} ({}): {}", self.user_message, severity, self.debug_message)
    }
}

// =============================================================================
// Helpers
// =============================================================================

impl ClientMountSpec {
    /// Check the spec is something the daemon can act on
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for info in &self.mounts {
            if !Path::new(&info.mount_path).is_absolute() {
                return Err(Error::Validation(format!(
                    "mount path '{}' is not absolute",
                    info.mount_path
                )));
            }
            if !seen.insert(info.mount_path.as_str()) {
                return Err(Error::Validation(format!(
                    "mount path '{}' listed more than once",
                    info.mount_path
                )));
            }
            if info.filesystem_type.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "mount path '{}' has no file system type",
                    info.mount_path
                )));
            }
        }
        Ok(())
    }
}

impl ClientMountStatus {
    /// Whether status has exactly one entry per spec mount, in spec order
    pub fn matches_shape(&self, spec: &ClientMountSpec) -> bool {
        self.mounts.len() == spec.mounts.len()
            && self
                .mounts
                .iter()
                .zip(&spec.mounts)
                .all(|(status, info)| status.key == info.key())
    }

    /// Rebuild status entries in spec order, keeping recorded state for
    /// entries whose key is still present
    pub fn reshape(&mut self, spec: &ClientMountSpec) {
        let mut previous: BTreeMap<String, ClientMountInfoStatus> = self
            .mounts
            .drain(..)
            .map(|status| (status.key.clone(), status))
            .collect();

        self.mounts = spec
            .mounts
            .iter()
            .map(|info| {
                previous.remove(info.key()).unwrap_or_else(|| ClientMountInfoStatus {
                    key: info.key().to_string(),
                    state: None,
                    ready: false,
                })
            })
            .collect();
    }

    /// Whether any entry was last driven towards a state other than `desired`
    pub fn needs_propagation(&self, desired: ClientMountState) -> bool {
        self.mounts.iter().any(|m| m.state != Some(desired))
    }

    /// Record a new desired state on every entry and mark them not ready
    pub fn propagate(&mut self, desired: ClientMountState) {
        for mount in &mut self.mounts {
            mount.state = Some(desired);
            mount.ready = false;
        }
    }

    /// Record the outcome of one entry
    pub fn set_ready(&mut self, key: &str, ready: bool) {
        if let Some(mount) = self.mounts.iter_mut().find(|m| m.key == key) {
            mount.ready = ready;
        }
    }
}
