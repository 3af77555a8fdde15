//! Error types for the mount daemon
//!
//! Provides structured error types for host command execution, LVM
//! coordination, mount orchestration and the resource store.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the daemon
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes / Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource version conflict: {name}")]
    Conflict { name: String },

    #[error("Spec validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Host Command Errors
    // =========================================================================
    #[error("Command '{command}' failed: {reason}")]
    CommandFailed {
        command: String,
        output: String,
        reason: String,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout {
        command: String,
        timeout: Duration,
        output: String,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// A host operation failed in a way the user should see; wraps the
    /// underlying command error.
    #[error("{message}: {source}")]
    Storage {
        message: String,
        fatal: bool,
        #[source]
        source: Box<Error>,
    },

    #[error("Could not find VG/LV pair {volume_group}/{logical_volume}")]
    VolumeNotFound {
        volume_group: String,
        logical_volume: String,
    },

    #[error("Unsupported device type: {kind}")]
    UnsupportedDevice { kind: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error, surfaced in resource status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Inventory,
    NotFound,
    Command,
    Unsupported,
    Validation,
    Internal,
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with the configured retry policy
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap a lower-level error with a user-facing message
    pub fn storage(message: impl Into<String>, fatal: bool, source: Error) -> Self {
        Error::Storage {
            message: message.into(),
            fatal,
            source: Box::new(source),
        }
    }

    /// Whether the error means the node cannot reason about its storage at all
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage { fatal: true, .. })
    }

    /// Message suitable for the resource status
    pub fn user_message(&self) -> String {
        match self {
            Error::Storage { message, .. } => message.clone(),
            Error::CommandFailed { command, .. } | Error::CommandTimeout { command, .. } => {
                format!("Command '{}' did not complete", command)
            }
            other => other.to_string(),
        }
    }

    /// Combined output captured from the failing command, if any
    pub fn command_output(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { output, .. } | Error::CommandTimeout { output, .. } => {
                Some(output.as_str())
            }
            Error::Storage { source, .. } => source.command_output(),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage { fatal: true, .. } => ErrorKind::Inventory,
            Error::Storage { source, .. } => source.kind(),
            Error::VolumeNotFound { .. } | Error::ResourceNotFound { .. } => ErrorKind::NotFound,
            Error::CommandFailed { .. } | Error::CommandTimeout { .. } | Error::Io(_) => {
                ErrorKind::Command
            }
            Error::UnsupportedDevice { .. } => ErrorKind::Unsupported,
            Error::Validation(_) | Error::Configuration(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }

    /// Determine what action to take for this error when it escapes the
    /// reconciler (store and API failures)
    pub fn action(&self) -> ErrorAction {
        match self {
            // Optimistic write lost the race, the next delivery sees the new version
            Error::Conflict { .. } => ErrorAction::RequeueAfter(Duration::from_secs(1)),

            // Nothing left to reconcile
            Error::ResourceNotFound { .. } => ErrorAction::NoRequeue,

            // Bad daemon configuration won't fix itself
            Error::Configuration(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }
}

/// Result type alias for the daemon
pub type Result<T> = std::result::Result<T, Error>;
