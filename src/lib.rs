//! Mount Daemon - Node-local ClientMount reconciler
//!
//! Runs on every compute node and drives the node's mounts to match the
//! ClientMount resources addressed to it: Lustre file systems reached through
//! their management servers, and LVM logical volumes, including volume groups
//! shared between nodes through lvmlockd.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │           Controller (kube watch → reconcile passes)         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Reconciler: Deleting → StatusInit → Propagation →           │
//! │              Finalizer → Applying                            │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │  Mount Orchestrator           │  Resource Store              │
//! │  (per-entry mount / unmount)  │  (Kubernetes / in-memory)    │
//! ├───────────────────────────────┴──────────────────────────────┤
//! │  Device Resolver → LVM Coordinator → NVMe Rescanner          │
//! │  Mount Inspector                                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Command Executor (host / recording)                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Reconciler, mount orchestration, stores and retry scheduling
//! - [`host`]: Host command execution, mount table, LVM and NVMe handling
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and traits
//! - [`config`]: Daemon configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod host;

// Re-export commonly used types
pub use config::{DaemonConfig, RetryConfig, DEFAULT_FINALIZER};

pub use controller::{
    run_controller, KubeStore, MemoryStore, MountOrchestrator, Phase, ReconcileAction,
    ReconcileMetrics, Reconciler, RetryPolicy,
};

pub use crd::{
    ClientMount, ClientMountDevice, ClientMountInfo, ClientMountSpec, ClientMountState,
    ClientMountStatus, ResourceError,
};

pub use domain::ports::{
    CommandExecutor, CommandExecutorRef, ResourceKey, ResourceStore, ResourceStoreRef,
};

pub use error::{Error, ErrorAction, Result};

pub use host::{HostExecutor, RecordingExecutor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
