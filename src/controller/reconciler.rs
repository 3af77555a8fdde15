//! ClientMount Reconciler
//!
//! Drives one ClientMount at a time towards its desired state. Every pass
//! takes exactly one step of the state machine:
//!
//! ```text
//! Deleting ─────────────────────► unmount all, release finalizer
//! AwaitingStatusInit ───────────► reshape status to the spec, requeue
//! AwaitingDesiredPropagation ───► record desired state on every entry, requeue
//! AwaitingFinalizer ────────────► register finalizer, requeue
//! Applying ─────────────────────► mount or unmount every entry
//! ```
//!
//! Phases are evaluated in that order, so no entry is touched before the
//! status matches the spec, the desired state is recorded on all entries,
//! and cleanup on deletion is guaranteed by the finalizer.

use crate::config::DaemonConfig;
use crate::controller::metrics::ReconcileMetrics;
use crate::controller::orchestrator::MountOrchestrator;
use crate::controller::retry::RetryTracker;
use crate::crd::{ClientMount, ClientMountInfo, ClientMountState, ClientMountStatus, ResourceError};
use crate::domain::ports::{ResourceKey, ResourceStoreRef};
use crate::error::Result;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Phases
// =============================================================================

/// Step of the state machine a resource is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Deleting,
    AwaitingStatusInit,
    AwaitingDesiredPropagation,
    AwaitingFinalizer,
    Applying,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Deleting => "Deleting",
            Phase::AwaitingStatusInit => "AwaitingStatusInit",
            Phase::AwaitingDesiredPropagation => "AwaitingDesiredPropagation",
            Phase::AwaitingFinalizer => "AwaitingFinalizer",
            Phase::Applying => "Applying",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of `resource`, given the finalizer token the daemon owns
pub fn phase(resource: &ClientMount, finalizer: &str) -> Phase {
    if resource.metadata.deletion_timestamp.is_some() {
        return Phase::Deleting;
    }

    let Some(status) = resource
        .status
        .as_ref()
        .filter(|status| status.matches_shape(&resource.spec))
    else {
        return Phase::AwaitingStatusInit;
    };

    if status.needs_propagation(resource.spec.desired_state) {
        Phase::AwaitingDesiredPropagation
    } else if !has_finalizer(resource, finalizer) {
        Phase::AwaitingFinalizer
    } else {
        Phase::Applying
    }
}

fn has_finalizer(resource: &ClientMount, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

/// What the caller should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Run the next pass right away
    Requeue,
    /// Retry after a delay
    RequeueAfter(Duration),
    /// Nothing to do until the resource changes
    AwaitChange,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Outcome of driving every entry of a resource
struct EntryOutcome {
    ready: Vec<(String, bool)>,
    first_error: Option<ResourceError>,
}

/// Reconciles ClientMount resources against the host
pub struct Reconciler {
    store: ResourceStoreRef,
    orchestrator: MountOrchestrator,
    retry: RetryTracker,
    config: DaemonConfig,
    metrics: ReconcileMetrics,
}

impl Reconciler {
    pub fn new(
        store: ResourceStoreRef,
        orchestrator: MountOrchestrator,
        config: &DaemonConfig,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            store,
            orchestrator,
            retry: RetryTracker::new(config.retry.policy()),
            config: config.clone(),
            metrics,
        }
    }

    pub fn retry(&self) -> &RetryTracker {
        &self.retry
    }

    /// Run one pass for the resource identified by `key`
    #[instrument(skip_all, fields(resource = %key))]
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction> {
        if self.config.is_excluded(&key.namespace) {
            debug!("Namespace excluded, ignoring");
            return Ok(ReconcileAction::AwaitChange);
        }

        let Some(resource) = self.store.get(key).await? else {
            debug!("Resource is gone");
            self.retry.reset(key);
            return Ok(ReconcileAction::AwaitChange);
        };

        let _timer = self.metrics.duration.start_timer();
        let phase = phase(&resource, &self.config.finalizer);
        self.metrics
            .reconciliations
            .with_label_values(&[phase.as_str()])
            .inc();
        debug!("Phase {}", phase);

        match phase {
            Phase::Deleting => self.finalize(key, &resource).await,
            Phase::AwaitingStatusInit => {
                let mut status = resource.status.clone().unwrap_or_default();
                status.reshape(&resource.spec);
                self.persist(&resource, status).await?;
                info!("Initialized status for {} mounts", resource.spec.mounts.len());
                Ok(ReconcileAction::Requeue)
            }
            Phase::AwaitingDesiredPropagation => {
                let mut status = resource.status.clone().unwrap_or_default();
                status.propagate(resource.spec.desired_state);
                self.persist(&resource, status).await?;
                info!("Desired state is now {}", resource.spec.desired_state);
                Ok(ReconcileAction::Requeue)
            }
            Phase::AwaitingFinalizer => {
                self.store.add_finalizer(&resource, &self.config.finalizer).await?;
                info!("Added finalizer {}", self.config.finalizer);
                Ok(ReconcileAction::Requeue)
            }
            Phase::Applying => self.apply(key, &resource).await,
        }
    }

    async fn apply(&self, key: &ResourceKey, resource: &ClientMount) -> Result<ReconcileAction> {
        let mut status = resource.status.clone().unwrap_or_default();

        if let Err(e) = resource.spec.validate() {
            warn!("Invalid mount specification: {}", e);
            status.error = Some(ResourceError::from_error("Invalid mount specification", &e));
            self.persist(resource, status).await?;
            return Ok(ReconcileAction::RequeueAfter(self.retry.next_delay(key)));
        }

        status.error = None;
        let outcome = self
            .drive(&resource.spec.mounts, resource.spec.desired_state)
            .await;
        for (entry, ready) in &outcome.ready {
            status.set_ready(entry, *ready);
        }
        status.error = outcome.first_error;

        let failed = status.error.is_some();
        self.persist(resource, status).await?;

        if failed {
            let delay = self.retry.next_delay(key);
            error!("Reconciliation failed, retrying in {:?}", delay);
            Ok(ReconcileAction::RequeueAfter(delay))
        } else {
            self.retry.reset(key);
            debug!("All mounts {}", resource.spec.desired_state);
            Ok(ReconcileAction::AwaitChange)
        }
    }

    /// Cleanup pass of a resource marked for deletion. The finalizer is
    /// released only once every entry unmounted cleanly.
    async fn finalize(&self, key: &ResourceKey, resource: &ClientMount) -> Result<ReconcileAction> {
        if !has_finalizer(resource, &self.config.finalizer) {
            return Ok(ReconcileAction::AwaitChange);
        }

        let outcome = self
            .drive(&resource.spec.mounts, ClientMountState::Unmounted)
            .await;

        let Some(first_error) = outcome.first_error else {
            self.store
                .remove_finalizer(resource, &self.config.finalizer)
                .await?;
            self.retry.reset(key);
            info!("Cleanup complete, removed finalizer {}", self.config.finalizer);
            return Ok(ReconcileAction::AwaitChange);
        };

        let mut status = resource.status.clone().unwrap_or_default();
        for (entry, ready) in &outcome.ready {
            status.set_ready(entry, *ready);
        }
        status.error = Some(first_error);
        self.persist(resource, status).await?;

        let delay = self.retry.next_delay(key);
        error!("Cleanup failed, deletion blocked; retrying in {:?}", delay);
        Ok(ReconcileAction::RequeueAfter(delay))
    }

    /// Mount or unmount every entry; a failing entry never stops the rest
    async fn drive(&self, mounts: &[ClientMountInfo], desired: ClientMountState) -> EntryOutcome {
        let (operation, context) = match desired {
            ClientMountState::Mounted => ("mount", "Mount failed"),
            ClientMountState::Unmounted => ("unmount", "Unmount failed"),
        };

        let mut outcome = EntryOutcome {
            ready: Vec::with_capacity(mounts.len()),
            first_error: None,
        };

        for info in mounts {
            let result = match desired {
                ClientMountState::Mounted => self.orchestrator.mount(info).await,
                ClientMountState::Unmounted => self.orchestrator.unmount(info).await,
            };

            if let Err(e) = &result {
                warn!("Failed to {} {}: {}", operation, info.mount_path, e);
                self.metrics
                    .entry_failures
                    .with_label_values(&[operation])
                    .inc();
                if outcome.first_error.is_none() {
                    outcome.first_error = Some(ResourceError::from_error(context, e));
                }
            }
            outcome.ready.push((info.key().to_string(), result.is_ok()));
        }

        outcome
    }

    /// Write `status` unless it is what the store already holds
    async fn persist(&self, resource: &ClientMount, status: ClientMountStatus) -> Result<()> {
        if resource.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = resource.clone();
        updated.status = Some(status);
        self.store.update_status(&updated).await
    }
}
