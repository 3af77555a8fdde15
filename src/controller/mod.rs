//! ClientMount Controller
//!
//! Wires the reconciler to the Kubernetes watch machinery. Change
//! notifications come from `kube::runtime::Controller`; every delivery runs
//! one reconciliation pass and the returned `ReconcileAction` decides when
//! the resource is looked at again.

pub mod metrics;
pub mod orchestrator;
pub mod reconciler;
pub mod retry;
pub mod standalone;
pub mod store;

pub use metrics::ReconcileMetrics;
pub use orchestrator::{mount_command, unmount_command, MountOrchestrator};
pub use reconciler::{phase, Phase, ReconcileAction, Reconciler};
pub use retry::{RetryPolicy, RetryTracker, DEFAULT_RETRY_DELAY};
pub use store::{KubeStore, MemoryStore};

use crate::crd::ClientMount;
use crate::domain::ports::ResourceKey;
use crate::error::{Error, ErrorAction, Result};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl From<ReconcileAction> for Action {
    fn from(action: ReconcileAction) -> Self {
        match action {
            ReconcileAction::Requeue => Action::requeue(Duration::ZERO),
            ReconcileAction::RequeueAfter(delay) => Action::requeue(delay),
            ReconcileAction::AwaitChange => Action::await_change(),
        }
    }
}

/// Watch ClientMounts (in `namespace`, or cluster-wide) and reconcile them
/// until a termination signal arrives
pub async fn run_controller(
    client: Client,
    reconciler: Arc<Reconciler>,
    namespace: Option<&str>,
) -> Result<()> {
    let api: Api<ClientMount> = match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    info!(
        "Watching ClientMounts in {}",
        namespace.unwrap_or("all namespaces")
    );

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object),
                Err(e) => warn!("Reconcile failed: {}", e),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

async fn reconcile(resource: Arc<ClientMount>, reconciler: Arc<Reconciler>) -> Result<Action> {
    let key = ResourceKey::from_resource(&resource);
    reconciler.reconcile(&key).await.map(Action::from)
}

/// Requeue schedule for errors that escaped a pass (store and API failures)
pub fn error_policy(resource: Arc<ClientMount>, err: &Error, reconciler: Arc<Reconciler>) -> Action {
    let key = ResourceKey::from_resource(&resource);
    warn!("Reconciliation of {} failed: {}", key, err);

    match err.action() {
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
        ErrorAction::RequeueWithBackoff => Action::requeue(reconciler.retry().next_delay(&key)),
    }
}
