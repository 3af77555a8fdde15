//! Standalone Mode
//!
//! Reconciles ClientMount manifests from a directory without a Kubernetes
//! API server. Resources live in a `MemoryStore` and each one is driven
//! until it settles. Combined with the recording executor this is a dry run.

use crate::controller::reconciler::{ReconcileAction, Reconciler};
use crate::controller::store::MemoryStore;
use crate::crd::ClientMount;
use crate::domain::ports::ResourceKey;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Passes allowed per resource before giving up on it settling
pub const DEFAULT_MAX_PASSES: usize = 16;

/// Load every ClientMount from `*.yaml` / `*.yml` files in `dir`, in file
/// name order. Files may hold several YAML documents.
pub fn load_manifests(dir: &Path) -> Result<Vec<ClientMount>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Configuration(format!("Cannot read manifest directory {}: {}", dir.display(), e))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();

    let mut resources = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file)?;
        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            resources.push(serde_yaml::from_value(value)?);
        }
        info!("Loaded manifests from {}", file.display());
    }

    Ok(resources)
}

/// Run passes for `key` while the reconciler asks for an immediate requeue
pub async fn settle(
    reconciler: &Reconciler,
    key: &ResourceKey,
    max_passes: usize,
) -> Result<ReconcileAction> {
    let mut action = ReconcileAction::Requeue;
    for _ in 0..max_passes {
        action = reconciler.reconcile(key).await?;
        if action != ReconcileAction::Requeue {
            return Ok(action);
        }
    }

    warn!("{} did not settle after {} passes", key, max_passes);
    Ok(action)
}

/// Load manifests from `dir` into `store`, settle each, and return the
/// resulting objects
pub async fn run(
    reconciler: &Reconciler,
    store: &MemoryStore,
    dir: &Path,
) -> Result<Vec<ClientMount>> {
    let keys: Vec<ResourceKey> = load_manifests(dir)?
        .into_iter()
        .map(|resource| store.insert(resource))
        .collect();
    info!("Reconciling {} ClientMounts", keys.len());

    let mut settled = Vec::with_capacity(keys.len());
    for key in &keys {
        match settle(reconciler, key, DEFAULT_MAX_PASSES).await? {
            ReconcileAction::RequeueAfter(delay) => {
                warn!("{} failed, would retry in {:?}", key, delay)
            }
            action => info!("{} settled ({:?})", key, action),
        }
        if let Some(resource) = store.snapshot(key) {
            settled.push(resource);
        }
    }

    Ok(settled)
}
