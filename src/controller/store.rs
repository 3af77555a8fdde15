//! Resource Stores
//!
//! `KubeStore` persists ClientMounts in the Kubernetes API. `MemoryStore`
//! keeps them in process with the same finalizer-gated deletion rules, for
//! standalone runs and tests.

use crate::crd::ClientMount;
use crate::domain::ports::{ResourceKey, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

const KIND: &str = "ClientMount";

// =============================================================================
// Kubernetes Store
// =============================================================================

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ClientMount> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Replace the finalizer list, failing if the object changed since it was read
    async fn patch_finalizers(&self, resource: &ClientMount, finalizers: Vec<String>) -> Result<()> {
        let key = ResourceKey::from_resource(resource);
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": resource.resource_version(),
            }
        });

        self.api(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error(&key, e))?;
        Ok(())
    }
}

fn map_api_error(key: &ResourceKey, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 409 => Error::Conflict {
            name: key.to_string(),
        },
        kube::Error::Api(ref response) if response.code == 404 => Error::ResourceNotFound {
            kind: KIND.into(),
            name: key.to_string(),
        },
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ClientMount>> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn update_status(&self, resource: &ClientMount) -> Result<()> {
        let key = ResourceKey::from_resource(resource);
        let patch = json!({ "status": resource.status });

        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error(&key, e))?;

        debug!("Updated status of {}", key);
        Ok(())
    }

    async fn add_finalizer(&self, resource: &ClientMount, finalizer: &str) -> Result<()> {
        let mut finalizers = resource.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(resource, finalizers).await
    }

    async fn remove_finalizer(&self, resource: &ClientMount, finalizer: &str) -> Result<()> {
        let finalizers: Vec<String> = resource
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        if finalizers.len() == resource.finalizers().len() {
            return Ok(());
        }
        self.patch_finalizers(resource, finalizers).await
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-process store with Kubernetes-like deletion semantics: deleting an
/// object that still carries finalizers only marks it, and the object goes
/// away once its last finalizer is removed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ResourceKey, ClientMount>>,
    version: RwLock<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        let mut version = self.version.write();
        *version += 1;
        version.to_string()
    }

    /// Create or replace an object, returning its key
    pub fn insert(&self, mut resource: ClientMount) -> ResourceKey {
        if resource.metadata.namespace.is_none() {
            resource.metadata.namespace = Some("default".into());
        }
        resource.metadata.resource_version = Some(self.next_version());

        let key = ResourceKey::from_resource(&resource);
        self.objects.write().insert(key.clone(), resource);
        key
    }

    /// Current copy of an object
    pub fn snapshot(&self, key: &ResourceKey) -> Option<ClientMount> {
        self.objects.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.objects.read().keys().cloned().collect()
    }

    /// Apply `edit` to the stored spec, as an upstream writer would
    pub fn edit_spec(
        &self,
        key: &ResourceKey,
        edit: impl FnOnce(&mut crate::crd::ClientMountSpec),
    ) -> Result<()> {
        let version = self.next_version();
        let mut objects = self.objects.write();
        let object = objects.get_mut(key).ok_or_else(|| not_found(key))?;
        edit(&mut object.spec);
        object.metadata.resource_version = Some(version);
        Ok(())
    }

    /// Request deletion: immediate without finalizers, deferred otherwise
    pub fn request_deletion(&self, key: &ResourceKey) -> Result<()> {
        let version = self.next_version();
        let mut objects = self.objects.write();
        let object = objects.get_mut(key).ok_or_else(|| not_found(key))?;

        if object.finalizers().is_empty() {
            objects.remove(key);
            info!("Deleted {}", key);
            return Ok(());
        }

        if object.metadata.deletion_timestamp.is_none() {
            object.metadata.deletion_timestamp = Some(Time(Utc::now()));
            object.metadata.resource_version = Some(version);
        }
        debug!("Deletion of {} waits for finalizers", key);
        Ok(())
    }

    fn edit_finalizers(
        &self,
        resource: &ClientMount,
        edit: impl FnOnce(&mut Vec<String>),
    ) -> Result<()> {
        let key = ResourceKey::from_resource(resource);
        let version = self.next_version();
        let mut objects = self.objects.write();
        let object = objects.get_mut(&key).ok_or_else(|| not_found(&key))?;

        if object.metadata.resource_version != resource.metadata.resource_version {
            return Err(Error::Conflict {
                name: key.to_string(),
            });
        }

        edit(object.finalizers_mut());
        object.metadata.resource_version = Some(version);

        if object.metadata.deletion_timestamp.is_some() && object.finalizers().is_empty() {
            objects.remove(&key);
            info!("Deleted {}", key);
        }
        Ok(())
    }
}

fn not_found(key: &ResourceKey) -> Error {
    Error::ResourceNotFound {
        kind: KIND.into(),
        name: key.to_string(),
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ClientMount>> {
        Ok(self.snapshot(key))
    }

    async fn update_status(&self, resource: &ClientMount) -> Result<()> {
        let key = ResourceKey::from_resource(resource);
        let version = self.next_version();
        let mut objects = self.objects.write();
        let object = objects.get_mut(&key).ok_or_else(|| not_found(&key))?;

        object.status = resource.status.clone();
        object.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn add_finalizer(&self, resource: &ClientMount, finalizer: &str) -> Result<()> {
        self.edit_finalizers(resource, |finalizers| {
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        })
    }

    async fn remove_finalizer(&self, resource: &ClientMount, finalizer: &str) -> Result<()> {
        self.edit_finalizers(resource, |finalizers| finalizers.retain(|f| f != finalizer))
    }
}
