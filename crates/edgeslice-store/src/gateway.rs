use crate::{ListParams, ResourceStore, Result};
use async_trait::async_trait;
use edgeslice_core::{Resource, ResourceEvent};
use json_patch::Patch;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Options for deletes
#[derive(Debug, Clone, Default)]
pub struct DeleteParams {
    /// Seconds the object gets to shut down; `Some(0)` forces immediate removal
    pub grace_period_seconds: Option<i64>,
}

impl DeleteParams {
    /// Delete without a grace period
    pub fn immediate() -> Self {
        Self {
            grace_period_seconds: Some(0),
        }
    }
}

/// Access to the objects of one kind
///
/// The reconcilers only ever talk to the cluster through this trait, one
/// instance per kind. `namespace` is ignored for cluster-scoped kinds.
#[async_trait]
pub trait ResourceGateway<T: Resource>: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<T>;

    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> Result<Vec<T>>;

    async fn create(&self, resource: &T) -> Result<T>;

    /// Replace everything but the status
    async fn update(&self, resource: &T) -> Result<T>;

    /// Replace only the status
    async fn update_status(&self, resource: &T) -> Result<T>;

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> Result<T>;

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> Result<T>;

    /// Committed changes. The stream carries every kind; filter on
    /// [`ResourceEvent::kind`].
    fn watch(&self) -> broadcast::Receiver<ResourceEvent>;
}

/// [`ResourceGateway`] backed by a [`ResourceStore`]
pub struct StoreGateway<T> {
    store: Arc<ResourceStore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> StoreGateway<T> {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }
}

impl<T> Clone for StoreGateway<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.store))
    }
}

#[async_trait]
impl<T: Resource> ResourceGateway<T> for StoreGateway<T> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<T> {
        self.store.get(namespace, name)
    }

    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> Result<Vec<T>> {
        self.store.list(namespace, params)
    }

    async fn create(&self, resource: &T) -> Result<T> {
        self.store.create(resource)
    }

    async fn update(&self, resource: &T) -> Result<T> {
        self.store.update(resource)
    }

    async fn update_status(&self, resource: &T) -> Result<T> {
        self.store.update_status(resource)
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> Result<T> {
        self.store.patch(namespace, name, patch)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> Result<T> {
        debug!(
            "Deleting {} {} (grace period {:?})",
            T::KIND,
            name,
            params.grace_period_seconds
        );
        self.store.delete(namespace, name)
    }

    fn watch(&self) -> broadcast::Receiver<ResourceEvent> {
        self.store.subscribe()
    }
}
