use edgeslice_core::{Event, Namespace, Node, Pod, ResourceQuota, Slice, SliceClaim, SubNamespace};
use edgeslice_store::{ResourceGateway, ResourceStore, StoreGateway};
use std::sync::Arc;

/// One gateway per kind the reconcilers read or write
#[derive(Clone)]
pub struct Clients {
    pub slices: Arc<dyn ResourceGateway<Slice>>,
    pub slice_claims: Arc<dyn ResourceGateway<SliceClaim>>,
    pub sub_namespaces: Arc<dyn ResourceGateway<SubNamespace>>,
    pub nodes: Arc<dyn ResourceGateway<Node>>,
    pub pods: Arc<dyn ResourceGateway<Pod>>,
    pub namespaces: Arc<dyn ResourceGateway<Namespace>>,
    pub resource_quotas: Arc<dyn ResourceGateway<ResourceQuota>>,
    pub events: Arc<dyn ResourceGateway<Event>>,
}

impl Clients {
    /// Gateways for every kind, all backed by `store`
    pub fn from_store(store: Arc<ResourceStore>) -> Self {
        Self {
            slices: Arc::new(StoreGateway::new(store.clone())),
            slice_claims: Arc::new(StoreGateway::new(store.clone())),
            sub_namespaces: Arc::new(StoreGateway::new(store.clone())),
            nodes: Arc::new(StoreGateway::new(store.clone())),
            pods: Arc::new(StoreGateway::new(store.clone())),
            namespaces: Arc::new(StoreGateway::new(store.clone())),
            resource_quotas: Arc::new(StoreGateway::new(store.clone())),
            events: Arc::new(StoreGateway::new(store)),
        }
    }
}
