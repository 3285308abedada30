//! Fixtures shared by the reconciler tests

use crate::clients::Clients;
use async_trait::async_trait;
use edgeslice_core::k8s_openapi::api::core::v1::{
    NamespaceSpec, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, NodeStatus, PodSpec,
    ResourceQuotaSpec, ResourceRequirements,
};
use edgeslice_core::k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use edgeslice_core::labels::{
    escape_pointer, ACCESS_LABEL, ACCESS_PUBLIC, NAMESPACE_KIND_LABEL, NONE, PRE_RESERVATION_LABEL,
};
use edgeslice_core::{
    Namespace, Node, NodeLabelState, ObjectMeta, Pod, Resource, ResourceEvent, ResourceQuota,
    Slice, SliceClaim, SliceClaimSpec, SliceNodeSelector,
};
use edgeslice_store::{DeleteParams, ListParams, ResourceGateway, ResourceStore, StorageError};
use json_patch::Patch;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub struct TestCluster {
    _dir: TempDir,
    pub store: Arc<ResourceStore>,
    pub clients: Clients,
}

impl TestCluster {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ResourceStore::open(dir.path().join("cluster.redb")).unwrap());
        let clients = Clients::from_store(store.clone());
        Self {
            _dir: dir,
            store,
            clients,
        }
    }

    pub async fn add_node(&self, node: Node) {
        self.clients.nodes.create(&node).await.unwrap();
    }

    pub async fn add_pod(&self, pod: Pod) {
        self.clients.pods.create(&pod).await.unwrap();
    }

    /// Namespace, optionally labelled with its parent kind
    pub async fn add_namespace(&self, name: &str, kind: Option<&str>) {
        let labels = kind.map(|k| BTreeMap::from([(NAMESPACE_KIND_LABEL.to_string(), k.to_string())]));
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..Default::default()
            },
            spec: Some(NamespaceSpec::default()),
            ..Default::default()
        };
        self.clients.namespaces.create(&namespace).await.unwrap();
    }

    pub async fn add_quota(&self, namespace: &str, name: &str, hard: &[(&str, &str)]) {
        let quota = ResourceQuota {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ResourceQuotaSpec {
                hard: Some(quantities(hard)),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.clients.resource_quotas.create(&quota).await.unwrap();
    }
}

pub fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

/// Unassigned public node in zone `paris`
pub fn make_node(name: &str, cpu: &str, memory: &str) -> Node {
    let mut labels = NodeLabelState::Unassigned.labels();
    labels.insert("edge-net.io/city".to_string(), "paris".to_string());
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(NodeStatus {
            capacity: Some(quantities(&[("cpu", cpu), ("memory", memory)])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn make_pod(namespace: &str, name: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim for `count` nodes in `paris` with a cpu limit of `cpu` each
pub fn make_claim(namespace: &str, name: &str, slice_name: &str, count: usize, cpu: &str) -> SliceClaim {
    SliceClaim::new(
        namespace,
        name,
        SliceClaimSpec {
            slice_name: slice_name.to_string(),
            slice_class_name: "Medium".to_string(),
            node_selector: SliceNodeSelector {
                selector: NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "edge-net.io/city".to_string(),
                            operator: "In".to_string(),
                            values: Some(vec!["paris".to_string()]),
                        }]),
                        match_fields: None,
                    }],
                },
                resources: ResourceRequirements {
                    limits: Some(quantities(&[("cpu", cpu)])),
                    ..Default::default()
                },
                count,
            },
            slice_expiry: None,
        },
    )
}

pub async fn node_labels(cluster: &TestCluster, node: &str) -> BTreeMap<String, String> {
    cluster.clients.nodes.get(None, node).await.unwrap().labels()
}

/// Sorted names of the nodes whose `label` is `value`
pub async fn nodes_held_by(cluster: &TestCluster, label: &str, value: &str) -> Vec<String> {
    let mut names: Vec<String> = cluster
        .clients
        .nodes
        .list(None, &ListParams::default())
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.labels().get(label).map(String::as_str) == Some(value))
        .map(|n| n.name().to_string())
        .collect();
    names.sort();
    names
}

/// Node gateway that fails the `fail_on`-th reservation patch (1-based)
pub struct FlakyNodes {
    inner: Arc<dyn ResourceGateway<Node>>,
    fail_on: usize,
    reservations: Mutex<Vec<String>>,
    attempts: Mutex<usize>,
}

impl FlakyNodes {
    pub fn new(inner: Arc<dyn ResourceGateway<Node>>, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            reservations: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
        }
    }

    /// Nodes whose reservation patch went through
    pub fn reserved_nodes(&self) -> Vec<String> {
        self.reservations.lock().clone()
    }

    /// A patch moving a node into the public, pre-reserved state
    fn is_reservation(patch: &Patch) -> bool {
        let Ok(ops) = serde_json::to_value(patch) else {
            return false;
        };
        let value_of = |label: &str| {
            let path = format!("/metadata/labels/{}", escape_pointer(label));
            ops.as_array()
                .into_iter()
                .flatten()
                .find(|op| op["path"] == path.as_str())
                .and_then(|op| op["value"].as_str().map(str::to_string))
        };
        value_of(ACCESS_LABEL).as_deref() == Some(ACCESS_PUBLIC)
            && value_of(PRE_RESERVATION_LABEL).is_some_and(|v| v != NONE)
    }
}

#[async_trait]
impl ResourceGateway<Node> for FlakyNodes {
    async fn get(&self, namespace: Option<&str>, name: &str) -> edgeslice_store::Result<Node> {
        self.inner.get(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> edgeslice_store::Result<Vec<Node>> {
        self.inner.list(namespace, params).await
    }

    async fn create(&self, resource: &Node) -> edgeslice_store::Result<Node> {
        self.inner.create(resource).await
    }

    async fn update(&self, resource: &Node) -> edgeslice_store::Result<Node> {
        self.inner.update(resource).await
    }

    async fn update_status(&self, resource: &Node) -> edgeslice_store::Result<Node> {
        self.inner.update_status(resource).await
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> edgeslice_store::Result<Node> {
        if Self::is_reservation(patch) {
            let attempt = {
                let mut attempts = self.attempts.lock();
                *attempts += 1;
                *attempts
            };
            if attempt == self.fail_on {
                return Err(StorageError::patch_failed(name, "injected failure"));
            }
            let patched = self.inner.patch(namespace, name, patch).await?;
            self.reservations.lock().push(name.to_string());
            return Ok(patched);
        }
        self.inner.patch(namespace, name, patch).await
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> edgeslice_store::Result<Node> {
        self.inner.delete(namespace, name, params).await
    }

    fn watch(&self) -> broadcast::Receiver<ResourceEvent> {
        self.inner.watch()
    }
}

/// Slice gateway that misses the first `hidden_lookups` gets and can turn
/// down every spec update with a conflict
pub struct ScriptedSlices {
    inner: Arc<dyn ResourceGateway<Slice>>,
    hidden_lookups: Mutex<usize>,
    reject_updates: bool,
}

impl ScriptedSlices {
    pub fn new(inner: Arc<dyn ResourceGateway<Slice>>, hidden_lookups: usize, reject_updates: bool) -> Self {
        Self {
            inner,
            hidden_lookups: Mutex::new(hidden_lookups),
            reject_updates,
        }
    }
}

#[async_trait]
impl ResourceGateway<Slice> for ScriptedSlices {
    async fn get(&self, namespace: Option<&str>, name: &str) -> edgeslice_store::Result<Slice> {
        {
            let mut hidden = self.hidden_lookups.lock();
            if *hidden > 0 {
                *hidden -= 1;
                return Err(StorageError::not_found(name));
            }
        }
        self.inner.get(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>, params: &ListParams) -> edgeslice_store::Result<Vec<Slice>> {
        self.inner.list(namespace, params).await
    }

    async fn create(&self, resource: &Slice) -> edgeslice_store::Result<Slice> {
        self.inner.create(resource).await
    }

    async fn update(&self, resource: &Slice) -> edgeslice_store::Result<Slice> {
        if self.reject_updates {
            return Err(StorageError::conflict(resource.name(), "stale", "newer"));
        }
        self.inner.update(resource).await
    }

    async fn update_status(&self, resource: &Slice) -> edgeslice_store::Result<Slice> {
        self.inner.update_status(resource).await
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> edgeslice_store::Result<Slice> {
        self.inner.patch(namespace, name, patch).await
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, params: &DeleteParams) -> edgeslice_store::Result<Slice> {
        self.inner.delete(namespace, name, params).await
    }

    fn watch(&self) -> broadcast::Receiver<ResourceEvent> {
        self.inner.watch()
    }
}
