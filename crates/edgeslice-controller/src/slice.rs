//! Slice reconciler: expiry, node reservation, claim arbitration and
//! provisioning

use crate::clients::Clients;
use crate::driver::Reconciler;
use crate::error::{ControllerError, Result};
use crate::recorder::{EventRecorder, EventType};
use crate::selection::{default_filters, eligible_nodes, pick_nodes, CandidateFilter, Demand};
use async_trait::async_trait;
use chrono::Utc;
use edgeslice_core::labels::{PRE_RESERVATION_LABEL, SLICE_LABEL};
use edgeslice_core::{
    controller_of, owner_reference, split_queue_key, NodeLabelState, Requirement, Resource,
    Selector, Slice, SliceClaim, SliceClaimState, SliceState, TermSelectors,
};
use edgeslice_store::{DeleteParams, ListParams};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const MESSAGE_RESERVED: &str = "Desired resources are reserved";
pub const MESSAGE_NO_RESOURCES: &str = "There are no adequate resources to slice";
pub const MESSAGE_PATCH_FAILED: &str = "Node patch operation has failed";
pub const MESSAGE_BOUND: &str = "Slice is bound successfully";
pub const MESSAGE_DELETED: &str = "Slice deleted successfully";
pub const MESSAGE_PROVISIONED: &str = "Slice is provisioned successfully";

pub const REASON_RESERVED: &str = "Reserved";
pub const REASON_BOUND: &str = "Bound";
pub const REASON_PROVISIONED: &str = "Provisioned";
pub const REASON_EXPIRED: &str = "Expired";
pub const REASON_SLICE_FAILED: &str = "Slice Failed";
pub const REASON_PATCH_FAILED: &str = "Patch Failed";

/// Configuration for the slice reconciler
#[derive(Debug, Clone, Default)]
pub struct SliceReconcilerConfig {
    /// Seed for node selection; `None` seeds from the OS
    pub rng_seed: Option<u64>,
}

/// What a reconcile pass did to the slice itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Continue,
    Deleted,
}

pub struct SliceReconciler {
    clients: Clients,
    recorder: EventRecorder,
    filters: Vec<Box<dyn CandidateFilter>>,
    rng: Mutex<StdRng>,
}

impl SliceReconciler {
    pub fn new(clients: Clients, config: SliceReconcilerConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let recorder = EventRecorder::new("slice-controller", clients.events.clone());
        Self {
            clients,
            recorder,
            filters: default_filters(),
            rng: Mutex::new(rng),
        }
    }

    /// Reconcile the slice `name`
    ///
    /// The status is written back once, and only when it changed, even when
    /// the pass fails part way, so node reservations are never forgotten.
    pub async fn reconcile_slice(&self, name: &str) -> Result<()> {
        let mut slice: Slice = match self.clients.slices.get(None, name).await {
            Ok(slice) => slice,
            Err(e) if e.is_not_found() => {
                debug!("Slice {} no longer exists", name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let observed = slice.status.clone();

        let result = self.process(&mut slice).await;
        if matches!(result, Ok(Pass::Deleted)) {
            // The stored object never saw this pass's reservation, so the
            // delete event cannot release it
            if slice.status != observed && slice.status.state.holds_nodes() {
                self.handle_delete(&slice).await?;
            }
            return Ok(());
        }

        if slice.status != observed {
            self.clients.slices.update_status(&slice).await?;
        }
        result.map(|_| ())
    }

    async fn process(&self, slice: &mut Slice) -> Result<Pass> {
        if slice.status.is_expired(Utc::now()) {
            self.recorder
                .warning(&*slice, REASON_EXPIRED, MESSAGE_DELETED)
                .await;
            self.delete_slice(slice.name()).await?;
            return Ok(Pass::Deleted);
        }

        let reserved = if slice.status.state.holds_nodes() {
            true
        } else {
            self.reserve_nodes(slice).await?
        };

        let Some(claim_ref) = slice.spec.claim_ref.clone() else {
            return Ok(Pass::Continue);
        };
        let claim_name = claim_ref.name.clone().unwrap_or_default();
        let claim = match self
            .clients
            .slice_claims
            .get(claim_ref.namespace.as_deref(), &claim_name)
            .await
        {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                info!(
                    "Claim {}/{} of slice {} is gone, deleting the slice",
                    claim_ref.namespace.as_deref().unwrap_or_default(),
                    claim_name,
                    slice.name()
                );
                self.delete_slice(slice.name()).await?;
                return Ok(Pass::Deleted);
            }
            Err(e) => return Err(e.into()),
        };

        if !reserved {
            let mut claim = claim;
            if claim.status.state != SliceClaimState::Failure
                || claim.status.message != MESSAGE_NO_RESOURCES
            {
                claim.status.state = SliceClaimState::Failure;
                claim.status.message = MESSAGE_NO_RESOURCES.to_string();
                self.clients.slice_claims.update_status(&claim).await?;
            }
            return Ok(Pass::Continue);
        }

        self.sync_with_slice_claim(slice, claim).await
    }

    /// Reserve `spec.nodeSelector.count` nodes for the slice
    ///
    /// Returns whether the reservation holds. Any failure after a node was
    /// patched restores every node patched in this attempt.
    pub async fn reserve_nodes(&self, slice: &mut Slice) -> Result<bool> {
        let name = slice.name().to_string();
        let demand = match Demand::from_requirements(&slice.spec.node_selector.resources) {
            Ok(demand) => demand,
            Err(e) => {
                warn!("Slice {} has an unusable resource demand: {}", name, e);
                self.set_status(slice, SliceState::Failure, MESSAGE_NO_RESOURCES, REASON_SLICE_FAILED)
                    .await;
                return Ok(false);
            }
        };

        let candidates = self.candidates(slice, &demand).await?;
        let count = slice.spec.node_selector.count;
        let picked = {
            let mut rng = self.rng.lock();
            pick_nodes(&mut *rng, &candidates, count)
        };
        let Some(picked) = picked else {
            info!(
                "Slice {} needs {} node(s), only {} eligible",
                name,
                count,
                candidates.len()
            );
            self.set_status(slice, SliceState::Failure, MESSAGE_NO_RESOURCES, REASON_SLICE_FAILED)
                .await;
            return Ok(false);
        };

        let reservation = NodeLabelState::Reserved(name.clone());
        let mut patched: Vec<&str> = Vec::with_capacity(picked.len());
        for node in &picked {
            if let Err(e) = self.patch_node(node, &reservation).await {
                warn!("Failed to reserve node {} for slice {}: {}", node, name, e);
                self.roll_back(&name, &patched).await;
                self.set_status(slice, SliceState::Failure, MESSAGE_PATCH_FAILED, REASON_PATCH_FAILED)
                    .await;
                return Ok(false);
            }
            patched.push(node);
        }

        info!("Reserved nodes {:?} for slice {}", picked, name);
        self.set_status(slice, SliceState::Reserved, MESSAGE_RESERVED, REASON_RESERVED)
            .await;
        Ok(true)
    }

    /// Eligible node names across every selector term. Terms are alternatives;
    /// a node matching several appears once. No terms means every node.
    async fn candidates(&self, slice: &Slice, demand: &Demand) -> Result<Vec<String>> {
        let terms = &slice.spec.node_selector.selector.node_selector_terms;
        let mut queries = Vec::with_capacity(terms.len().max(1));
        if terms.is_empty() {
            queries.push(ListParams::default());
        }
        for term in terms {
            let selectors = TermSelectors::from_term(term);
            for skipped in &selectors.skipped {
                debug!(
                    "Slice {}: unsupported node selector requirement '{}' skipped",
                    slice.name(),
                    skipped
                );
            }
            queries.push(ListParams {
                label_selector: Some(selectors.labels),
                field_selector: Some(selectors.fields),
            });
        }

        let mut seen = HashSet::new();
        let mut eligible = Vec::new();
        for query in &queries {
            let nodes = self.clients.nodes.list(None, query).await?;
            for node in eligible_nodes(&self.filters, demand, &nodes) {
                if seen.insert(node.clone()) {
                    eligible.push(node);
                }
            }
        }
        Ok(eligible)
    }

    /// Best-effort release of nodes patched by a failed attempt
    async fn roll_back(&self, slice_name: &str, nodes: &[&str]) {
        for node in nodes {
            match self.patch_node(node, &NodeLabelState::Unassigned).await {
                Ok(()) => debug!("Rolled back node {} for slice {}", node, slice_name),
                Err(e) => warn!(
                    "Failed to roll back node {} for slice {}: {}",
                    node, slice_name, e
                ),
            }
        }
    }

    /// Arbitrate ownership of the claim and follow its state
    async fn sync_with_slice_claim(&self, slice: &mut Slice, claim: SliceClaim) -> Result<Pass> {
        let owner = controller_of(&claim.metadata).cloned();
        let Some(owner) = owner else {
            let mut claim = claim;
            claim
                .metadata
                .owner_references
                .get_or_insert_with(Vec::new)
                .push(owner_reference(&*slice));
            self.clients.slice_claims.update(&claim).await?;
            info!(
                "Slice {} took ownership of claim {}/{}",
                slice.name(),
                claim.metadata.namespace.as_deref().unwrap_or_default(),
                claim.name()
            );
            return Ok(Pass::Continue);
        };

        if owner.kind != Slice::KIND {
            return Ok(Pass::Continue);
        }
        if Some(owner.uid.as_str()) != slice.uid() {
            info!(
                "Claim {} is owned by slice {}, deleting slice {}",
                claim.name(),
                owner.name,
                slice.name()
            );
            self.delete_slice(slice.name()).await?;
            return Ok(Pass::Deleted);
        }

        match claim.status.state {
            SliceClaimState::Failure => {
                info!("Claim {} failed, deleting slice {}", claim.name(), slice.name());
                self.delete_slice(slice.name()).await?;
                Ok(Pass::Deleted)
            }
            // Provisioning only follows a binding
            SliceClaimState::Applied if slice.status.state == SliceState::Bound => {
                self.provision_slice(slice).await?;
                Ok(Pass::Continue)
            }
            SliceClaimState::Applied if slice.status.state == SliceState::Provisioned => {
                Ok(Pass::Continue)
            }
            _ => {
                self.set_status(slice, SliceState::Bound, MESSAGE_BOUND, REASON_BOUND)
                    .await;
                if !matches!(
                    claim.status.state,
                    SliceClaimState::Bound | SliceClaimState::Applied
                ) {
                    let mut claim = claim;
                    claim.status.state = SliceClaimState::Bound;
                    claim.status.message = MESSAGE_BOUND.to_string();
                    self.clients.slice_claims.update_status(&claim).await?;
                }
                Ok(Pass::Continue)
            }
        }
    }

    /// Turn the reserved nodes into dedicated nodes and evict their pods
    pub async fn provision_slice(&self, slice: &mut Slice) -> Result<()> {
        let name = slice.name().to_string();
        let nodes = self
            .clients
            .nodes
            .list(None, &held_by(PRE_RESERVATION_LABEL, &name))
            .await?;

        let provisioned = NodeLabelState::Provisioned(name.clone());
        for node in &nodes {
            self.patch_node(node.name(), &provisioned).await?;
            self.evict_pods(node.name()).await;
        }

        slice.status.state = SliceState::Provisioned;
        self.recorder
            .normal(&*slice, REASON_PROVISIONED, MESSAGE_PROVISIONED)
            .await;
        Ok(())
    }

    async fn evict_pods(&self, node_name: &str) {
        let on_node = ListParams::fields(
            Selector::new().with(Requirement::equals("spec.nodeName", node_name)),
        );
        let pods = match self.clients.pods.list(None, &on_node).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Failed to list pods on node {}: {}", node_name, e);
                return;
            }
        };

        for pod in pods {
            let namespace = pod.metadata.namespace.as_deref();
            match self
                .clients
                .pods
                .delete(namespace, pod.name(), &DeleteParams::immediate())
                .await
            {
                Ok(_) => debug!("Evicted pod {} from node {}", pod.name(), node_name),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to evict pod {} from node {}: {}", pod.name(), node_name, e),
            }
        }
    }

    /// Release the nodes of a slice that was deleted
    pub async fn handle_delete(&self, slice: &Slice) -> Result<()> {
        let label = match slice.status.state {
            SliceState::Reserved | SliceState::Bound => PRE_RESERVATION_LABEL,
            SliceState::Provisioned => SLICE_LABEL,
            SliceState::Unset | SliceState::Failure => return Ok(()),
        };

        let nodes = self
            .clients
            .nodes
            .list(None, &held_by(label, slice.name()))
            .await?;
        for node in &nodes {
            if let Err(e) = self.patch_node(node.name(), &NodeLabelState::Unassigned).await {
                warn!(
                    "Failed to release node {} of slice {}: {}",
                    node.name(),
                    slice.name(),
                    e
                );
            }
        }
        info!("Released {} node(s) of deleted slice {}", nodes.len(), slice.name());
        Ok(())
    }

    async fn patch_node(&self, node: &str, state: &NodeLabelState) -> Result<()> {
        let patch = state.json_patch()?;
        self.clients.nodes.patch(None, node, &patch).await?;
        Ok(())
    }

    async fn delete_slice(&self, name: &str) -> Result<()> {
        match self
            .clients
            .slices
            .delete(None, name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the slice to `state`, recording an event on change
    async fn set_status(&self, slice: &mut Slice, state: SliceState, message: &str, reason: &str) {
        if slice.status.state == state && slice.status.message == message {
            return;
        }
        slice.status.state = state;
        slice.status.message = message.to_string();
        let event_type = match state {
            SliceState::Failure => EventType::Warning,
            _ => EventType::Normal,
        };
        self.recorder.record(&*slice, event_type, reason, message).await;
    }
}

fn held_by(label: &str, slice_name: &str) -> ListParams {
    ListParams::labels(Selector::new().with(Requirement::equals(label, slice_name)))
}

#[async_trait]
impl Reconciler for SliceReconciler {
    fn name(&self) -> &str {
        "slice"
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        match split_queue_key(key)? {
            (None, name) => self.reconcile_slice(name).await,
            (Some(_), _) => Err(ControllerError::invalid_key(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        make_claim, make_node, make_pod, node_labels, nodes_held_by, FlakyNodes, TestCluster,
    };
    use edgeslice_core::k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm};
    use edgeslice_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use edgeslice_core::labels::{ACCESS_LABEL, NONE};
    use edgeslice_core::{object_reference, Pod, SliceSpec};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn reconciler(cluster: &TestCluster) -> SliceReconciler {
        SliceReconciler::new(cluster.clients.clone(), SliceReconcilerConfig { rng_seed: Some(7) })
    }

    async fn slice_for(cluster: &TestCluster, name: &str, count: usize, cpu: &str) -> Slice {
        let claim = make_claim("lab-a", "unused", name, count, cpu);
        let slice = Slice::new(
            name,
            SliceSpec {
                slice_class_name: claim.spec.slice_class_name.clone(),
                node_selector: claim.spec.node_selector.clone(),
                claim_ref: None,
            },
        );
        cluster.clients.slices.create(&slice).await.unwrap()
    }

    /// Claim `claim-1` and a slice referencing it, reserved and owning it
    async fn owned_slice(cluster: &TestCluster, reconciler: &SliceReconciler, count: usize) {
        cluster.add_namespace("lab-a", None).await;
        let claim = cluster
            .clients
            .slice_claims
            .create(&make_claim("lab-a", "claim-1", "edge-slice-1", count, "1"))
            .await
            .unwrap();
        let mut slice = slice_for(cluster, "edge-slice-1", count, "1").await;
        slice.spec.claim_ref = Some(object_reference(&claim));
        cluster.clients.slices.update(&slice).await.unwrap();
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
    }

    async fn set_claim_state(cluster: &TestCluster, state: SliceClaimState) {
        let mut claim = cluster.clients.slice_claims.get(Some("lab-a"), "claim-1").await.unwrap();
        claim.status.state = state;
        cluster.clients.slice_claims.update_status(&claim).await.unwrap();
    }

    fn city_term(cities: &[&str], extra: Option<NodeSelectorRequirement>) -> NodeSelectorTerm {
        let mut expressions = vec![NodeSelectorRequirement {
            key: "edge-net.io/city".to_string(),
            operator: "In".to_string(),
            values: Some(cities.iter().map(|c| c.to_string()).collect()),
        }];
        expressions.extend(extra);
        NodeSelectorTerm {
            match_expressions: Some(expressions),
            match_fields: None,
        }
    }

    async fn get_slice(cluster: &TestCluster, name: &str) -> Slice {
        cluster.clients.slices.get(None, name).await.unwrap()
    }

    #[tokio::test]
    async fn test_reserves_exact_count_of_distinct_nodes() {
        let cluster = TestCluster::new();
        for i in 0..5 {
            cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
        }
        slice_for(&cluster, "edge-slice-1", 3, "2").await;

        reconciler(&cluster).reconcile_slice("edge-slice-1").await.unwrap();

        let slice = get_slice(&cluster, "edge-slice-1").await;
        assert_eq!(slice.status.state, SliceState::Reserved);
        assert_eq!(slice.status.message, MESSAGE_RESERVED);

        let held = nodes_held_by(&cluster, PRE_RESERVATION_LABEL, "edge-slice-1").await;
        assert_eq!(held.len(), 3);
        assert_eq!(held.iter().collect::<HashSet<_>>().len(), 3);
        for node in &held {
            let labels = node_labels(&cluster, node).await;
            assert_eq!(labels[ACCESS_LABEL], "public");
            assert_eq!(labels[SLICE_LABEL], NONE);
        }
    }

    #[tokio::test]
    async fn test_seeded_selection_is_repeatable() {
        let mut picks = Vec::new();
        for _ in 0..2 {
            let cluster = TestCluster::new();
            for i in 0..6 {
                cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
            }
            slice_for(&cluster, "edge-slice-1", 2, "1").await;
            reconciler(&cluster).reconcile_slice("edge-slice-1").await.unwrap();
            picks.push(nodes_held_by(&cluster, PRE_RESERVATION_LABEL, "edge-slice-1").await);
        }
        assert_eq!(picks[0], picks[1]);
    }

    #[tokio::test]
    async fn test_insufficient_nodes_fails_without_patching() {
        let cluster = TestCluster::new();
        cluster.add_node(make_node("node-0", "8", "16Gi")).await;
        cluster.add_node(make_node("node-1", "1", "16Gi")).await;
        slice_for(&cluster, "edge-slice-1", 2, "2").await;

        reconciler(&cluster).reconcile_slice("edge-slice-1").await.unwrap();

        let slice = get_slice(&cluster, "edge-slice-1").await;
        assert_eq!(slice.status.state, SliceState::Failure);
        assert_eq!(slice.status.message, MESSAGE_NO_RESOURCES);
        assert!(nodes_held_by(&cluster, PRE_RESERVATION_LABEL, "edge-slice-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_patch_rolls_back_earlier_nodes() {
        let cluster = TestCluster::new();
        for i in 0..4 {
            cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
        }
        slice_for(&cluster, "edge-slice-1", 3, "1").await;

        // Third reservation patch fails
        let flaky = Arc::new(FlakyNodes::new(cluster.clients.nodes.clone(), 3));
        let mut clients = cluster.clients.clone();
        clients.nodes = flaky.clone();
        let reconciler = SliceReconciler::new(clients, SliceReconcilerConfig { rng_seed: Some(1) });

        reconciler.reconcile_slice("edge-slice-1").await.unwrap();

        let slice = get_slice(&cluster, "edge-slice-1").await;
        assert_eq!(slice.status.state, SliceState::Failure);
        assert_eq!(slice.status.message, MESSAGE_PATCH_FAILED);

        let touched = flaky.reserved_nodes();
        assert_eq!(touched.len(), 2);
        for node in &touched {
            assert_eq!(node_labels(&cluster, node).await, NodeLabelState::Unassigned.labels());
        }
        assert!(nodes_held_by(&cluster, PRE_RESERVATION_LABEL, "edge-slice-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_claim_deletes_slice() {
        let cluster = TestCluster::new();
        cluster.add_node(make_node("node-0", "8", "16Gi")).await;
        let mut slice = slice_for(&cluster, "edge-slice-1", 1, "1").await;
        slice.spec.claim_ref = Some(object_reference(&make_claim("lab-a", "gone", "edge-slice-1", 1, "1")));
        cluster.clients.slices.update(&slice).await.unwrap();

        reconciler(&cluster).reconcile_slice("edge-slice-1").await.unwrap();
        assert!(cluster.clients.slices.get(None, "edge-slice-1").await.unwrap_err().is_not_found());
        // The node reserved earlier in the same pass is handed back
        assert_eq!(
            node_labels(&cluster, "node-0").await,
            NodeLabelState::Unassigned.labels()
        );
    }

    #[tokio::test]
    async fn test_reservation_failure_fails_claim() {
        let cluster = TestCluster::new();
        cluster.add_namespace("lab-a", None).await;
        let claim = cluster
            .clients
            .slice_claims
            .create(&make_claim("lab-a", "claim-1", "edge-slice-1", 2, "1"))
            .await
            .unwrap();
        let mut slice = slice_for(&cluster, "edge-slice-1", 2, "1").await;
        slice.spec.claim_ref = Some(object_reference(&claim));
        cluster.clients.slices.update(&slice).await.unwrap();

        reconciler(&cluster).reconcile_slice("edge-slice-1").await.unwrap();

        let claim = cluster.clients.slice_claims.get(Some("lab-a"), "claim-1").await.unwrap();
        assert_eq!(claim.status.state, SliceClaimState::Failure);
        assert_eq!(claim.status.message, MESSAGE_NO_RESOURCES);
    }

    #[tokio::test]
    async fn test_ownership_then_binding() {
        let cluster = TestCluster::new();
        cluster.add_namespace("lab-a", None).await;
        for i in 0..2 {
            cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
        }
        let claim = cluster
            .clients
            .slice_claims
            .create(&make_claim("lab-a", "claim-1", "edge-slice-1", 2, "1"))
            .await
            .unwrap();
        let mut slice = slice_for(&cluster, "edge-slice-1", 2, "1").await;
        slice.spec.claim_ref = Some(object_reference(&claim));
        let slice = cluster.clients.slices.update(&slice).await.unwrap();
        let reconciler = reconciler(&cluster);

        // First pass reserves and takes ownership of the claim
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        let claim = cluster.clients.slice_claims.get(Some("lab-a"), "claim-1").await.unwrap();
        let owner = controller_of(&claim.metadata).unwrap();
        assert_eq!(Some(owner.uid.as_str()), slice.uid());
        assert_eq!(get_slice(&cluster, "edge-slice-1").await.status.state, SliceState::Reserved);

        // Second pass binds both sides
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        let bound = get_slice(&cluster, "edge-slice-1").await;
        assert_eq!(bound.status.state, SliceState::Bound);
        assert_eq!(bound.status.message, MESSAGE_BOUND);
        let claim = cluster.clients.slice_claims.get(Some("lab-a"), "claim-1").await.unwrap();
        assert_eq!(claim.status.state, SliceClaimState::Bound);
    }

    #[tokio::test]
    async fn test_losing_slice_deletes_itself() {
        let cluster = TestCluster::new();
        cluster.add_namespace("lab-a", None).await;
        cluster.add_node(make_node("node-0", "8", "16Gi")).await;

        let winner = slice_for(&cluster, "winner", 1, "1").await;
        let mut claim = make_claim("lab-a", "claim-1", "winner", 1, "1");
        claim.metadata.owner_references = Some(vec![owner_reference(&winner)]);
        let claim = cluster.clients.slice_claims.create(&claim).await.unwrap();

        let mut loser = slice_for(&cluster, "loser", 1, "1").await;
        loser.spec.claim_ref = Some(object_reference(&claim));
        cluster.clients.slices.update(&loser).await.unwrap();

        reconciler(&cluster).reconcile_slice("loser").await.unwrap();
        assert!(cluster.clients.slices.get(None, "loser").await.unwrap_err().is_not_found());
        assert!(cluster.clients.slices.get(None, "winner").await.is_ok());
    }

    #[tokio::test]
    async fn test_provisioning_is_idempotent() {
        let cluster = TestCluster::new();
        cluster.add_namespace("lab-a", None).await;
        for i in 0..3 {
            cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
        }
        let claim = cluster
            .clients
            .slice_claims
            .create(&make_claim("lab-a", "claim-1", "edge-slice-1", 2, "1"))
            .await
            .unwrap();
        let mut slice = slice_for(&cluster, "edge-slice-1", 2, "1").await;
        slice.spec.claim_ref = Some(object_reference(&claim));
        cluster.clients.slices.update(&slice).await.unwrap();
        let reconciler = reconciler(&cluster);

        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        let held = nodes_held_by(&cluster, PRE_RESERVATION_LABEL, "edge-slice-1").await;
        assert_eq!(held.len(), 2);
        for (i, node) in held.iter().enumerate() {
            cluster.add_pod(make_pod("tenant", &format!("pod-{}", i), node)).await;
        }

        let mut claim = cluster.clients.slice_claims.get(Some("lab-a"), "claim-1").await.unwrap();
        claim.status.state = SliceClaimState::Applied;
        cluster.clients.slice_claims.update_status(&claim).await.unwrap();

        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        let slice = get_slice(&cluster, "edge-slice-1").await;
        assert_eq!(slice.status.state, SliceState::Provisioned);
        for node in &held {
            assert_eq!(
                node_labels(&cluster, node).await,
                NodeLabelState::Provisioned("edge-slice-1".to_string()).labels()
            );
        }
        let pods: Vec<Pod> = cluster.clients.pods.list(None, &ListParams::default()).await.unwrap();
        assert!(pods.is_empty());

        // A second pass patches nothing and evicts nothing
        cluster.add_pod(make_pod("tenant", "late", &held[0])).await;
        let mut rx = cluster.clients.nodes.watch();
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        assert!(std::iter::from_fn(|| rx.try_recv().ok()).all(|e| e.kind() != "Node"));
        assert_eq!(cluster.clients.pods.list(None, &ListParams::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_slice_is_deleted() {
        let cluster = TestCluster::new();
        let mut slice = slice_for(&cluster, "edge-slice-1", 1, "1").await;
        slice.status.expiry = Some(Time(Utc::now() - chrono::Duration::minutes(1)));
        cluster.clients.slices.update_status(&slice).await.unwrap();

        reconciler(&cluster).reconcile_slice("edge-slice-1").await.unwrap();
        assert!(cluster.clients.slices.get(None, "edge-slice-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_releases_nodes() {
        let cluster = TestCluster::new();
        for i in 0..3 {
            cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
        }
        slice_for(&cluster, "edge-slice-1", 2, "1").await;
        let reconciler = reconciler(&cluster);
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();

        let deleted = cluster
            .clients
            .slices
            .delete(None, "edge-slice-1", &DeleteParams::default())
            .await
            .unwrap();
        reconciler.handle_delete(&deleted).await.unwrap();

        for i in 0..3 {
            assert_eq!(
                node_labels(&cluster, &format!("node-{}", i)).await,
                NodeLabelState::Unassigned.labels()
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_namespaced_key() {
        let cluster = TestCluster::new();
        let err = reconciler(&cluster).reconcile("lab-a/edge-slice-1").await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_applied_claim_binds_before_provisioning() {
        let cluster = TestCluster::new();
        for i in 0..2 {
            cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
        }
        let reconciler = reconciler(&cluster);
        owned_slice(&cluster, &reconciler, 2).await;
        assert_eq!(get_slice(&cluster, "edge-slice-1").await.status.state, SliceState::Reserved);

        // Applied arrives while the slice is only reserved
        set_claim_state(&cluster, SliceClaimState::Applied).await;
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        assert_eq!(get_slice(&cluster, "edge-slice-1").await.status.state, SliceState::Bound);
        let claim = cluster.clients.slice_claims.get(Some("lab-a"), "claim-1").await.unwrap();
        assert_eq!(claim.status.state, SliceClaimState::Applied);
        assert_eq!(nodes_held_by(&cluster, PRE_RESERVATION_LABEL, "edge-slice-1").await.len(), 2);
        assert!(nodes_held_by(&cluster, SLICE_LABEL, "edge-slice-1").await.is_empty());

        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        assert_eq!(get_slice(&cluster, "edge-slice-1").await.status.state, SliceState::Provisioned);
        assert_eq!(nodes_held_by(&cluster, SLICE_LABEL, "edge-slice-1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_claim_deletes_owning_slice() {
        let cluster = TestCluster::new();
        cluster.add_node(make_node("node-0", "8", "16Gi")).await;
        let reconciler = reconciler(&cluster);
        owned_slice(&cluster, &reconciler, 1).await;

        set_claim_state(&cluster, SliceClaimState::Failure).await;
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        assert!(cluster.clients.slices.get(None, "edge-slice-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_releases_provisioned_nodes() {
        let cluster = TestCluster::new();
        for i in 0..3 {
            cluster.add_node(make_node(&format!("node-{}", i), "8", "16Gi")).await;
        }
        let reconciler = reconciler(&cluster);
        owned_slice(&cluster, &reconciler, 2).await;
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        set_claim_state(&cluster, SliceClaimState::Applied).await;
        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        assert_eq!(get_slice(&cluster, "edge-slice-1").await.status.state, SliceState::Provisioned);
        assert_eq!(nodes_held_by(&cluster, SLICE_LABEL, "edge-slice-1").await.len(), 2);

        let deleted = cluster
            .clients
            .slices
            .delete(None, "edge-slice-1", &DeleteParams::default())
            .await
            .unwrap();
        reconciler.handle_delete(&deleted).await.unwrap();

        for i in 0..3 {
            assert_eq!(
                node_labels(&cluster, &format!("node-{}", i)).await,
                NodeLabelState::Unassigned.labels()
            );
        }
    }

    #[tokio::test]
    async fn test_reservation_draws_from_union_of_terms() {
        let cluster = TestCluster::new();
        for (name, city) in [("node-0", "paris"), ("node-1", "paris"), ("node-2", "lyon"), ("node-3", "berlin")] {
            let mut node = make_node(name, "8", "16Gi");
            node.metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert("edge-net.io/city".to_string(), city.to_string());
            cluster.add_node(node).await;
        }
        // The Gt requirement is skipped, so the second term still matches lyon
        let cores = NodeSelectorRequirement {
            key: "edge-net.io/cores".to_string(),
            operator: "Gt".to_string(),
            values: Some(vec!["4".to_string()]),
        };
        let terms = vec![city_term(&["paris"], None), city_term(&["paris", "lyon"], Some(cores))];

        for (name, count) in [("edge-slice-1", 3), ("edge-slice-2", 4)] {
            let mut slice = slice_for(&cluster, name, count, "1").await;
            slice.spec.node_selector.selector.node_selector_terms = terms.clone();
            cluster.clients.slices.update(&slice).await.unwrap();
        }
        let reconciler = reconciler(&cluster);

        reconciler.reconcile_slice("edge-slice-1").await.unwrap();
        assert_eq!(get_slice(&cluster, "edge-slice-1").await.status.state, SliceState::Reserved);
        assert_eq!(
            nodes_held_by(&cluster, PRE_RESERVATION_LABEL, "edge-slice-1").await,
            vec!["node-0", "node-1", "node-2"]
        );
        assert_eq!(node_labels(&cluster, "node-3").await[PRE_RESERVATION_LABEL], NONE);

        // Paris nodes match both terms but count once
        for node in ["node-0", "node-1", "node-2"] {
            cluster
                .clients
                .nodes
                .patch(None, node, &NodeLabelState::Unassigned.json_patch().unwrap())
                .await
                .unwrap();
        }
        reconciler.reconcile_slice("edge-slice-2").await.unwrap();
        let slice = get_slice(&cluster, "edge-slice-2").await;
        assert_eq!(slice.status.state, SliceState::Failure);
        assert_eq!(slice.status.message, MESSAGE_NO_RESOURCES);
    }
}
