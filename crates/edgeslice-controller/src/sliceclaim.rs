//! SliceClaim reconciler: quota admission, slice acquisition and the hand-off
//! to an established SubNamespace

use crate::clients::Clients;
use crate::driver::Reconciler;
use crate::error::{ControllerError, Result};
use crate::recorder::{EventRecorder, EventType};
use async_trait::async_trait;
use edgeslice_core::labels::{ACCESS_LABEL, ACCESS_PUBLIC, NAMESPACE_KIND_LABEL, PRE_RESERVATION_LABEL};
use edgeslice_core::{
    controller_of, object_reference, owner_reference, split_queue_key, Namespace, ParsedQuantity,
    Requirement, Resource, ResourceQuota, ResourceTotals, Selector, Slice, SliceClaim,
    SliceClaimState, SliceNodeSelector, SliceSpec, SliceState,
};
use edgeslice_store::ListParams;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const MESSAGE_QUOTA_CHECKED: &str = "The parent has sufficient quota";
pub const MESSAGE_QUOTA_SHORTAGE: &str = "Insufficient quota at the parent";
pub const MESSAGE_CLAIMED: &str = "Slice claimed successfully";
pub const MESSAGE_PENDING: &str = "Waiting for the slice";
pub const MESSAGE_ALREADY_BOUND: &str = "Slice is bound to another claim already";
pub const MESSAGE_BINDING_FAILED: &str = "Slice binding failed";
pub const MESSAGE_CREATION_FAILED: &str = "Slice creation failed";
pub const MESSAGE_APPLIED: &str = "Slice claim has applied successfully";
pub const MESSAGE_BOUND: &str = "Slice is bound successfully";

pub const REASON_CHECKED: &str = "Checked";
pub const REASON_SHORTAGE: &str = "Shortage";
pub const REASON_CLAIMED: &str = "Slice Claimed";
pub const REASON_BOUND: &str = "Bound";
pub const REASON_APPLIED: &str = "Applied";
pub const REASON_ALREADY_BOUND: &str = "Already Bound";
pub const REASON_BINDING_FAILED: &str = "Binding Failed";
pub const REASON_CREATION_FAILED: &str = "Creation Failed";
pub const REASON_NOT_BOUND: &str = "Not Bound";

/// How a claim for a missing slice is served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// Create the slice on behalf of the claim
    #[default]
    Dynamic,
    /// Wait for an administrator to create it
    Manual,
}

impl FromStr for ProvisioningMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dynamic" => Ok(Self::Dynamic),
            "manual" => Ok(Self::Manual),
            other => Err(format!(
                "unknown provisioning mode '{}', expected Dynamic or Manual",
                other
            )),
        }
    }
}

impl fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic => f.write_str("Dynamic"),
            Self::Manual => f.write_str("Manual"),
        }
    }
}

/// Configuration for the slice claim reconciler
#[derive(Debug, Clone, Default)]
pub struct SliceClaimReconcilerConfig {
    pub provisioning: ProvisioningMode,
}

/// Whether `limits × count` fits under every hard ceiling of `quota`
///
/// Only resources named in both the demand and the quota are compared, and
/// only against the ceiling itself; what other claims already use is not
/// subtracted. Unparsable values count as a shortage.
pub fn sufficient_quota(selector: &SliceNodeSelector, quota: &ResourceQuota) -> bool {
    let limits = match &selector.resources.limits {
        Some(list) => match ResourceTotals::from_resource_list(list) {
            Ok(totals) => totals,
            Err(e) => {
                warn!("Unusable claim limits: {}", e);
                return false;
            }
        },
        None => return true,
    };
    let demand = limits.scaled(selector.count);
    let Some(hard) = quota.spec.as_ref().and_then(|s| s.hard.as_ref()) else {
        return true;
    };

    for (key, wanted) in demand.iter() {
        let Some(ceiling) = hard.get(key) else {
            continue;
        };
        match ParsedQuantity::from_quantity(ceiling) {
            Ok(ceiling) if ceiling >= *wanted => {}
            Ok(ceiling) => {
                debug!("Quota shortage for {}: demand {}, hard {}", key, wanted, ceiling);
                return false;
            }
            Err(e) => {
                warn!("Unusable quota value for {}: {}", key, e);
                return false;
            }
        }
    }
    true
}

pub struct SliceClaimReconciler {
    clients: Clients,
    recorder: EventRecorder,
    config: SliceClaimReconcilerConfig,
}

impl SliceClaimReconciler {
    pub fn new(clients: Clients, config: SliceClaimReconcilerConfig) -> Self {
        let recorder = EventRecorder::new("sliceclaim-controller", clients.events.clone());
        Self {
            clients,
            recorder,
            config,
        }
    }

    /// Reconcile the claim `namespace/name`
    pub async fn reconcile_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut claim: SliceClaim = match self.clients.slice_claims.get(Some(namespace), name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                debug!("SliceClaim {}/{} no longer exists", namespace, name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let parent: Namespace = match self.clients.namespaces.get(None, namespace).await {
            Ok(ns) => ns,
            Err(e) if e.is_not_found() => {
                info!("Namespace {} of claim {} not found, skipping", namespace, name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let observed = claim.status.clone();

        let result = self.process(&mut claim, &parent).await;
        if claim.status != observed {
            self.clients.slice_claims.update_status(&claim).await?;
        }
        result
    }

    async fn process(&self, claim: &mut SliceClaim, parent: &Namespace) -> Result<()> {
        match claim.status.state {
            SliceClaimState::Bound | SliceClaimState::Applied => {
                let applied = self.tie_subnamespace_to_claim(claim).await?;
                if !applied {
                    self.set_status(
                        claim,
                        SliceClaimState::Bound,
                        MESSAGE_BOUND,
                        EventType::Normal,
                        REASON_BOUND,
                        MESSAGE_BOUND,
                    )
                    .await;
                }
                Ok(())
            }
            _ => {
                if !self.check_parent_quota(claim, parent).await {
                    return Ok(());
                }
                self.claim_slice(claim).await
            }
        }
    }

    /// Admission against the `<kind>-quota` object of the claim's namespace.
    /// Admission is skipped when the namespace declares no kind or the quota
    /// cannot be read.
    async fn check_parent_quota(&self, claim: &mut SliceClaim, parent: &Namespace) -> bool {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let Some(kind) = parent.labels().get(NAMESPACE_KIND_LABEL).cloned() else {
            debug!("Namespace {} declares no kind, skipping quota check", namespace);
            return true;
        };
        let quota_name = format!("{}-quota", kind);
        let quota = match self
            .clients
            .resource_quotas
            .get(Some(&namespace), &quota_name)
            .await
        {
            Ok(quota) => quota,
            Err(e) => {
                debug!("Quota {}/{} unavailable, skipping check: {}", namespace, quota_name, e);
                return true;
            }
        };

        if !sufficient_quota(&claim.spec.node_selector, &quota) {
            self.set_status(
                claim,
                SliceClaimState::Failure,
                MESSAGE_QUOTA_SHORTAGE,
                EventType::Warning,
                REASON_SHORTAGE,
                MESSAGE_QUOTA_SHORTAGE,
            )
            .await;
            return false;
        }
        if matches!(claim.status.state, SliceClaimState::Unset | SliceClaimState::Failure) {
            self.recorder
                .normal(&*claim, REASON_CHECKED, MESSAGE_QUOTA_CHECKED)
                .await;
        }
        true
    }

    /// Bind to the named slice, creating it in dynamic mode
    async fn claim_slice(&self, claim: &mut SliceClaim) -> Result<()> {
        let slice_name = claim.spec.slice_name.clone();
        match self.clients.slices.get(None, &slice_name).await {
            Ok(slice) => self.tie_claim_to_slice(claim, slice).await,
            Err(e) if e.is_not_found() => match self.config.provisioning {
                ProvisioningMode::Dynamic => self.create_slice(claim).await,
                ProvisioningMode::Manual => {
                    self.set_status(
                        claim,
                        SliceClaimState::Pending,
                        MESSAGE_PENDING,
                        EventType::Warning,
                        REASON_NOT_BOUND,
                        MESSAGE_PENDING,
                    )
                    .await;
                    Ok(())
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn create_slice(&self, claim: &mut SliceClaim) -> Result<()> {
        let mut slice = Slice::new(
            claim.spec.slice_name.clone(),
            SliceSpec {
                slice_class_name: claim.spec.slice_class_name.clone(),
                node_selector: claim.spec.node_selector.clone(),
                claim_ref: Some(object_reference(&*claim)),
            },
        );
        slice.status.expiry = claim.spec.slice_expiry.clone();

        match self.clients.slices.create(&slice).await {
            Ok(created) => {
                info!("Created slice {} for claim {}", created.name(), claim.name());
                self.set_status(
                    claim,
                    SliceClaimState::Requested,
                    MESSAGE_PENDING,
                    EventType::Normal,
                    REASON_CLAIMED,
                    MESSAGE_CLAIMED,
                )
                .await;
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                // Someone else created it first
                let existing = self.clients.slices.get(None, slice.name()).await?;
                self.tie_claim_to_slice(claim, existing).await
            }
            Err(e) => {
                warn!("Failed to create slice {}: {}", slice.name(), e);
                self.set_status(
                    claim,
                    SliceClaimState::Failure,
                    MESSAGE_CREATION_FAILED,
                    EventType::Warning,
                    REASON_CREATION_FAILED,
                    MESSAGE_CREATION_FAILED,
                )
                .await;
                Ok(())
            }
        }
    }

    /// Attach the claim to an existing slice
    async fn tie_claim_to_slice(&self, claim: &mut SliceClaim, slice: Slice) -> Result<()> {
        if slice.status.state == SliceState::Failure {
            self.binding_failed(claim).await;
            return Ok(());
        }

        if let Some(reference) = &slice.spec.claim_ref {
            if !claim.is_referenced_by(reference) {
                self.set_status(
                    claim,
                    SliceClaimState::Failure,
                    MESSAGE_ALREADY_BOUND,
                    EventType::Warning,
                    REASON_ALREADY_BOUND,
                    MESSAGE_ALREADY_BOUND,
                )
                .await;
            } else if slice.status.state.is_bound() {
                self.set_status(
                    claim,
                    SliceClaimState::Bound,
                    MESSAGE_BOUND,
                    EventType::Normal,
                    REASON_BOUND,
                    MESSAGE_BOUND,
                )
                .await;
            } else {
                // Ours, but the slice has not reserved and bound yet
                self.set_status(
                    claim,
                    SliceClaimState::Requested,
                    MESSAGE_PENDING,
                    EventType::Normal,
                    REASON_CLAIMED,
                    MESSAGE_CLAIMED,
                )
                .await;
            }
            return Ok(());
        }

        let compatible = slice.status.state == SliceState::Reserved
            && slice.spec.slice_class_name == claim.spec.slice_class_name
            && slice.spec.node_selector == claim.spec.node_selector;
        if !compatible {
            debug!(
                "Slice {} ({}) does not match claim {}",
                slice.name(),
                slice.status.state,
                claim.name()
            );
            self.binding_failed(claim).await;
            return Ok(());
        }

        let mut slice = slice;
        slice.spec.claim_ref = Some(object_reference(&*claim));
        match self.clients.slices.update(&slice).await {
            Ok(_) => {
                self.set_status(
                    claim,
                    SliceClaimState::Requested,
                    MESSAGE_PENDING,
                    EventType::Normal,
                    REASON_CLAIMED,
                    MESSAGE_CLAIMED,
                )
                .await;
            }
            Err(e) => {
                warn!("Failed to set claimRef on slice {}: {}", slice.name(), e);
                self.binding_failed(claim).await;
            }
        }
        Ok(())
    }

    async fn binding_failed(&self, claim: &mut SliceClaim) {
        self.set_status(
            claim,
            SliceClaimState::Failure,
            MESSAGE_BINDING_FAILED,
            EventType::Warning,
            REASON_BINDING_FAILED,
            MESSAGE_BINDING_FAILED,
        )
        .await;
    }

    /// Hand the claim to the SubNamespace that consumes it. Returns whether
    /// the claim is applied.
    async fn tie_subnamespace_to_claim(&self, claim: &mut SliceClaim) -> Result<bool> {
        // The capacity summary needs the slice's nodes reserved and bound
        match self.clients.slices.get(None, &claim.spec.slice_name).await {
            Ok(slice) if slice.status.state.is_bound() => {}
            Ok(slice) => {
                debug!(
                    "Slice {} is {}, holding claim {} back from its SubNamespace",
                    slice.name(),
                    slice.status.state,
                    claim.name()
                );
                return Ok(false);
            }
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let sub_namespaces = self
            .clients
            .sub_namespaces
            .list(Some(&namespace), &ListParams::default())
            .await?;

        for mut sub_namespace in sub_namespaces {
            if sub_namespace.slice_claim() != Some(claim.name()) {
                continue;
            }

            let owned = controller_of(&sub_namespace.metadata).is_some_and(|owner| {
                owner.kind == SliceClaim::KIND
                    && owner.name == claim.name()
                    && Some(owner.uid.as_str()) == claim.uid()
            });
            if owned {
                self.mark_applied(claim).await;
                return Ok(true);
            }

            if sub_namespace.is_established() {
                let allocation = self.reserved_capacity(&claim.spec.slice_name).await?;
                sub_namespace.metadata.owner_references = Some(vec![owner_reference(&*claim)]);
                sub_namespace.spec.resource_allocation = Some(allocation.to_resource_list());
                self.clients.sub_namespaces.update(&sub_namespace).await?;
                info!(
                    "SubNamespace {}/{} now consumes claim {}",
                    namespace,
                    sub_namespace.name(),
                    claim.name()
                );
                self.mark_applied(claim).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_applied(&self, claim: &mut SliceClaim) {
        self.set_status(
            claim,
            SliceClaimState::Applied,
            MESSAGE_APPLIED,
            EventType::Normal,
            REASON_APPLIED,
            MESSAGE_APPLIED,
        )
        .await;
    }

    /// Summed capacity of the nodes reserved, but not yet provisioned, for
    /// `slice_name`
    async fn reserved_capacity(&self, slice_name: &str) -> Result<ResourceTotals> {
        let selector = Selector::new()
            .with(Requirement::equals(ACCESS_LABEL, ACCESS_PUBLIC))
            .with(Requirement::equals(PRE_RESERVATION_LABEL, slice_name));
        let nodes = self.clients.nodes.list(None, &ListParams::labels(selector)).await?;

        let mut totals = ResourceTotals::new();
        for node in &nodes {
            if let Some(capacity) = node.status.as_ref().and_then(|s| s.capacity.as_ref()) {
                totals.add_resource_list(capacity)?;
            }
        }
        Ok(totals)
    }

    /// Move the claim to `state`, recording an event on change
    async fn set_status(
        &self,
        claim: &mut SliceClaim,
        state: SliceClaimState,
        message: &str,
        event_type: EventType,
        reason: &str,
        event_message: &str,
    ) {
        if claim.status.state == state && claim.status.message == message {
            return;
        }
        claim.status.state = state;
        claim.status.message = message.to_string();
        self.recorder
            .record(&*claim, event_type, reason, event_message)
            .await;
    }
}

#[async_trait]
impl Reconciler for SliceClaimReconciler {
    fn name(&self) -> &str {
        "sliceclaim"
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        match split_queue_key(key)? {
            (Some(namespace), name) => self.reconcile_claim(namespace, name).await,
            (None, _) => Err(ControllerError::invalid_key(key)),
        }
    }
}
