use super::{Resource, ResourceError, EDGENET_API_VERSION};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{NodeSelector, ObjectReference, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node selection shared by Slices and SliceClaims: which nodes, how much of
/// each resource every node must offer, and how many nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceNodeSelector {
    #[serde(default)]
    pub selector: NodeSelector,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub count: usize,
}

/// Lifecycle state of a Slice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceState {
    /// Never reconciled
    #[default]
    #[serde(rename = "")]
    Unset,
    Reserved,
    Bound,
    Provisioned,
    Failure,
}

impl SliceState {
    /// States in which the slice already holds its nodes
    pub fn holds_nodes(&self) -> bool {
        matches!(self, Self::Reserved | Self::Bound | Self::Provisioned)
    }

    /// States reached once a claim has been bound to the slice
    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound | Self::Provisioned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Reserved => "Reserved",
            Self::Bound => "Bound",
            Self::Provisioned => "Provisioned",
            Self::Failure => "Failure",
        }
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceSpec {
    #[serde(default)]
    pub slice_class_name: String,
    #[serde(default)]
    pub node_selector: SliceNodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceStatus {
    #[serde(default)]
    pub state: SliceState,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Time>,
}

impl SliceStatus {
    /// Whether the expiry is set and not after `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.as_ref().is_some_and(|t| t.0 <= now)
    }
}

/// A cluster-scoped reservation of a fixed number of nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SliceSpec,
    #[serde(default)]
    pub status: SliceStatus,
}

impl Slice {
    pub fn new(name: impl Into<String>, spec: SliceSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec,
            status: SliceStatus::default(),
        }
    }
}

impl Resource for Slice {
    const API_VERSION: &'static str = EDGENET_API_VERSION;
    const KIND: &'static str = "Slice";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        super::validate_base(&self.metadata)?;
        if self.spec.node_selector.count == 0 {
            return Err(ResourceError::ValidationFailed(
                "spec.nodeSelector.count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a SliceClaim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceClaimState {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Failure,
    Requested,
    Bound,
    Applied,
}

impl SliceClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Pending => "Pending",
            Self::Failure => "Failure",
            Self::Requested => "Requested",
            Self::Bound => "Bound",
            Self::Applied => "Applied",
        }
    }
}

impl fmt::Display for SliceClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceClaimSpec {
    #[serde(default)]
    pub slice_name: String,
    #[serde(default)]
    pub slice_class_name: String,
    #[serde(default)]
    pub node_selector: SliceNodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_expiry: Option<Time>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceClaimStatus {
    #[serde(default)]
    pub state: SliceClaimState,
    #[serde(default)]
    pub message: String,
}

/// A tenant's namespaced request for a Slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceClaim {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SliceClaimSpec,
    #[serde(default)]
    pub status: SliceClaimStatus,
}

impl SliceClaim {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: SliceClaimSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
            status: SliceClaimStatus::default(),
        }
    }

    /// Whether `reference` points at this exact claim instance
    pub fn is_referenced_by(&self, reference: &ObjectReference) -> bool {
        reference.namespace == self.metadata.namespace
            && reference.name == self.metadata.name
            && reference.uid == self.metadata.uid
    }
}

impl Resource for SliceClaim {
    const API_VERSION: &'static str = EDGENET_API_VERSION;
    const KIND: &'static str = "SliceClaim";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Controller owner reference pointing at `owner`
pub fn owner_reference<T: Resource>(owner: &T) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version(),
        kind: owner.kind(),
        name: owner.name().to_string(),
        uid: owner.uid().unwrap_or_default().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Object reference pointing at `object`
pub fn object_reference<T: Resource>(object: &T) -> ObjectReference {
    ObjectReference {
        api_version: Some(object.api_version()),
        kind: Some(object.kind()),
        name: object.metadata().name.clone(),
        namespace: object.metadata().namespace.clone(),
        uid: object.metadata().uid.clone(),
        ..Default::default()
    }
}

/// The owner reference flagged as controller, if any
pub fn controller_of(metadata: &ObjectMeta) -> Option<&OwnerReference> {
    metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slice_deserializes_camel_case() {
        let slice: Slice = serde_json::from_value(json!({
            "metadata": {"name": "edge-slice-1"},
            "spec": {
                "sliceClassName": "Medium",
                "nodeSelector": {
                    "selector": {"nodeSelectorTerms": [
                        {"matchExpressions": [{"key": "edge-net.io/city", "operator": "In", "values": ["paris"]}]}
                    ]},
                    "resources": {"limits": {"cpu": "2"}},
                    "count": 2
                }
            }
        }))
        .unwrap();

        assert_eq!(slice.spec.slice_class_name, "Medium");
        assert_eq!(slice.spec.node_selector.count, 2);
        assert_eq!(slice.status.state, SliceState::Unset);
        assert!(slice.spec.claim_ref.is_none());
        assert!(slice.validate().is_ok());
    }

    #[test]
    fn test_state_vocabulary() {
        assert_eq!(serde_json::to_value(SliceState::Unset).unwrap(), json!(""));
        assert_eq!(
            serde_json::to_value(SliceState::Provisioned).unwrap(),
            json!("Provisioned")
        );
        assert_eq!(
            serde_json::from_value::<SliceClaimState>(json!("Applied")).unwrap(),
            SliceClaimState::Applied
        );
        assert!(SliceState::Bound.holds_nodes());
        assert!(!SliceState::Failure.holds_nodes());
        assert!(SliceState::Provisioned.is_bound());
        assert!(!SliceState::Reserved.is_bound());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut status = SliceStatus::default();
        assert!(!status.is_expired(now));

        status.expiry = Some(Time(now - chrono::Duration::seconds(1)));
        assert!(status.is_expired(now));

        status.expiry = Some(Time(now + chrono::Duration::hours(1)));
        assert!(!status.is_expired(now));
    }

    #[test]
    fn test_claim_reference_identity() {
        let mut claim = SliceClaim::new("lab-a", "claim-1", SliceClaimSpec::default());
        claim.metadata.uid = Some("uid-1".to_string());
        let reference = object_reference(&claim);
        assert_eq!(reference.kind.as_deref(), Some("SliceClaim"));
        assert!(claim.is_referenced_by(&reference));

        let mut recreated = claim.clone();
        recreated.metadata.uid = Some("uid-2".to_string());
        assert!(!recreated.is_referenced_by(&reference));
    }

    #[test]
    fn test_controller_owner() {
        let mut slice = Slice::new("edge-slice-1", SliceSpec::default());
        slice.metadata.uid = Some("slice-uid".to_string());
        let mut claim = SliceClaim::new("lab-a", "claim-1", SliceClaimSpec::default());
        assert!(controller_of(&claim.metadata).is_none());

        claim.metadata.owner_references = Some(vec![owner_reference(&slice)]);
        let owner = controller_of(&claim.metadata).unwrap();
        assert_eq!(owner.kind, "Slice");
        assert_eq!(owner.uid, "slice-uid");
        assert_eq!(owner.api_version, "core.edgenet.io/v1alpha1");
    }
}
