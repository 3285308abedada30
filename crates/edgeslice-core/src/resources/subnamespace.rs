use super::{Resource, EDGENET_API_VERSION};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status value of a SubNamespace whose child namespace is ready
pub const ESTABLISHED: &str = "Established";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubNamespaceSpec {
    /// Name of the SliceClaim in the same namespace this partition consumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_claim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_allocation: Option<BTreeMap<String, Quantity>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubNamespaceStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub message: String,
}

/// Namespace partition that can consume a SliceClaim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubNamespace {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SubNamespaceSpec,
    #[serde(default)]
    pub status: SubNamespaceStatus,
}

impl SubNamespace {
    pub fn is_established(&self) -> bool {
        self.status.state == ESTABLISHED
    }

    pub fn slice_claim(&self) -> Option<&str> {
        self.spec.slice_claim.as_deref()
    }
}

impl Resource for SubNamespace {
    const API_VERSION: &'static str = EDGENET_API_VERSION;
    const KIND: &'static str = "SubNamespace";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
