pub mod slice;
pub mod subnamespace;

pub use slice::{
    controller_of, object_reference, owner_reference, Slice, SliceClaim, SliceClaimSpec,
    SliceClaimState, SliceClaimStatus, SliceNodeSelector, SliceSpec, SliceState, SliceStatus,
};
pub use subnamespace::{SubNamespace, SubNamespaceSpec, SubNamespaceStatus};

use crate::{GroupVersionKind, ResourceKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group and version of the slicing resources
pub const EDGENET_API_VERSION: &str = "core.edgenet.io/v1alpha1";

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    if metadata.name.is_none() {
        return Err(ResourceError::MissingField("metadata.name".to_string()));
    }

    if let Some(name) = &metadata.name {
        if !is_valid_name(name) {
            return Err(ResourceError::InvalidName(name.clone()));
        }
    }

    Ok(())
}

/// Trait for Kubernetes-style resources handled by the store and reconcilers
pub trait Resource: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static {
    /// API version served for this type
    const API_VERSION: &'static str;
    /// Kind served for this type
    const KIND: &'static str;
    /// Whether objects of this type live inside a namespace
    const NAMESPACED: bool;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Get the API version of this resource
    fn api_version(&self) -> String {
        Self::API_VERSION.to_string()
    }

    /// Get the kind of this resource
    fn kind(&self) -> String {
        Self::KIND.to_string()
    }

    /// Get the GroupVersionKind of the type
    fn type_gvk() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind(Self::API_VERSION, Self::KIND)
    }

    /// Get the GroupVersionKind
    fn gvk(&self) -> GroupVersionKind {
        Self::type_gvk()
    }

    /// Name of the resource, empty when unset
    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Get the ResourceKey
    fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        let metadata = self.metadata();
        let name = metadata
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;

        if Self::NAMESPACED {
            let namespace = metadata
                .namespace
                .as_ref()
                .filter(|ns| !ns.is_empty())
                .ok_or_else(|| ResourceError::MissingField("metadata.namespace".to_string()))?;
            Ok(ResourceKey::new(self.gvk(), namespace, name))
        } else {
            Ok(ResourceKey::cluster_scoped(self.gvk(), name))
        }
    }

    /// Get the resource version
    fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    /// Get the UID
    fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    /// Labels of the object, empty when unset
    fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    /// Fields visible to a field selector
    fn field_set(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("metadata.name".to_string(), self.name().to_string());
        if let Some(ns) = &self.metadata().namespace {
            fields.insert("metadata.namespace".to_string(), ns.clone());
        }
        fields
    }

    /// Validate the resource
    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Validate a Kubernetes resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    // Must contain only lowercase alphanumeric, '-', or '.'
    // Must start and end with alphanumeric
    let chars: Vec<char> = name.chars().collect();

    if !chars[0].is_ascii_lowercase() && !chars[0].is_ascii_digit() {
        return false;
    }

    if !chars[chars.len() - 1].is_ascii_lowercase() && !chars[chars.len() - 1].is_ascii_digit() {
        return false;
    }

    chars
        .iter()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.')
}

// Implement Resource trait for the k8s-openapi types the controllers touch
use k8s_openapi::api::core::v1::{Event, Namespace, Node, Pod, ResourceQuota};

impl Resource for Pod {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Pod";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn field_set(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("metadata.name".to_string(), self.name().to_string());
        if let Some(ns) = &self.metadata.namespace {
            fields.insert("metadata.namespace".to_string(), ns.clone());
        }
        let node_name = self
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default();
        fields.insert("spec.nodeName".to_string(), node_name);
        fields
    }
}

impl Resource for Node {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Node";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for Namespace {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Namespace";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for ResourceQuota {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "ResourceQuota";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for Event {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Event";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
