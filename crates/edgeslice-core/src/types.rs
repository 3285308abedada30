use crate::{EdgesliceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// GroupVersionKind uniquely identifies a resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group (e.g., "", "core.edgenet.io")
    pub group: String,
    /// API version (e.g., "v1", "v1alpha1")
    pub version: String,
    /// Resource kind (e.g., "Node", "Slice")
    pub kind: String,
}

impl GroupVersionKind {
    /// Create a new GVK
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Create a GVK from apiVersion and kind
    /// apiVersion format: "v1" or "group/version"
    pub fn from_api_version_kind(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };

        Self {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    /// Get the apiVersion string (group/version or just version)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// ResourceKey uniquely identifies a specific resource instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// GroupVersionKind of the resource
    pub gvk: GroupVersionKind,
    /// Namespace (empty for cluster-scoped resources)
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceKey {
    /// Create a new ResourceKey
    pub fn new(gvk: GroupVersionKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a cluster-scoped ResourceKey
    pub fn cluster_scoped(gvk: GroupVersionKind, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Check if this is a namespaced resource
    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }

    /// Namespace as an option, `None` for cluster-scoped keys
    pub fn namespace(&self) -> Option<&str> {
        if self.is_namespaced() {
            Some(&self.namespace)
        } else {
            None
        }
    }

    /// Get the storage key encoding: {api_version}/{kind}/{namespace}/{name}
    /// For cluster-scoped: {api_version}/{kind}/{name}
    pub fn storage_key(&self) -> String {
        let api_version = self.gvk.api_version();
        if self.is_namespaced() {
            format!("{}/{}/{}/{}", api_version, self.gvk.kind, self.namespace, self.name)
        } else {
            format!("{}/{}/{}", api_version, self.gvk.kind, self.name)
        }
    }

    /// Work queue key: bare name for cluster-scoped, `namespace/name` otherwise
    pub fn queue_key(&self) -> String {
        queue_key(self.namespace(), &self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_namespaced() {
            write!(f, "{}/{}/{}", self.gvk, self.namespace, self.name)
        } else {
            write!(f, "{}/{}", self.gvk, self.name)
        }
    }
}

/// Build a work queue key from an optional namespace and a name
pub fn queue_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split a work queue key into namespace and name
pub fn split_queue_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(ns), name)),
        _ => Err(EdgesliceError::invalid_key(key)),
    }
}
