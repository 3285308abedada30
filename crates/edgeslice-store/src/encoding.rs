use edgeslice_core::{Resource, ResourceKey};

/// Key under which the store keeps its revision counter. Sorts apart from
/// every `{apiVersion}/{kind}/...` object key.
pub const REVISION_KEY: &[u8] = b"__meta/revision";

/// Key encoder for storage keys
pub struct KeyEncoder;

impl KeyEncoder {
    /// Encode a resource key: {api_version}/{kind}/{namespace}/{name}
    /// For cluster-scoped: {api_version}/{kind}/{name}
    pub fn encode_resource_key(key: &ResourceKey) -> String {
        key.storage_key()
    }

    /// Key of the object `name` of type `T`; the namespace is ignored for
    /// cluster-scoped kinds
    pub fn key_for<T: Resource>(namespace: Option<&str>, name: &str) -> ResourceKey {
        match namespace {
            Some(ns) if T::NAMESPACED && !ns.is_empty() => ResourceKey::new(T::type_gvk(), ns, name),
            _ => ResourceKey::cluster_scoped(T::type_gvk(), name),
        }
    }

    /// Encode a prefix for scanning resources of a kind, optionally within one namespace
    pub fn encode_prefix(api_version: &str, kind: &str, namespace: Option<&str>) -> String {
        if let Some(ns) = namespace {
            format!("{}/{}/{}/", api_version, kind, ns)
        } else {
            format!("{}/{}/", api_version, kind)
        }
    }

    /// Scan prefix for objects of type `T`
    pub fn prefix_for<T: Resource>(namespace: Option<&str>) -> String {
        let namespace = namespace.filter(|ns| T::NAMESPACED && !ns.is_empty());
        Self::encode_prefix(T::API_VERSION, T::KIND, namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeslice_core::{Node, Slice, SliceClaim};

    #[test]
    fn test_key_for() {
        let key = KeyEncoder::key_for::<SliceClaim>(Some("lab-a"), "claim-1");
        assert_eq!(
            KeyEncoder::encode_resource_key(&key),
            "core.edgenet.io/v1alpha1/SliceClaim/lab-a/claim-1"
        );

        let key = KeyEncoder::key_for::<Slice>(Some("ignored"), "edge-slice-1");
        assert_eq!(
            KeyEncoder::encode_resource_key(&key),
            "core.edgenet.io/v1alpha1/Slice/edge-slice-1"
        );
    }

    #[test]
    fn test_prefix_for() {
        assert_eq!(KeyEncoder::prefix_for::<Node>(None), "v1/Node/");
        assert_eq!(KeyEncoder::prefix_for::<Node>(Some("default")), "v1/Node/");
        assert_eq!(
            KeyEncoder::prefix_for::<SliceClaim>(Some("lab-a")),
            "core.edgenet.io/v1alpha1/SliceClaim/lab-a/"
        );
        assert_eq!(
            KeyEncoder::encode_prefix("v1", "Pod", Some("default")),
            "v1/Pod/default/"
        );
    }
}
