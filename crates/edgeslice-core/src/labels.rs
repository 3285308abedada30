//! The three-label protocol that records which slice holds a node.

use crate::{EdgesliceError, Result};
use json_patch::Patch;
use serde_json::json;
use std::collections::BTreeMap;

/// Whether a node is shared (`public`) or dedicated to a slice (`private`)
pub const ACCESS_LABEL: &str = "edge-net.io/access";
/// Slice a node has been provisioned to, or `none`
pub const SLICE_LABEL: &str = "edge-net.io/slice";
/// Slice a node has been reserved for, or `none`
pub const PRE_RESERVATION_LABEL: &str = "edge-net.io/pre-reservation";
/// Namespace label naming the parent kind, used to find `<kind>-quota`
pub const NAMESPACE_KIND_LABEL: &str = "edge-net.io/kind";

pub const ACCESS_PUBLIC: &str = "public";
pub const ACCESS_PRIVATE: &str = "private";
pub const NONE: &str = "none";

/// Every label the reservation protocol writes
pub const PROTOCOL_LABELS: [&str; 3] = [ACCESS_LABEL, SLICE_LABEL, PRE_RESERVATION_LABEL];

/// The label state a node is patched into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLabelState {
    /// `public / none / none`: free for any slice
    Unassigned,
    /// `public / none / <slice>`: held for a slice that is not provisioned yet
    Reserved(String),
    /// `private / <slice> / <slice>`: dedicated to a slice
    Provisioned(String),
}

impl NodeLabelState {
    pub fn access(&self) -> &str {
        match self {
            Self::Unassigned | Self::Reserved(_) => ACCESS_PUBLIC,
            Self::Provisioned(_) => ACCESS_PRIVATE,
        }
    }

    pub fn slice(&self) -> &str {
        match self {
            Self::Unassigned | Self::Reserved(_) => NONE,
            Self::Provisioned(slice) => slice,
        }
    }

    pub fn pre_reservation(&self) -> &str {
        match self {
            Self::Unassigned => NONE,
            Self::Reserved(slice) | Self::Provisioned(slice) => slice,
        }
    }

    /// The three protocol labels with their values
    pub fn labels(&self) -> BTreeMap<String, String> {
        [
            (ACCESS_LABEL, self.access()),
            (SLICE_LABEL, self.slice()),
            (PRE_RESERVATION_LABEL, self.pre_reservation()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    /// JSON Patch writing all three labels at once
    pub fn json_patch(&self) -> Result<Patch> {
        let ops: Vec<serde_json::Value> = self
            .labels()
            .into_iter()
            .map(|(key, value)| {
                json!({
                    "op": "add",
                    "path": format!("/metadata/labels/{}", escape_pointer(&key)),
                    "value": value,
                })
            })
            .collect();

        serde_json::from_value(serde_json::Value::Array(ops)).map_err(|e| {
            EdgesliceError::serialization_error(
                format!("Failed to build node label patch: {}", e),
                Some(Box::new(e)),
            )
        })
    }
}

/// Escape a JSON pointer reference token (RFC 6901)
pub fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Label selector for nodes in the given state, e.g. nodes reserved for a slice
pub fn selector_for(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(labels: &BTreeMap<String, String>, state: &NodeLabelState) -> BTreeMap<String, String> {
        let mut doc = json!({"metadata": {"labels": labels}});
        json_patch::patch(&mut doc, &state.json_patch().unwrap()).unwrap();
        serde_json::from_value(doc["metadata"]["labels"].clone()).unwrap()
    }

    #[test]
    fn test_label_values() {
        let reserved = NodeLabelState::Reserved("edge-slice-1".to_string());
        assert_eq!(reserved.access(), "public");
        assert_eq!(reserved.slice(), "none");
        assert_eq!(reserved.pre_reservation(), "edge-slice-1");

        let provisioned = NodeLabelState::Provisioned("edge-slice-1".to_string());
        assert_eq!(provisioned.access(), "private");
        assert_eq!(provisioned.slice(), "edge-slice-1");
        assert_eq!(provisioned.pre_reservation(), "edge-slice-1");
    }

    #[test]
    fn test_patch_paths_are_escaped() {
        let patch = serde_json::to_value(NodeLabelState::Unassigned.json_patch().unwrap()).unwrap();
        let paths: Vec<&str> = patch
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap())
            .collect();
        assert!(paths.contains(&"/metadata/labels/edge-net.io~1access"));
        assert!(paths.contains(&"/metadata/labels/edge-net.io~1pre-reservation"));
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn test_reserve_then_release_round_trip() {
        let mut labels = BTreeMap::new();
        labels.insert("kubernetes.io/hostname".to_string(), "node-1".to_string());
        let original = apply(&labels, &NodeLabelState::Unassigned);

        let reserved = apply(&original, &NodeLabelState::Reserved("edge-slice-1".to_string()));
        assert_eq!(reserved[PRE_RESERVATION_LABEL], "edge-slice-1");

        let released = apply(&reserved, &NodeLabelState::Unassigned);
        assert_eq!(released, original);
        assert_eq!(released[ACCESS_LABEL], "public");
        assert_eq!(released[SLICE_LABEL], "none");
        assert_eq!(released[PRE_RESERVATION_LABEL], "none");
        assert_eq!(released["kubernetes.io/hostname"], "node-1");
    }
}
