use crate::types::ResourceKey;
use crate::{EdgesliceError, Result};
use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A change to a stored object, published after the write commits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Type of watch event (ADDED, MODIFIED, DELETED)
    pub event_type: WatchEventType,
    /// Full resource key (gvk + namespace + name)
    pub resource_key: ResourceKey,
    /// The object after the change, or its last state for DELETED
    pub object: serde_json::Value,
    /// Resource version at the time of the event
    pub resource_version: String,
}

impl ResourceEvent {
    pub fn new(
        event_type: WatchEventType,
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self {
            event_type,
            resource_key,
            object,
            resource_version,
        }
    }

    /// Create an ADDED event
    pub fn added(resource_key: ResourceKey, object: serde_json::Value, resource_version: String) -> Self {
        Self::new(WatchEventType::Added, resource_key, object, resource_version)
    }

    /// Create a MODIFIED event
    pub fn modified(resource_key: ResourceKey, object: serde_json::Value, resource_version: String) -> Self {
        Self::new(WatchEventType::Modified, resource_key, object, resource_version)
    }

    /// Create a DELETED event
    pub fn deleted(resource_key: ResourceKey, object: serde_json::Value, resource_version: String) -> Self {
        Self::new(WatchEventType::Deleted, resource_key, object, resource_version)
    }

    /// Kind of the object the event is about
    pub fn kind(&self) -> &str {
        &self.resource_key.gvk.kind
    }

    /// Decode the carried object
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.object.clone()).map_err(|e| {
            EdgesliceError::serialization_error(
                format!("Failed to decode {} event object: {}", self.kind(), e),
                Some(Box::new(e)),
            )
        })
    }
}
