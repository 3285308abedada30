use crate::encoding::{KeyEncoder, REVISION_KEY};
use crate::{KVStore, RedbBackend, Result, StorageError, Transaction};
use edgeslice_core::{Resource, ResourceEvent, ResourceKey, Selector};
use json_patch::Patch;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the broadcast channel
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Filters applied when listing
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub label_selector: Option<Selector>,
    pub field_selector: Option<Selector>,
}

impl ListParams {
    pub fn labels(selector: Selector) -> Self {
        Self {
            label_selector: Some(selector),
            field_selector: None,
        }
    }

    pub fn fields(selector: Selector) -> Self {
        Self {
            label_selector: None,
            field_selector: Some(selector),
        }
    }

    fn matches<T: Resource>(&self, resource: &T) -> bool {
        let labels_ok = self
            .label_selector
            .as_ref()
            .is_none_or(|s| s.matches(&resource.labels()));
        let fields_ok = self
            .field_selector
            .as_ref()
            .is_none_or(|s| s.matches(&resource.field_set()));
        labels_ok && fields_ok
    }
}

/// Typed object store over a [`KVStore`]
///
/// Objects are stored as JSON. Every committed mutation takes the next value
/// of a store-wide revision counter as its `resourceVersion` and is then
/// published on a broadcast channel.
pub struct ResourceStore {
    backend: Arc<dyn KVStore>,
    event_tx: broadcast::Sender<ResourceEvent>,
}

impl ResourceStore {
    pub fn new(backend: Arc<dyn KVStore>) -> Self {
        Self::with_config(backend, EventBusConfig::default())
    }

    pub fn with_config(backend: Arc<dyn KVStore>, config: EventBusConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.capacity);
        Self { backend, event_tx }
    }

    /// Open a redb-backed store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Arc::new(RedbBackend::new(path)?)))
    }

    /// Subscribe to committed mutations of every kind
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    pub fn get<T: Resource>(&self, namespace: Option<&str>, name: &str) -> Result<T> {
        let key = KeyEncoder::key_for::<T>(namespace, name);
        let data = self
            .backend
            .get(KeyEncoder::encode_resource_key(&key).as_bytes())?
            .ok_or_else(|| StorageError::not_found(key.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn list<T: Resource>(&self, namespace: Option<&str>, params: &ListParams) -> Result<Vec<T>> {
        let prefix = KeyEncoder::prefix_for::<T>(namespace);
        let mut resources = Vec::new();
        for (_key, data) in self.backend.scan(prefix.as_bytes())? {
            let resource: T = serde_json::from_slice(&data)?;
            if params.matches(&resource) {
                resources.push(resource);
            }
        }
        debug!("Listed {} {} objects under {}", resources.len(), T::KIND, prefix);
        Ok(resources)
    }

    /// Create a new object; fails with AlreadyExists if the name is taken
    pub fn create<T: Resource>(&self, resource: &T) -> Result<T> {
        let mut resource = resource.clone();
        if !T::NAMESPACED {
            resource.metadata_mut().namespace = None;
        }
        let key = validated_key(&resource)?;
        let storage_key = KeyEncoder::encode_resource_key(&key);

        let mut txn = self.backend.transaction()?;
        if txn.get(storage_key.as_bytes())?.is_some() {
            return Err(StorageError::already_exists(key.to_string()));
        }
        let revision = next_revision(&mut *txn)?;

        let metadata = resource.metadata_mut();
        metadata.uid = Some(Uuid::new_v4().to_string());
        metadata.resource_version = Some(revision.clone());

        let object = serde_json::to_value(&resource)?;
        txn.put(storage_key.as_bytes(), &serde_json::to_vec(&object)?)?;
        txn.commit()?;

        info!("Created {} at revision {}", key, revision);
        self.publish(ResourceEvent::added(key, object, revision));
        Ok(resource)
    }

    /// Replace an object, keeping its stored status and UID
    ///
    /// A caller-supplied `resourceVersion` must match the stored one.
    pub fn update<T: Resource>(&self, resource: &T) -> Result<T> {
        let key = validated_key(resource)?;
        let storage_key = KeyEncoder::encode_resource_key(&key);

        let mut txn = self.backend.transaction()?;
        let existing = read_object(&*txn, &key, &storage_key)?;
        let current_version = resource_version_of(&existing);
        if let Some(expected) = resource.resource_version() {
            if expected != current_version {
                return Err(StorageError::conflict(key.to_string(), expected, current_version));
            }
        }

        let mut object = serde_json::to_value(resource)?;
        match existing.get("status") {
            Some(status) => object["status"] = status.clone(),
            None => {
                if let Some(map) = object.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        object["metadata"]["uid"] = existing["metadata"]["uid"].clone();

        let revision = next_revision(&mut *txn)?;
        object["metadata"]["resourceVersion"] = Value::String(revision.clone());
        let updated: T = serde_json::from_value(object.clone())?;
        txn.put(storage_key.as_bytes(), &serde_json::to_vec(&object)?)?;
        txn.commit()?;

        info!("Updated {} at revision {}", key, revision);
        self.publish(ResourceEvent::modified(key, object, revision));
        Ok(updated)
    }

    /// Replace only the status of an object
    pub fn update_status<T: Resource>(&self, resource: &T) -> Result<T> {
        let key = resource
            .resource_key()
            .map_err(|e| StorageError::invalid_resource(e.to_string()))?;
        let storage_key = KeyEncoder::encode_resource_key(&key);

        let mut txn = self.backend.transaction()?;
        let mut object = read_object(&*txn, &key, &storage_key)?;
        let incoming = serde_json::to_value(resource)?;
        match incoming.get("status") {
            Some(status) => object["status"] = status.clone(),
            None => {
                if let Some(map) = object.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        let revision = next_revision(&mut *txn)?;
        object["metadata"]["resourceVersion"] = Value::String(revision.clone());
        let updated: T = serde_json::from_value(object.clone())?;
        txn.put(storage_key.as_bytes(), &serde_json::to_vec(&object)?)?;
        txn.commit()?;

        debug!("Updated status of {} at revision {}", key, revision);
        self.publish(ResourceEvent::modified(key, object, revision));
        Ok(updated)
    }

    /// Apply an RFC 6902 JSON Patch in one transaction
    pub fn patch<T: Resource>(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> Result<T> {
        let key = KeyEncoder::key_for::<T>(namespace, name);
        let storage_key = KeyEncoder::encode_resource_key(&key);

        let mut txn = self.backend.transaction()?;
        let mut object = read_object(&*txn, &key, &storage_key)?;
        // Label patches address /metadata/labels/<key>, whose parent must exist
        if object["metadata"].get("labels").is_none_or(Value::is_null) {
            object["metadata"]["labels"] = Value::Object(Default::default());
        }
        json_patch::patch(&mut object, patch)
            .map_err(|e| StorageError::patch_failed(key.to_string(), e.to_string()))?;

        let revision = next_revision(&mut *txn)?;
        object["metadata"]["resourceVersion"] = Value::String(revision.clone());
        let patched: T = serde_json::from_value(object.clone())?;
        txn.put(storage_key.as_bytes(), &serde_json::to_vec(&object)?)?;
        txn.commit()?;

        debug!("Patched {} at revision {}", key, revision);
        self.publish(ResourceEvent::modified(key, object, revision));
        Ok(patched)
    }

    /// Delete an object, returning its last state
    pub fn delete<T: Resource>(&self, namespace: Option<&str>, name: &str) -> Result<T> {
        let key = KeyEncoder::key_for::<T>(namespace, name);
        let storage_key = KeyEncoder::encode_resource_key(&key);

        let mut txn = self.backend.transaction()?;
        let object = read_object(&*txn, &key, &storage_key)?;
        let deleted: T = serde_json::from_value(object.clone())?;
        txn.delete(storage_key.as_bytes())?;
        let revision = next_revision(&mut *txn)?;
        txn.commit()?;

        info!("Deleted {} at revision {}", key, revision);
        self.publish(ResourceEvent::deleted(key, object, revision));
        Ok(deleted)
    }

    fn publish(&self, event: ResourceEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

fn validated_key<T: Resource>(resource: &T) -> Result<ResourceKey> {
    resource
        .validate()
        .map_err(|e| StorageError::invalid_resource(e.to_string()))?;
    resource
        .resource_key()
        .map_err(|e| StorageError::invalid_resource(e.to_string()))
}

fn read_object(txn: &dyn Transaction, key: &ResourceKey, storage_key: &str) -> Result<Value> {
    let data = txn
        .get(storage_key.as_bytes())?
        .ok_or_else(|| StorageError::not_found(key.to_string()))?;
    Ok(serde_json::from_slice(&data)?)
}

fn resource_version_of(object: &Value) -> String {
    object["metadata"]["resourceVersion"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn next_revision(txn: &mut dyn Transaction) -> Result<String> {
    let current = match txn.get(REVISION_KEY)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                StorageError::database_error("Corrupt revision counter", None)
            })?;
            u64::from_be_bytes(raw)
        }
        None => 0,
    };
    let next = current + 1;
    txn.put(REVISION_KEY, &next.to_be_bytes())?;
    Ok(next.to_string())
}
