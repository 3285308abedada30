//! Worker pools and watch routing for the reconcilers

use crate::clients::Clients;
use crate::error::{ControllerError, Result};
use crate::queue::WorkQueue;
use crate::slice::SliceReconciler;
use async_trait::async_trait;
use chrono::Utc;
use edgeslice_core::labels::{NONE, PRE_RESERVATION_LABEL, PROTOCOL_LABELS, SLICE_LABEL};
use edgeslice_core::{
    controller_of, queue_key, Node, Resource, ResourceEvent, Slice, SliceClaim, SubNamespace,
    WatchEventType,
};
use edgeslice_store::ListParams;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconciles the object named by a work queue key
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Bring the object named by `key` closer to its desired state
    async fn reconcile(&self, key: &str) -> Result<()>;
}

/// Configuration for a driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Number of concurrent workers
    pub workers: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

/// Pool of workers feeding keys from a queue to a reconciler
pub struct Driver {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    config: DriverConfig,
}

impl Driver {
    pub fn new(reconciler: Arc<dyn Reconciler>, queue: Arc<WorkQueue>, config: DriverConfig) -> Self {
        Self {
            reconciler,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run the workers until `token` is cancelled, then shut the queue down
    /// and wait for in-flight keys to finish
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let workers = self.config.workers.max(1);
        info!(
            "Starting {} controller with {} workers",
            self.reconciler.name(),
            workers
        );

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let reconciler = self.reconciler.clone();
                let queue = self.queue.clone();
                tokio::spawn(async move { work(id, reconciler, queue).await })
            })
            .collect();

        token.cancelled().await;
        info!("{} controller shutting down", self.reconciler.name());
        self.queue.shut_down();

        for handle in handles {
            handle.await.map_err(|e| {
                ControllerError::internal_error(format!(
                    "{} worker panicked: {}",
                    self.reconciler.name(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

async fn work(id: usize, reconciler: Arc<dyn Reconciler>, queue: Arc<WorkQueue>) {
    debug!("{} worker {} started", reconciler.name(), id);
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                error!(
                    controller = reconciler.name(),
                    key = %key,
                    requeues = queue.num_requeues(&key),
                    "Reconcile failed: {}",
                    e
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!("{} worker {} stopped", reconciler.name(), id);
}

/// Turns store events into work queue keys
///
/// Keeps the last seen state of Slices and Nodes so that updates can be
/// compared with what came before.
pub struct WatchRouter {
    clients: Clients,
    slice_queue: Arc<WorkQueue>,
    claim_queue: Arc<WorkQueue>,
    slices: Arc<SliceReconciler>,
    seen: Mutex<HashMap<String, serde_json::Value>>,
}

impl WatchRouter {
    pub fn new(
        clients: Clients,
        slice_queue: Arc<WorkQueue>,
        claim_queue: Arc<WorkQueue>,
        slices: Arc<SliceReconciler>,
    ) -> Self {
        Self {
            clients,
            slice_queue,
            claim_queue,
            slices,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Route events from `events` until `token` is cancelled
    pub async fn run(&self, mut events: broadcast::Receiver<ResourceEvent>, token: CancellationToken) -> Result<()> {
        info!("Starting watch router");
        self.resync().await?;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Watch router shutting down");
                    return Ok(());
                }
                received = events.recv() => match received {
                    Ok(event) => self.route(&event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Watch router lagged by {} events, resyncing", missed);
                        if let Err(e) = self.resync().await {
                            error!("Resync failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("Event bus closed, watch router stopping");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Queue every Slice and SliceClaim
    pub async fn resync(&self) -> Result<()> {
        let slices = self.clients.slices.list(None, &ListParams::default()).await?;
        let claims = self.clients.slice_claims.list(None, &ListParams::default()).await?;
        debug!("Resync queues {} slices and {} claims", slices.len(), claims.len());

        for slice in &slices {
            self.slice_queue.add(slice.name());
        }
        for claim in &claims {
            self.claim_queue
                .add(queue_key(claim.metadata.namespace.as_deref(), claim.name()));
        }
        Ok(())
    }

    /// Queue the keys affected by one event
    pub async fn route(&self, event: &ResourceEvent) {
        let kind = event.kind();
        let result = if kind == Slice::KIND {
            self.on_slice(event).await
        } else if kind == SliceClaim::KIND {
            self.on_claim(event)
        } else if kind == SubNamespace::KIND {
            self.on_sub_namespace(event)
        } else if kind == Node::KIND {
            self.on_node(event)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!("Failed to route {} event for {}: {}", event.kind(), event.resource_key, e);
        }
    }

    /// Record `event` and return the object it replaced
    fn remember<T: for<'de> serde::Deserialize<'de>>(&self, event: &ResourceEvent) -> Option<T> {
        let key = event.resource_key.to_string();
        let previous = if event.event_type == WatchEventType::Deleted {
            self.seen.lock().remove(&key)
        } else {
            self.seen.lock().insert(key, event.object.clone())
        };
        previous.and_then(|value| serde_json::from_value(value).ok())
    }

    async fn on_slice(&self, event: &ResourceEvent) -> Result<()> {
        let slice: Slice = event.decode()?;
        let previous: Option<Slice> = self.remember(event);

        if event.event_type == WatchEventType::Deleted {
            return self.slices.handle_delete(&slice).await;
        }

        self.slice_queue.add(slice.name());
        if let Some(expiry) = &slice.status.expiry {
            let known = previous.as_ref().and_then(|p| p.status.expiry.as_ref());
            if known != Some(expiry) {
                let delay = (expiry.0 - Utc::now()).to_std().unwrap_or_default();
                debug!("Slice {} expires in {:?}", slice.name(), delay);
                self.slice_queue.add_after(slice.name(), delay);
            }
        }
        Ok(())
    }

    fn on_claim(&self, event: &ResourceEvent) -> Result<()> {
        let claim: SliceClaim = event.decode()?;

        if event.event_type != WatchEventType::Deleted {
            self.claim_queue
                .add(queue_key(claim.metadata.namespace.as_deref(), claim.name()));
        }
        if let Some(owner) = controller_of(&claim.metadata).filter(|o| o.kind == Slice::KIND) {
            self.slice_queue.add(owner.name.clone());
        }
        Ok(())
    }

    fn on_sub_namespace(&self, event: &ResourceEvent) -> Result<()> {
        if event.event_type == WatchEventType::Deleted {
            return Ok(());
        }
        let sub_namespace: SubNamespace = event.decode()?;
        if let (true, Some(claim)) = (sub_namespace.is_established(), sub_namespace.slice_claim()) {
            self.claim_queue
                .add(queue_key(sub_namespace.metadata.namespace.as_deref(), claim));
        }
        Ok(())
    }

    fn on_node(&self, event: &ResourceEvent) -> Result<()> {
        let node: Node = event.decode()?;
        let previous: Option<Node> = self.remember(event);

        let current = node.labels();
        let before = previous.map(|p| p.labels()).unwrap_or_default();
        if event.event_type != WatchEventType::Deleted
            && PROTOCOL_LABELS.iter().all(|key| current.get(*key) == before.get(*key))
        {
            return Ok(());
        }

        let holders: BTreeSet<&String> = [&before, &current]
            .into_iter()
            .flat_map(|labels| [labels.get(SLICE_LABEL), labels.get(PRE_RESERVATION_LABEL)])
            .flatten()
            .filter(|name| name.as_str() != NONE)
            .collect();
        for name in holders {
            debug!("Node {} changed hands, queueing slice {}", node.name(), name);
            self.slice_queue.add(name.clone());
        }
        Ok(())
    }
}
