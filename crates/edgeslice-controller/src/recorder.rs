use crate::error::Result;
use chrono::Utc;
use edgeslice_core::k8s_openapi::api::core::v1::EventSource;
use edgeslice_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use edgeslice_core::{object_reference, Event, ObjectMeta, Resource};
use edgeslice_store::{DeleteParams, ListParams, ResourceGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Namespace that receives events about cluster-scoped objects
pub const CLUSTER_EVENT_NAMESPACE: &str = "default";

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Writes core/v1 Events about the objects a reconciler touches
#[derive(Clone)]
pub struct EventRecorder {
    component: String,
    events: Arc<dyn ResourceGateway<Event>>,
}

impl EventRecorder {
    pub fn new(component: impl Into<String>, events: Arc<dyn ResourceGateway<Event>>) -> Self {
        Self {
            component: component.into(),
            events,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub async fn normal<T: Resource>(&self, object: &T, reason: &str, message: &str) {
        self.record(object, EventType::Normal, reason, message).await
    }

    pub async fn warning<T: Resource>(&self, object: &T, reason: &str, message: &str) {
        self.record(object, EventType::Warning, reason, message).await
    }

    /// Record an event. Failures are logged and dropped.
    pub async fn record<T: Resource>(
        &self,
        object: &T,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let event = self.build(object, event_type, reason, message);
        match event_type {
            EventType::Normal => info!(
                kind = T::KIND,
                name = object.name(),
                reason,
                "{}",
                message
            ),
            EventType::Warning => warn!(
                kind = T::KIND,
                name = object.name(),
                reason,
                "{}",
                message
            ),
        }

        if let Err(e) = self.events.create(&event).await {
            warn!(
                "Failed to record {} event for {} {}: {}",
                reason,
                T::KIND,
                object.name(),
                e
            );
        }
    }

    fn build<T: Resource>(&self, object: &T, event_type: EventType, reason: &str, message: &str) -> Event {
        let namespace = object
            .metadata()
            .namespace
            .clone()
            .filter(|ns| T::NAMESPACED && !ns.is_empty())
            .unwrap_or_else(|| CLUSTER_EVENT_NAMESPACE.to_string());
        let now = Time(Utc::now());

        Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", object.name(), Uuid::new_v4().simple())),
                namespace: Some(namespace),
                ..Default::default()
            },
            involved_object: object_reference(object),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.as_str().to_string()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        }
    }
}

/// Configuration for the event pruner
#[derive(Debug, Clone)]
pub struct EventPrunerConfig {
    /// Interval between pruning passes
    pub prune_interval: Duration,
    /// How long an event is kept after it was last seen
    pub ttl: Duration,
}

impl Default for EventPrunerConfig {
    fn default() -> Self {
        Self {
            prune_interval: Duration::from_secs(60),
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Periodically deletes events older than their time to live
pub struct EventPruner {
    events: Arc<dyn ResourceGateway<Event>>,
    config: EventPrunerConfig,
}

impl EventPruner {
    pub fn new(events: Arc<dyn ResourceGateway<Event>>, config: EventPrunerConfig) -> Self {
        Self { events, config }
    }

    /// Run the pruning loop until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting event pruner (interval: {:?}, ttl: {:?})",
            self.config.prune_interval, self.config.ttl
        );

        let mut interval = tokio::time::interval(self.config.prune_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Event pruner shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.prune().await {
                        error!("Event pruning failed: {}", e);
                    }
                }
            }
        }
    }

    /// Delete every event last seen more than `ttl` ago; returns how many went
    pub async fn prune(&self) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(self.config.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(0);
        };

        let events = self.events.list(None, &ListParams::default()).await?;
        let mut pruned = 0;
        for event in &events {
            let seen = event
                .last_timestamp
                .as_ref()
                .or(event.first_timestamp.as_ref())
                .map(|t| t.0);
            if seen.is_some_and(|seen| seen >= cutoff) {
                continue;
            }
            match self
                .events
                .delete(event.metadata.namespace.as_deref(), event.name(), &DeleteParams::immediate())
                .await
            {
                Ok(_) => pruned += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to prune event {}: {}", event.name(), e),
            }
        }
        if pruned > 0 {
            debug!("Pruned {} expired event(s)", pruned);
        }
        Ok(pruned)
    }
}
