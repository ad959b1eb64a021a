//! Event recording and notification dispatch
//!
//! Every lifecycle event goes through [`Emitter`], which in order: logs the
//! message, records a Kubernetes Event, bumps an optional per-object
//! counter and finally notifies subscribers of the matching trigger.
//!
//! Kubernetes Events are fire-and-forget. Notification failures are
//! returned to the caller, which decides whether they fail the reconcile.

use crate::controller::notifications::{NotificationError, NotificationsManager, Subscriptions};
use crate::controller::notifications::TriggerRegistry;
use crate::server::SharedMetrics;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use prometheus::IntCounterVec;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Reporting component on recorded Events
pub const CONTROLLER_NAME: &str = "kokeilu-controller";

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    pub const EXPERIMENT_PENDING: &str = "ExperimentPending";
    pub const EXPERIMENT_RUNNING: &str = "ExperimentRunning";
    pub const EXPERIMENT_COMPLETED: &str = "ExperimentCompleted";
    pub const EXPERIMENT_FAILED: &str = "ExperimentFailed";
    pub const EXPERIMENT_TERMINATING: &str = "ExperimentTerminating";
    /// Spec failed validation; the experiment is in Error
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// A referenced object is missing or inconsistent
    pub const INVALID_REFERENCES: &str = "InvalidReferences";

    pub const SCALING_REPLICASET: &str = "ScalingReplicaSet";
    pub const EXPERIMENT_UPDATED: &str = "ExperimentUpdated";
    pub const DELETING_REPLICASET: &str = "DeletingReplicaSet";
    /// Fired by rollout step progression, kept for subscription compatibility
    pub const ROLLOUT_STEP_COMPLETED: &str = "RolloutStepCompleted";

    pub const NOTIFICATION_FAILED: &str = "NotificationFailed";
}

/// Value of the ACTION column
pub const ACTION_RECONCILE: &str = "Reconcile";

/// Records Kubernetes Events; never fails
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// How an event is recorded
#[derive(Clone, Copy)]
pub struct EventOptions<'a> {
    pub event_type: EventType,
    /// Without a reason only the log line and counter are produced
    pub reason: Option<&'a str>,
    pub counter: Option<&'a IntCounterVec>,
}

impl<'a> EventOptions<'a> {
    pub fn normal(reason: &'a str) -> Self {
        Self {
            event_type: EventType::Normal,
            reason: Some(reason),
            counter: None,
        }
    }

    pub fn warning(reason: &'a str) -> Self {
        Self {
            event_type: EventType::Warning,
            reason: Some(reason),
            counter: None,
        }
    }

    pub fn with_counter(mut self, counter: &'a IntCounterVec) -> Self {
        self.counter = Some(counter);
        self
    }
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("notification failed: {0}")]
    Notification(#[from] NotificationError),
}

pub struct Emitter {
    publisher: Arc<dyn EventPublisher>,
    notifications: Arc<dyn NotificationsManager>,
    registry: Arc<TriggerRegistry>,
    metrics: Option<SharedMetrics>,
}

impl Emitter {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        notifications: Arc<dyn NotificationsManager>,
        registry: Arc<TriggerRegistry>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            publisher,
            notifications,
            registry,
            metrics,
        }
    }

    /// Record an event of `options.event_type`
    pub async fn emit<K>(
        &self,
        obj: &K,
        options: EventOptions<'_>,
        message: impl Into<String>,
    ) -> Result<(), EmitError>
    where
        K: Resource<DynamicType = ()> + Serialize + Sync,
    {
        self.record(obj, options, message.into()).await
    }

    /// Record a warning regardless of `options.event_type`
    pub async fn warn<K>(
        &self,
        obj: &K,
        options: EventOptions<'_>,
        message: impl Into<String>,
    ) -> Result<(), EmitError>
    where
        K: Resource<DynamicType = ()> + Serialize + Sync,
    {
        let options = EventOptions {
            event_type: EventType::Warning,
            ..options
        };
        self.record(obj, options, message.into()).await
    }

    async fn record<K>(
        &self,
        obj: &K,
        options: EventOptions<'_>,
        message: String,
    ) -> Result<(), EmitError>
    where
        K: Resource<DynamicType = ()> + Serialize + Sync,
    {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        if options.event_type == EventType::Warning {
            warn!(namespace = ?namespace, name = ?name, reason = ?options.reason, "{}", message);
        } else {
            info!(namespace = ?namespace, name = ?name, reason = ?options.reason, "{}", message);
        }

        if let Some(reason) = options.reason {
            self.publisher
                .publish(
                    &obj.object_ref(&()),
                    options.event_type,
                    reason,
                    ACTION_RECONCILE,
                    Some(message),
                )
                .await;
        }

        if let Some(counter) = options.counter {
            counter.with_label_values(&[&namespace, &name]).inc();
        }

        match options.reason {
            Some(reason) => self.send_notifications(obj, reason).await,
            None => Ok(()),
        }
    }

    async fn send_notifications<K>(&self, obj: &K, reason: &str) -> Result<(), EmitError>
    where
        K: Resource<DynamicType = ()> + Serialize + Sync,
    {
        let Some(trigger) = self.registry.trigger_for_reason(reason) else {
            return Ok(());
        };
        let subscriptions = Subscriptions::from_annotations(obj.annotations());
        let destinations = subscriptions.for_trigger(trigger);
        if destinations.is_empty() {
            return Ok(());
        }

        let (sender, templates) = self.notifications.get_api()?;
        let vars = json!({ "rollout": serde_json::to_value(obj).map_err(NotificationError::from)? });
        let template_names = templates.get(trigger).cloned().unwrap_or_default();

        for destination in destinations {
            if let Err(e) = sender.send(&vars, &template_names, destination).await {
                error!(trigger, destination = %destination, error = %e, "Notification error");
                if let Some(metrics) = &self.metrics {
                    metrics.record_notification(trigger, false);
                }
                return Err(e.into());
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_notification(trigger, true);
            }
        }
        Ok(())
    }
}

/// One recorded event, for assertions
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub note: Option<String>,
}

/// Publisher that keeps events in memory
#[cfg(test)]
#[derive(Default)]
pub struct RecordingPublisher {
    events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl RecordingPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            type_,
            reason: reason.to_string(),
            note,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "events_test.rs"]
mod tests;
