//! Lifecycle notifications
//!
//! Objects subscribe to triggers through annotations; the trigger registry
//! maps event reasons to triggers; the notification ConfigMap says which
//! templates a trigger sends and where services live.

mod config;
mod registry;
mod sender;
mod subscriptions;

pub use config::{
    ConfigMapNotificationsManager, NotificationConfig, NotificationConfigSource,
    StoreConfigSource, TriggerCondition, WebhookHeader, WebhookService,
};
pub use registry::{RegistryError, TriggerRegistry, BUILTIN_TRIGGERS};
pub use sender::{build_notification_event, WebhookNotifier, NOTIFICATION_EVENT_TYPE};
pub use subscriptions::{Destination, Subscriptions, SUBSCRIBE_ANNOTATION_PREFIX};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// ConfigMap holding triggers and services, in the controller namespace
pub const NOTIFICATION_CONFIGMAP: &str = "kulta-notification-configmap";

/// Secret holding values referenced as `$key` from the ConfigMap
pub const NOTIFICATION_SECRET: &str = "kulta-notification-secret";

/// Trigger name → template names it sends
pub type TemplateMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification configMap {0} does not exist")]
    ConfigMapMissing(String),

    #[error("invalid notification config {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("notification service {0} is not configured")]
    UnknownService(String),

    #[error("failed to notify {destination}: {message}")]
    Send {
        destination: String,
        message: String,
    },

    #[error("failed to serialize notification object: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Delivers a rendered notification to one destination
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        vars: &Value,
        templates: &[String],
        destination: &Destination,
    ) -> Result<(), NotificationError>;
}

/// Source of the current notification API
pub trait NotificationsManager: Send + Sync {
    fn get_api(&self) -> Result<(Arc<dyn NotificationSender>, TemplateMap), NotificationError>;
}

/// Manager used when notifications are not configured at all
pub struct DisabledNotifications;

impl NotificationsManager for DisabledNotifications {
    fn get_api(&self) -> Result<(Arc<dyn NotificationSender>, TemplateMap), NotificationError> {
        Err(NotificationError::ConfigMapMissing(
            NOTIFICATION_CONFIGMAP.to_string(),
        ))
    }
}

/// A send captured by [`RecordingSender`]
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub vars: Value,
    pub templates: Vec<String>,
    pub destination: Destination,
}

/// Sender that records sends in memory and can be told to fail
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSender {
    sent: std::sync::Mutex<Vec<SentNotification>>,
    fail_with: std::sync::Mutex<Option<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl RecordingSender {
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl NotificationSender for RecordingSender {
    async fn send(
        &self,
        vars: &Value,
        templates: &[String],
        destination: &Destination,
    ) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(SentNotification {
            vars: vars.clone(),
            templates: templates.to_vec(),
            destination: destination.clone(),
        });
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(NotificationError::Send {
                destination: destination.to_string(),
                message,
            });
        }
        Ok(())
    }
}

/// Manager returning a fixed sender and template map
#[cfg(test)]
pub struct StaticNotifications {
    pub sender: Arc<RecordingSender>,
    pub templates: TemplateMap,
}

#[cfg(test)]
impl StaticNotifications {
    pub fn new(templates: &[(&str, &[&str])]) -> Self {
        Self {
            sender: Arc::new(RecordingSender::default()),
            templates: templates
                .iter()
                .map(|(t, names)| (t.to_string(), names.iter().map(|n| n.to_string()).collect()))
                .collect(),
        }
    }
}

#[cfg(test)]
impl NotificationsManager for StaticNotifications {
    fn get_api(&self) -> Result<(Arc<dyn NotificationSender>, TemplateMap), NotificationError> {
        let sender: Arc<dyn NotificationSender> = self.sender.clone();
        Ok((sender, self.templates.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "notifications_test.rs"]
mod tests;
