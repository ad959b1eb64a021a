use super::config::WebhookService;
use super::subscriptions::Destination;
use super::{NotificationError, NotificationSender};
use async_trait::async_trait;
use cloudevents::{Event, EventBuilder, EventBuilderV10};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// CloudEvent type of a notification
pub const NOTIFICATION_EVENT_TYPE: &str = "io.kulta.experiment.notification";

const EVENT_SOURCE: &str = "https://kulta.io/experiment-controller";

/// Sends notifications as CloudEvents to webhook services
pub struct WebhookNotifier {
    client: reqwest::Client,
    services: BTreeMap<String, WebhookService>,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, services: BTreeMap<String, WebhookService>) -> Self {
        Self { client, services }
    }
}

/// Wrap a notification in a CloudEvent
pub fn build_notification_event(
    vars: &Value,
    templates: &[String],
    destination: &Destination,
) -> Result<Event, NotificationError> {
    EventBuilderV10::new()
        .id(uuid::Uuid::new_v4().to_string())
        .ty(NOTIFICATION_EVENT_TYPE)
        .source(EVENT_SOURCE)
        .subject(destination.to_string())
        .data(
            "application/json",
            json!({
                "templates": templates,
                "recipient": destination.recipient,
                "vars": vars,
            }),
        )
        .build()
        .map_err(|e| NotificationError::Send {
            destination: destination.to_string(),
            message: format!("failed to build CloudEvent: {e}"),
        })
}

#[async_trait]
impl NotificationSender for WebhookNotifier {
    async fn send(
        &self,
        vars: &Value,
        templates: &[String],
        destination: &Destination,
    ) -> Result<(), NotificationError> {
        let service = self
            .services
            .get(&destination.service)
            .ok_or_else(|| NotificationError::UnknownService(destination.service.clone()))?;

        let event = build_notification_event(vars, templates, destination)?;

        let mut request = self
            .client
            .post(&service.url)
            .header("Content-Type", "application/cloudevents+json");
        for header in &service.headers {
            request = request.header(header.name.as_str(), header.value.as_str());
        }

        request
            .json(&event)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| NotificationError::Send {
                destination: destination.to_string(),
                message: format!("HTTP POST failed: {e}"),
            })?;

        debug!(destination = %destination, "Notification delivered");
        Ok(())
    }
}
