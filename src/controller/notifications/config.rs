use super::registry::TriggerRegistry;
use super::sender::WebhookNotifier;
use super::{
    NotificationError, NotificationSender, NotificationsManager, TemplateMap,
    NOTIFICATION_CONFIGMAP, NOTIFICATION_SECRET,
};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const TRIGGER_KEY_PREFIX: &str = "trigger.";
const WEBHOOK_KEY_PREFIX: &str = "service.webhook.";

/// One condition of a trigger: which templates to send and when
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TriggerCondition {
    #[serde(default)]
    pub send: Vec<String>,

    #[serde(default)]
    pub when: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WebhookHeader {
    pub name: String,
    pub value: String,
}

/// `service.webhook.<name>` entry
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WebhookService {
    pub url: String,

    #[serde(default)]
    pub headers: Vec<WebhookHeader>,
}

/// Parsed notification ConfigMap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationConfig {
    pub triggers: BTreeMap<String, Vec<TriggerCondition>>,
    pub services: BTreeMap<String, WebhookService>,
}

impl NotificationConfig {
    /// Parse the ConfigMap, resolving `$key` references from the Secret
    pub fn parse(config_map: &ConfigMap, secret: &Secret) -> Result<Self, NotificationError> {
        let mut config = NotificationConfig::default();
        let secrets = secret_values(secret);

        for (key, raw) in config_map.data.iter().flatten() {
            if let Some(trigger) = key.strip_prefix(TRIGGER_KEY_PREFIX) {
                let conditions: Vec<TriggerCondition> =
                    serde_yaml::from_str(raw).map_err(|e| NotificationError::InvalidConfig {
                        key: key.clone(),
                        message: e.to_string(),
                    })?;
                config.triggers.insert(trigger.to_string(), conditions);
            } else if let Some(service) = key.strip_prefix(WEBHOOK_KEY_PREFIX) {
                let mut webhook: WebhookService =
                    serde_yaml::from_str(raw).map_err(|e| NotificationError::InvalidConfig {
                        key: key.clone(),
                        message: e.to_string(),
                    })?;
                webhook.url = resolve_secret(&webhook.url, &secrets);
                for header in &mut webhook.headers {
                    header.value = resolve_secret(&header.value, &secrets);
                }
                config.services.insert(service.to_string(), webhook);
            } else {
                debug!(key = %key, "Ignoring unrecognised notification config key");
            }
        }

        Ok(config)
    }

    /// Templates of each registered trigger, from its first condition
    pub fn templates(&self, registry: &TriggerRegistry) -> TemplateMap {
        self.triggers
            .iter()
            .filter(|(name, _)| registry.contains_trigger(name))
            .filter_map(|(name, conditions)| {
                conditions
                    .first()
                    .map(|first| (name.clone(), first.send.clone()))
            })
            .collect()
    }
}

fn secret_values(secret: &Secret) -> BTreeMap<String, String> {
    let mut values: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .filter_map(|(k, v)| String::from_utf8(v.0.clone()).ok().map(|s| (k.clone(), s)))
        .collect();
    for (k, v) in secret.string_data.iter().flatten() {
        values.insert(k.clone(), v.clone());
    }
    values
}

/// `$name` is replaced by the secret value; unknown keys are left as written
fn resolve_secret(value: &str, secrets: &BTreeMap<String, String>) -> String {
    match value.strip_prefix('$') {
        Some(key) => secrets.get(key).cloned().unwrap_or_else(|| value.to_string()),
        None => value.to_string(),
    }
}

/// Read access to the notification ConfigMap/Secret pair
pub trait NotificationConfigSource: Send + Sync {
    fn config_map(&self) -> Option<Arc<ConfigMap>>;
    fn secret(&self) -> Option<Arc<Secret>>;
}

/// Config source backed by reflector stores
pub struct StoreConfigSource {
    config_maps: Store<ConfigMap>,
    secrets: Store<Secret>,
    namespace: String,
}

impl StoreConfigSource {
    pub fn new(config_maps: Store<ConfigMap>, secrets: Store<Secret>, namespace: &str) -> Self {
        Self {
            config_maps,
            secrets,
            namespace: namespace.to_string(),
        }
    }
}

impl NotificationConfigSource for StoreConfigSource {
    fn config_map(&self) -> Option<Arc<ConfigMap>> {
        self.config_maps
            .get(&ObjectRef::new(NOTIFICATION_CONFIGMAP).within(&self.namespace))
    }

    fn secret(&self) -> Option<Arc<Secret>> {
        self.secrets
            .get(&ObjectRef::new(NOTIFICATION_SECRET).within(&self.namespace))
    }
}

struct CachedApi {
    fingerprint: (Option<String>, Option<String>),
    sender: Arc<dyn NotificationSender>,
    templates: TemplateMap,
}

/// Builds the notification API from the ConfigMap/Secret pair
///
/// The parsed API is reused until either object's resourceVersion changes.
pub struct ConfigMapNotificationsManager {
    source: Arc<dyn NotificationConfigSource>,
    registry: Arc<TriggerRegistry>,
    http: reqwest::Client,
    cache: Mutex<Option<CachedApi>>,
}

impl ConfigMapNotificationsManager {
    pub fn new(
        source: Arc<dyn NotificationConfigSource>,
        registry: Arc<TriggerRegistry>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            source,
            registry,
            http,
            cache: Mutex::new(None),
        }
    }
}

impl NotificationsManager for ConfigMapNotificationsManager {
    fn get_api(&self) -> Result<(Arc<dyn NotificationSender>, TemplateMap), NotificationError> {
        let config_map = self
            .source
            .config_map()
            .ok_or_else(|| NotificationError::ConfigMapMissing(NOTIFICATION_CONFIGMAP.to_string()))?;
        let secret = self.source.secret();
        let fingerprint = (
            config_map.resource_version(),
            secret.as_ref().and_then(|s| s.resource_version()),
        );

        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cached) = cache.as_ref() {
            if fingerprint.0.is_some() && cached.fingerprint == fingerprint {
                return Ok((cached.sender.clone(), cached.templates.clone()));
            }
        }

        let secret = secret.unwrap_or_else(|| {
            warn!(secret = NOTIFICATION_SECRET, "Notification secret does not exist");
            Arc::new(Secret::default())
        });
        let config = NotificationConfig::parse(&config_map, &secret)?;
        let templates = config.templates(&self.registry);
        let sender: Arc<dyn NotificationSender> =
            Arc::new(WebhookNotifier::new(self.http.clone(), config.services));

        debug!(
            triggers = templates.len(),
            "Rebuilt notification API from ConfigMap"
        );
        *cache = Some(CachedApi {
            fingerprint,
            sender: sender.clone(),
            templates: templates.clone(),
        });
        Ok((sender, templates))
    }
}
