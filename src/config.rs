//! Controller configuration from environment variables
//!
//! Every setting has a default. Values that fail to parse are logged and
//! replaced by the default so a typo never keeps the controller from starting.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// What a failed notification send does to the reconcile that triggered it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationFailurePolicy {
    /// Reconcile succeeds; failure is surfaced as a condition and a warning event
    #[default]
    Isolate,
    /// Reconcile fails and is retried with back-off
    Propagate,
}

impl FromStr for NotificationFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "propagate" => Ok(Self::Propagate),
            other => Err(format!("unknown notification failure policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Namespace holding the notification ConfigMap and Secret
    pub namespace: String,
    /// Restrict watches to one namespace; None watches all namespaces
    pub watch_namespace: Option<String>,
    pub workers: u16,
    pub resync_interval: Duration,
    pub validation_retry: Duration,
    pub terminating_requeue: Duration,
    pub notification_failures: NotificationFailurePolicy,
    pub health_port: u16,
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "kulta-system".to_string(),
            watch_namespace: None,
            workers: 4,
            resync_interval: Duration::from_secs(300),
            validation_retry: Duration::from_secs(30),
            terminating_requeue: Duration::from_secs(5),
            notification_failures: NotificationFailurePolicy::Isolate,
            health_port: 8080,
            error_backoff_base: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(300),
        }
    }
}

impl ControllerConfig {
    /// Read configuration from `KOKEILU_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let seconds = |key: &str, default: Duration| {
            parse_or_default::<u64>(key, get(key), default.as_secs()).max(1)
        };

        let error_backoff_base = Duration::from_secs(seconds(
            "KOKEILU_ERROR_BACKOFF_BASE_SECONDS",
            defaults.error_backoff_base,
        ));
        let mut error_backoff_max = Duration::from_secs(seconds(
            "KOKEILU_ERROR_BACKOFF_MAX_SECONDS",
            defaults.error_backoff_max,
        ));
        if error_backoff_max < error_backoff_base {
            warn!(
                base = ?error_backoff_base,
                max = ?error_backoff_max,
                "Error back-off max is below base, using base as max"
            );
            error_backoff_max = error_backoff_base;
        }

        Self {
            namespace: get("KOKEILU_NAMESPACE").unwrap_or(defaults.namespace),
            watch_namespace: get("KOKEILU_WATCH_NAMESPACE"),
            workers: parse_or_default("KOKEILU_WORKERS", get("KOKEILU_WORKERS"), defaults.workers)
                .max(1),
            resync_interval: Duration::from_secs(seconds(
                "KOKEILU_RESYNC_SECONDS",
                defaults.resync_interval,
            )),
            validation_retry: Duration::from_secs(seconds(
                "KOKEILU_VALIDATION_RETRY_SECONDS",
                defaults.validation_retry,
            )),
            terminating_requeue: Duration::from_secs(seconds(
                "KOKEILU_TERMINATING_REQUEUE_SECONDS",
                defaults.terminating_requeue,
            )),
            notification_failures: parse_or_default(
                "KOKEILU_NOTIFICATION_FAILURES",
                get("KOKEILU_NOTIFICATION_FAILURES"),
                defaults.notification_failures,
            ),
            health_port: parse_or_default(
                "KOKEILU_HEALTH_PORT",
                get("KOKEILU_HEALTH_PORT"),
                defaults.health_port,
            ),
            error_backoff_base,
            error_backoff_max,
        }
    }
}

fn parse_or_default<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(e) => {
                warn!(key = key, value = %raw, error = %e, default = ?default, "Invalid config value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> ControllerConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(config_from(&[]), ControllerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let cfg = config_from(&[
            ("KOKEILU_NAMESPACE", "rollouts"),
            ("KOKEILU_WATCH_NAMESPACE", "team-a"),
            ("KOKEILU_WORKERS", "8"),
            ("KOKEILU_RESYNC_SECONDS", "60"),
            ("KOKEILU_NOTIFICATION_FAILURES", "Propagate"),
            ("KOKEILU_HEALTH_PORT", "9090"),
        ]);
        assert_eq!(cfg.namespace, "rollouts");
        assert_eq!(cfg.watch_namespace.as_deref(), Some("team-a"));
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.resync_interval, Duration::from_secs(60));
        assert_eq!(cfg.notification_failures, NotificationFailurePolicy::Propagate);
        assert_eq!(cfg.health_port, 9090);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config_from(&[
            ("KOKEILU_WORKERS", "many"),
            ("KOKEILU_VALIDATION_RETRY_SECONDS", "-3"),
            ("KOKEILU_NOTIFICATION_FAILURES", "drop"),
            ("KOKEILU_WATCH_NAMESPACE", "  "),
        ]);
        let defaults = ControllerConfig::default();
        assert_eq!(cfg.workers, defaults.workers);
        assert_eq!(cfg.validation_retry, defaults.validation_retry);
        assert_eq!(cfg.notification_failures, NotificationFailurePolicy::Isolate);
        assert!(cfg.watch_namespace.is_none());
    }

    #[test]
    fn test_zero_durations_clamped() {
        let cfg = config_from(&[("KOKEILU_TERMINATING_REQUEUE_SECONDS", "0")]);
        assert_eq!(cfg.terminating_requeue, Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_max_not_below_base() {
        let cfg = config_from(&[
            ("KOKEILU_ERROR_BACKOFF_BASE_SECONDS", "60"),
            ("KOKEILU_ERROR_BACKOFF_MAX_SECONDS", "10"),
        ]);
        assert_eq!(cfg.error_backoff_max, Duration::from_secs(60));
    }
}
