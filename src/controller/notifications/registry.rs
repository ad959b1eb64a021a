use crate::controller::events::reasons;
use std::collections::BTreeMap;
use thiserror::Error;

/// Trigger names paired with the event reason that fires them
pub const BUILTIN_TRIGGERS: [(&str, &str); 7] = [
    ("on-running", reasons::EXPERIMENT_RUNNING),
    ("on-completed", reasons::EXPERIMENT_COMPLETED),
    ("on-failed", reasons::EXPERIMENT_FAILED),
    ("on-error", reasons::INVALID_SPEC),
    ("on-step-completed", reasons::ROLLOUT_STEP_COMPLETED),
    ("on-scaling-replicaset", reasons::SCALING_REPLICASET),
    ("on-update", reasons::EXPERIMENT_UPDATED),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("trigger {0} is registered more than once")]
    DuplicateTrigger(String),

    #[error("reason {reason} is mapped by both {first} and {second}")]
    DuplicateReason {
        reason: String,
        first: String,
        second: String,
    },
}

/// Bijection between notification triggers and event reasons
///
/// Built once at start-up and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRegistry {
    by_trigger: BTreeMap<String, String>,
    by_reason: BTreeMap<String, String>,
}

impl TriggerRegistry {
    pub fn new<I, T, R>(entries: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (T, R)>,
        T: Into<String>,
        R: Into<String>,
    {
        let mut by_trigger = BTreeMap::new();
        let mut by_reason: BTreeMap<String, String> = BTreeMap::new();

        for (trigger, reason) in entries {
            let (trigger, reason) = (trigger.into(), reason.into());
            if by_trigger.contains_key(&trigger) {
                return Err(RegistryError::DuplicateTrigger(trigger));
            }
            if let Some(first) = by_reason.get(&reason) {
                return Err(RegistryError::DuplicateReason {
                    reason,
                    first: first.clone(),
                    second: trigger,
                });
            }
            by_trigger.insert(trigger.clone(), reason.clone());
            by_reason.insert(reason, trigger);
        }

        Ok(Self {
            by_trigger,
            by_reason,
        })
    }

    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(BUILTIN_TRIGGERS)
    }

    pub fn trigger_for_reason(&self, reason: &str) -> Option<&str> {
        self.by_reason.get(reason).map(String::as_str)
    }

    pub fn reason_for_trigger(&self, trigger: &str) -> Option<&str> {
        self.by_trigger.get(trigger).map(String::as_str)
    }

    pub fn contains_trigger(&self, trigger: &str) -> bool {
        self.by_trigger.contains_key(trigger)
    }

    /// Trigger names in sorted order
    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.by_trigger.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_trigger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_trigger.is_empty()
    }
}
