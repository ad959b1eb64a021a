use std::collections::BTreeMap;

/// Annotation prefix: `notifications.kulta.io/subscribe.<trigger>.<service>`
pub const SUBSCRIBE_ANNOTATION_PREFIX: &str = "notifications.kulta.io/subscribe.";

/// Where a notification goes: a configured service and a recipient on it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Destination {
    pub service: String,
    pub recipient: String,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service, self.recipient)
    }
}

/// Destinations per trigger, read from an object's annotations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    by_trigger: BTreeMap<String, Vec<Destination>>,
}

impl Subscriptions {
    /// Parse subscription annotations
    ///
    /// Recipients are `;`-separated. Blank recipients, malformed keys and
    /// unrelated annotations are skipped; duplicates are kept once.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let mut by_trigger: BTreeMap<String, Vec<Destination>> = BTreeMap::new();

        for (key, value) in annotations {
            let Some(rest) = key.strip_prefix(SUBSCRIBE_ANNOTATION_PREFIX) else {
                continue;
            };
            let Some((trigger, service)) = rest.split_once('.') else {
                continue;
            };
            if trigger.is_empty() || service.is_empty() || service.contains('.') {
                continue;
            }

            let destinations = by_trigger.entry(trigger.to_string()).or_default();
            for recipient in value.split(';').map(str::trim).filter(|r| !r.is_empty()) {
                let dest = Destination {
                    service: service.to_string(),
                    recipient: recipient.to_string(),
                };
                if !destinations.contains(&dest) {
                    destinations.push(dest);
                }
            }
        }

        by_trigger.retain(|_, d| !d.is_empty());
        Self { by_trigger }
    }

    pub fn for_trigger(&self, trigger: &str) -> &[Destination] {
        self.by_trigger
            .get(trigger)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_trigger.is_empty()
    }
}
