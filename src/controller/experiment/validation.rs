use crate::controller::field::{FieldError, FieldPath};
use super::replicaset::EXPERIMENT_LABEL;
use crate::crd::experiment::Experiment;
use std::collections::BTreeSet;
use std::time::Duration;

/// Kubernetes label value limit; the experiment name is stored in
/// [`EXPERIMENT_LABEL`], which also keeps `{experiment}-{template}` a valid
/// object name
const MAX_LABEL_VALUE_LEN: usize = 63;

/// True for an RFC 1123 DNS label
pub fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

/// Validate an Experiment spec
///
/// These errors are fatal: the experiment goes to Error and is not retried
/// until its spec changes. Every problem is reported, not just the first.
///
/// # Rules
/// - experiment name fits in a label value (63 characters)
/// - at least one template
/// - template names are unique DNS labels
/// - `replicas >= 0`, `weight` in 0..=100
/// - `selector.matchLabels` present and carried by the pod template
/// - `duration` parses (e.g. "30s", "5m", "2h")
/// - analysis names unique and non-empty, `templateName` set
pub fn validate_experiment_spec(experiment: &Experiment) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let spec = &experiment.spec;
    let templates_path = FieldPath::new(["spec", "templates"]);

    if spec.templates.is_empty() {
        errors.push(FieldError::required(
            templates_path.clone(),
            "at least one template is required",
        ));
    }

    let experiment_name = experiment.metadata.name.clone().unwrap_or_default();
    if experiment_name.len() > MAX_LABEL_VALUE_LEN {
        errors.push(FieldError::invalid(
            FieldPath::new(["metadata", "name"]),
            &experiment_name,
            format!(
                "must be no more than {MAX_LABEL_VALUE_LEN} characters to fit the {EXPERIMENT_LABEL} label"
            ),
        ));
    }

    let mut seen = BTreeSet::new();
    for (i, template) in spec.templates.iter().enumerate() {
        let path = templates_path.index(i);

        if template.name.is_empty() {
            errors.push(FieldError::required(
                path.child("name"),
                "template name is required",
            ));
        } else if !is_dns_label(&template.name) {
            errors.push(FieldError::invalid(
                path.child("name"),
                &template.name,
                "must be a lowercase RFC 1123 label",
            ));
        } else if !seen.insert(template.name.as_str()) {
            errors.push(FieldError::duplicate(path.child("name"), &template.name));
        }

        if template.replicas < 0 {
            errors.push(FieldError::invalid(
                path.child("replicas"),
                template.replicas,
                "must be greater than or equal to 0",
            ));
        }

        if let Some(weight) = template.weight {
            if !(0..=100).contains(&weight) {
                errors.push(FieldError::invalid(
                    path.child("weight"),
                    weight,
                    "must be between 0 and 100",
                ));
            }
        }

        let pod_labels = template
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        match template.selector.match_labels.as_ref() {
            None => errors.push(FieldError::required(
                path.child("selector"),
                "selector.matchLabels is required",
            )),
            Some(labels) if labels.is_empty() => errors.push(FieldError::required(
                path.child("selector"),
                "selector.matchLabels is required",
            )),
            Some(labels) => {
                let matches = labels
                    .iter()
                    .all(|(k, v)| pod_labels.get(k) == Some(v));
                if !matches {
                    errors.push(FieldError::invalid(
                        path.child("selector"),
                        labels,
                        "`selector` does not match template `labels`",
                    ));
                }
            }
        }
    }

    if let Some(duration) = &spec.duration {
        if parse_duration(duration).is_none() {
            errors.push(FieldError::invalid(
                FieldPath::new(["spec", "duration"]),
                duration,
                "must be a positive duration like 30s, 5m or 2h",
            ));
        }
    }

    let analyses_path = FieldPath::new(["spec", "analyses"]);
    let mut seen = BTreeSet::new();
    for (i, analysis) in spec.analyses.iter().enumerate() {
        let path = analyses_path.index(i);
        if analysis.name.is_empty() {
            errors.push(FieldError::required(
                path.child("name"),
                "analysis name is required",
            ));
        } else if !seen.insert(analysis.name.as_str()) {
            errors.push(FieldError::duplicate(path.child("name"), &analysis.name));
        }
        if analysis.template_name.is_empty() {
            errors.push(FieldError::required(
                path.child("templateName"),
                "templateName is required",
            ));
        }
    }

    errors
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 24h = 1440m)
/// - "2h" → 2 hours (max 1 week = 168h)
///
/// Zero is rejected, and the per-unit caps catch typos like "999999h".
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - unit.len_utf8()]
        .parse()
        .ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86400 => Some(Duration::from_secs(number)),
        'm' if number <= 1440 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 168 => number.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
