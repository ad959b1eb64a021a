use super::validation::parse_duration;
use crate::controller::clock::status_timestamp;
use crate::controller::events::reasons;
use crate::crd::experiment::{
    ConditionStatus, ConditionType, Experiment, ExperimentCondition, ExperimentStatus, Phase,
    TemplateStatus,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

/// Verdict of the analyses gating an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Successful,
    Failed,
}

impl AnalysisOutcome {
    fn phase(self) -> Phase {
        match self {
            AnalysisOutcome::Successful => Phase::Successful,
            AnalysisOutcome::Failed => Phase::Failed,
        }
    }
}

/// Everything the phase decision depends on
#[derive(Debug, Clone, Copy)]
pub struct PhaseInputs<'a> {
    pub previous: Option<Phase>,
    pub spec_invalid: bool,
    pub terminate: bool,
    pub duration_elapsed: bool,
    pub analysis: Option<AnalysisOutcome>,
    pub templates: &'a [TemplateStatus],
}

fn all_ready(templates: &[TemplateStatus]) -> bool {
    !templates.is_empty() && templates.iter().all(TemplateStatus::is_ready)
}

fn all_available(templates: &[TemplateStatus]) -> bool {
    !templates.is_empty() && templates.iter().all(TemplateStatus::is_available)
}

fn all_scaled_down(templates: &[TemplateStatus]) -> bool {
    templates.iter().all(TemplateStatus::is_scaled_down)
}

/// Compute the next phase
///
/// Phases never move backwards: terminal phases absorb everything and a
/// Running experiment never returns to Pending.
pub fn next_phase(inputs: PhaseInputs<'_>) -> Phase {
    if inputs.spec_invalid {
        return Phase::Error;
    }

    match inputs.previous {
        Some(previous) if previous.is_terminal() => return previous,
        Some(Phase::Terminating) => {
            return if all_scaled_down(inputs.templates) {
                inputs
                    .analysis
                    .map(AnalysisOutcome::phase)
                    .unwrap_or(Phase::Successful)
            } else {
                Phase::Terminating
            };
        }
        _ => {}
    }

    if inputs.terminate || inputs.duration_elapsed {
        return Phase::Terminating;
    }

    let was_running = inputs.previous == Some(Phase::Running);
    if let Some(outcome) = inputs.analysis {
        if was_running || all_ready(inputs.templates) {
            return outcome.phase();
        }
    }

    if all_ready(inputs.templates) || was_running {
        Phase::Running
    } else {
        Phase::Pending
    }
}

/// Event reason recorded when an experiment enters `phase`
pub fn phase_reason(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => reasons::EXPERIMENT_PENDING,
        Phase::Running => reasons::EXPERIMENT_RUNNING,
        Phase::Successful => reasons::EXPERIMENT_COMPLETED,
        Phase::Failed => reasons::EXPERIMENT_FAILED,
        Phase::Error => reasons::INVALID_SPEC,
        Phase::Terminating => reasons::EXPERIMENT_TERMINATING,
    }
}

pub fn phase_message(phase: Phase) -> String {
    match phase {
        Phase::Pending => "Experiment is waiting for its ReplicaSets to become ready".to_string(),
        Phase::Running => "All templates are running".to_string(),
        Phase::Successful => "Experiment completed successfully".to_string(),
        Phase::Failed => "Experiment analysis failed".to_string(),
        Phase::Error => "Experiment spec is invalid".to_string(),
        Phase::Terminating => "Experiment is terminating".to_string(),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// When `spec.duration` runs out, measured from `status.startedAt`
pub fn expiry(experiment: &Experiment, started_at: Option<&str>) -> Option<DateTime<Utc>> {
    let duration = parse_duration(experiment.spec.duration.as_deref()?)?;
    let started = parse_timestamp(started_at?)?;
    Some(started + chrono::Duration::from_std(duration).ok()?)
}

/// Condition appended when the phase changes
pub fn phase_condition(phase: Phase, message: &str, now: &str) -> ExperimentCondition {
    let (type_, status) = match phase {
        Phase::Pending | Phase::Running | Phase::Terminating => {
            (ConditionType::Progressing, ConditionStatus::True)
        }
        Phase::Successful => (ConditionType::Completed, ConditionStatus::True),
        Phase::Failed => (ConditionType::Completed, ConditionStatus::False),
        Phase::Error => (ConditionType::InvalidSpec, ConditionStatus::True),
    };
    ExperimentCondition {
        type_,
        status,
        reason: phase_reason(phase).to_string(),
        message: message.to_string(),
        last_transition_time: now.to_string(),
    }
}

/// Condition recorded when a notification could not be delivered
pub fn notification_condition(message: &str, now: &str) -> ExperimentCondition {
    ExperimentCondition {
        type_: ConditionType::NotificationDelivery,
        status: ConditionStatus::False,
        reason: reasons::NOTIFICATION_FAILED.to_string(),
        message: message.to_string(),
        last_transition_time: now.to_string(),
    }
}

/// Build the next status from the previous one
///
/// Timestamps are stamped once and kept; a condition is appended only when
/// the phase changes. `now` is the instant the sync observed, so a fresh
/// `startedAt` matches the one used for duration expiry.
pub fn compute_status(
    experiment: &Experiment,
    phase: Phase,
    message: String,
    templates: Vec<TemplateStatus>,
    now: DateTime<Utc>,
) -> ExperimentStatus {
    let previous = experiment.status.clone().unwrap_or_default();
    let now = status_timestamp(now);

    let mut next = ExperimentStatus {
        phase: Some(phase),
        message: Some(message),
        started_at: previous.started_at.clone().or_else(|| Some(now.clone())),
        available_at: previous.available_at.clone(),
        conditions: previous.conditions.clone(),
        observed_generation: experiment.metadata.generation.or(previous.observed_generation),
        template_statuses: templates,
    };

    if next.available_at.is_none() && all_available(&next.template_statuses) {
        next.available_at = Some(now.clone());
    }

    if previous.phase != Some(phase) {
        let message = next.message.clone().unwrap_or_default();
        next.conditions.push(phase_condition(phase, &message, &now));
    }

    next
}

/// Merge patch moving `previous` to `next`
///
/// `None` when nothing changed; only `observedGeneration` when that is the
/// sole difference; otherwise the whole status.
pub fn status_patch(
    previous: Option<&ExperimentStatus>,
    next: &ExperimentStatus,
) -> Result<Option<Value>, serde_json::Error> {
    let default = ExperimentStatus::default();
    let previous = previous.unwrap_or(&default);
    if previous == next {
        return Ok(None);
    }

    let generation_only = ExperimentStatus {
        observed_generation: next.observed_generation,
        ..previous.clone()
    };
    if &generation_only == next {
        return Ok(Some(json!({
            "status": { "observedGeneration": next.observed_generation }
        })));
    }

    Ok(Some(json!({ "status": serde_json::to_value(next)? })))
}

/// How long until the next sync, or `None` to wait for a change
pub fn requeue_after(
    phase: Phase,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    resync: Duration,
    terminating: Duration,
) -> Option<Duration> {
    if phase.is_terminal() {
        return None;
    }
    if phase == Phase::Terminating {
        return Some(terminating);
    }
    match expires_at {
        Some(at) => {
            let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
            Some(remaining.max(Duration::from_secs(1)))
        }
        None => Some(resync),
    }
}
