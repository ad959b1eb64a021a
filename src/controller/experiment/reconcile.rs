use super::client::ExperimentClient;
use super::replicaset::reconcile_children;
use super::status::{
    compute_status, expiry, next_phase, notification_condition, phase_message, phase_reason,
    requeue_after, status_patch, AnalysisOutcome, PhaseInputs,
};
use super::validation::validate_experiment_spec;
use crate::config::{ControllerConfig, NotificationFailurePolicy};
use crate::controller::client::ClientError;
use crate::controller::clock::{status_timestamp, Clock};
use crate::controller::events::{reasons, EmitError, Emitter, EventOptions};
use crate::controller::field::{summarize, FieldError};
use crate::controller::references::{
    build_experiment_bundle, validate_experiment_references, ReferenceLister,
};
use crate::crd::experiment::{Experiment, Phase};
use crate::server::SharedMetrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("invalid experiment key {0:?}: expected namespace/name")]
    InvalidKey(String),

    #[error("Experiment missing namespace")]
    MissingNamespace,

    #[error("Experiment {0} has no uid")]
    MissingUid(String),

    #[error("ReplicaSet {0} already exists and is not owned by this experiment")]
    NameCollision(String),

    #[error("Failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Notification(#[from] EmitError),
}

/// Work-queue key, `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExperimentKey {
    pub namespace: String,
    pub name: String,
}

impl ExperimentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_object(experiment: &Experiment) -> Result<Self, ReconcileError> {
        let namespace = experiment
            .namespace()
            .ok_or(ReconcileError::MissingNamespace)?;
        Ok(Self::new(namespace, experiment.name_any()))
    }
}

impl FromStr for ExperimentKey {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(ReconcileError::InvalidKey(s.to_string())),
        }
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the queue should do with the key next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// `None` waits for the next watch event
    pub requeue_after: Option<Duration>,
}

impl SyncOutcome {
    pub fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    pub fn action(self) -> Action {
        match self.requeue_after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        }
    }
}

/// Annotation carrying the verdict of the experiment's analyses
pub const ANALYSIS_OUTCOME_ANNOTATION: &str = "experiments.kulta.io/analysis-outcome";

/// Source of analysis verdicts
pub trait AnalysisOutcomeSource: Send + Sync {
    fn outcome(&self, experiment: &Experiment) -> Option<AnalysisOutcome>;
}

/// Reads the verdict from [`ANALYSIS_OUTCOME_ANNOTATION`]
///
/// The analysis runner writes `Successful` or `Failed`; anything else
/// means no verdict yet.
pub struct AnnotationOutcomeSource;

impl AnalysisOutcomeSource for AnnotationOutcomeSource {
    fn outcome(&self, experiment: &Experiment) -> Option<AnalysisOutcome> {
        let value = experiment.annotations().get(ANALYSIS_OUTCOME_ANNOTATION)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "successful" => Some(AnalysisOutcome::Successful),
            "failed" => Some(AnalysisOutcome::Failed),
            other => {
                debug!(experiment = ?experiment.name_any(), value = other, "Ignoring analysis outcome");
                None
            }
        }
    }
}

/// An event decided during sync, recorded after the status write
struct PendingEvent {
    reason: &'static str,
    warning: bool,
    counted: bool,
    message: String,
}

impl PendingEvent {
    fn normal(reason: &'static str, message: String) -> Self {
        Self {
            reason,
            warning: false,
            counted: false,
            message,
        }
    }

    fn phase(phase: Phase, message: String) -> Self {
        Self {
            reason: phase_reason(phase),
            warning: matches!(phase, Phase::Failed | Phase::Error),
            counted: true,
            message,
        }
    }
}

/// Reconciles one Experiment per call
pub struct ExperimentController {
    client: Arc<dyn ExperimentClient>,
    references: Arc<dyn ReferenceLister>,
    emitter: Emitter,
    analysis: Arc<dyn AnalysisOutcomeSource>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
    metrics: Option<SharedMetrics>,
}

impl ExperimentController {
    pub fn new(
        client: Arc<dyn ExperimentClient>,
        references: Arc<dyn ReferenceLister>,
        emitter: Emitter,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            references,
            emitter,
            analysis: Arc::new(AnnotationOutcomeSource),
            clock,
            config,
            metrics: None,
        }
    }

    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisOutcomeSource>) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bring one Experiment and its ReplicaSets one step closer to the spec
    ///
    /// Order within a sync: spec validation, reference validation, children,
    /// status patch, then events and notifications.
    pub async fn sync(&self, key: &ExperimentKey) -> Result<SyncOutcome, ReconcileError> {
        let Some(experiment) = self
            .client
            .get_experiment(&key.namespace, &key.name)
            .await?
        else {
            debug!(experiment = %key, "Experiment no longer exists");
            return Ok(SyncOutcome::done());
        };

        info!(experiment = ?key.name, namespace = ?key.namespace, "Syncing Experiment");
        let previous_phase = experiment.status.as_ref().and_then(|s| s.phase);

        let spec_errors = validate_experiment_spec(&experiment);
        if !spec_errors.is_empty() {
            return self.fail_invalid_spec(key, &experiment, &spec_errors).await;
        }

        // references only gate creating and scaling up; cleanup proceeds regardless
        if previous_phase.map_or(true, Phase::is_active) {
            let (bundle, mut ref_errors) =
                build_experiment_bundle(self.references.as_ref(), &experiment).await?;
            ref_errors.extend(validate_experiment_references(&experiment, &bundle));
            if let Some(first) = ref_errors.first() {
                warn!(experiment = %key, errors = %summarize(&ref_errors), "Invalid references");
                let event = PendingEvent {
                    reason: reasons::INVALID_REFERENCES,
                    warning: true,
                    counted: false,
                    message: first.to_string(),
                };
                self.record_events(key, &experiment, vec![event]).await?;
                return Ok(SyncOutcome::after(self.config.validation_retry));
            }
        }

        let report = reconcile_children(
            self.client.as_ref(),
            &experiment,
            previous_phase.unwrap_or(Phase::Pending),
        )
        .await?;

        let now = self.clock.now();
        let started_at = experiment
            .status
            .as_ref()
            .and_then(|s| s.started_at.clone())
            .unwrap_or_else(|| status_timestamp(now));
        let expires_at = expiry(&experiment, Some(started_at.as_str()));

        let phase = next_phase(PhaseInputs {
            previous: previous_phase,
            spec_invalid: false,
            terminate: experiment.spec.terminate,
            duration_elapsed: expires_at.is_some_and(|at| now >= at),
            analysis: self.analysis.outcome(&experiment),
            templates: &report.statuses,
        });
        let message = phase_message(phase);
        let status = compute_status(
            &experiment,
            phase,
            message.clone(),
            report.statuses,
            now,
        );

        if let Some(patch) = status_patch(experiment.status.as_ref(), &status)? {
            self.client
                .patch_experiment_status(&key.namespace, &key.name, &patch)
                .await?;
            debug!(experiment = %key, phase = %phase, "Patched Experiment status");
        }

        let mut events: Vec<PendingEvent> = report
            .events
            .into_iter()
            .map(|e| PendingEvent::normal(e.reason, e.message))
            .collect();
        if previous_phase != Some(phase) {
            info!(experiment = %key, from = ?previous_phase, to = %phase, "Phase changed");
            events.push(PendingEvent::phase(phase, message));
        }

        let mut written = experiment;
        written.status = Some(status);
        self.record_events(key, &written, events).await?;

        Ok(SyncOutcome {
            requeue_after: requeue_after(
                phase,
                expires_at,
                now,
                self.config.resync_interval,
                self.config.terminating_requeue,
            ),
        })
    }

    async fn fail_invalid_spec(
        &self,
        key: &ExperimentKey,
        experiment: &Experiment,
        errors: &[FieldError],
    ) -> Result<SyncOutcome, ReconcileError> {
        let message = summarize(errors);
        warn!(experiment = %key, errors = %message, "Experiment spec is invalid");

        let previous = experiment.status.as_ref();
        let templates = previous
            .map(|s| s.template_statuses.clone())
            .unwrap_or_default();
        let status = compute_status(
            experiment,
            Phase::Error,
            message.clone(),
            templates,
            self.clock.now(),
        );

        if let Some(patch) = status_patch(previous, &status)? {
            self.client
                .patch_experiment_status(&key.namespace, &key.name, &patch)
                .await?;
        }

        if previous.and_then(|s| s.phase) != Some(Phase::Error) {
            let mut written = experiment.clone();
            written.status = Some(status);
            self.record_events(key, &written, vec![PendingEvent::phase(Phase::Error, message)])
                .await?;
        }

        Ok(SyncOutcome::done())
    }

    /// Record events in order, applying the notification failure policy
    async fn record_events(
        &self,
        key: &ExperimentKey,
        experiment: &Experiment,
        events: Vec<PendingEvent>,
    ) -> Result<(), ReconcileError> {
        let counter = self.metrics.as_ref().map(|m| m.experiment_events());
        let mut failures: Vec<EmitError> = Vec::new();

        for event in events {
            let mut options = if event.warning {
                EventOptions::warning(event.reason)
            } else {
                EventOptions::normal(event.reason)
            };
            if let (true, Some(counter)) = (event.counted, counter) {
                options = options.with_counter(counter);
            }

            let result = if event.warning {
                self.emitter.warn(experiment, options, event.message).await
            } else {
                self.emitter.emit(experiment, options, event.message).await
            };

            if let Err(e) = result {
                match self.config.notification_failures {
                    NotificationFailurePolicy::Propagate => return Err(e.into()),
                    NotificationFailurePolicy::Isolate => {
                        warn!(experiment = %key, reason = event.reason, error = %e, "Notification failed");
                        failures.push(e);
                    }
                }
            }
        }

        if let Some(first) = failures.first() {
            self.record_notification_failure(key, experiment, &first.to_string())
                .await?;
        }
        Ok(())
    }

    /// Append a NotificationDelivery=False condition and warn
    async fn record_notification_failure(
        &self,
        key: &ExperimentKey,
        experiment: &Experiment,
        message: &str,
    ) -> Result<(), ReconcileError> {
        let mut conditions = experiment
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        conditions.push(notification_condition(message, &self.clock.now_rfc3339()));

        self.client
            .patch_experiment_status(
                &key.namespace,
                &key.name,
                &json!({ "status": { "conditions": conditions } }),
            )
            .await?;

        // NotificationFailed maps to no trigger, so this cannot fail again
        if let Err(e) = self
            .emitter
            .warn(
                experiment,
                EventOptions::warning(reasons::NOTIFICATION_FAILED),
                message,
            )
            .await
        {
            warn!(experiment = %key, error = %e, "Failed to record notification failure");
        }
        Ok(())
    }
}

/// Per-key exponential back-off for failed syncs
///
/// Delay is `base * 2^failures`, capped at `max`; a successful sync resets
/// the key.
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(*count))
            .unwrap_or(self.max)
            .min(self.max);
        *count = count.saturating_add(1).min(31);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

pub struct Context {
    pub controller: ExperimentController,
    pub backoff: RetryBackoff,
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        controller: ExperimentController,
        config: &ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            controller,
            backoff: RetryBackoff::new(config.error_backoff_base, config.error_backoff_max),
            metrics,
        }
    }
}

fn backoff_key(experiment: &Experiment) -> String {
    match experiment.namespace() {
        Some(ns) => format!("{}/{}", ns, experiment.name_any()),
        None => experiment.name_any(),
    }
}

/// Reconcile entry point for `kube::runtime::Controller`
pub async fn reconcile(
    experiment: Arc<Experiment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start = Instant::now();
    let result = match ExperimentKey::for_object(&experiment) {
        Ok(key) => ctx.controller.sync(&key).await,
        Err(e) => Err(e),
    };
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            ctx.backoff.reset(&backoff_key(&experiment));
            if let Some(metrics) = &ctx.metrics {
                metrics.record_reconciliation_success(elapsed);
            }
            Ok(outcome.action())
        }
        Err(e) => {
            if let Some(metrics) = &ctx.metrics {
                metrics.record_reconciliation_error(elapsed);
            }
            Err(e)
        }
    }
}

/// Requeue a failed key with exponential back-off
pub fn error_policy(experiment: Arc<Experiment>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = backoff_key(&experiment);
    let delay = ctx.backoff.next_delay(&key);
    warn!(experiment = %key, error = %error, retry_in = ?delay, "Reconcile error (will retry)");
    Action::requeue(delay)
}
