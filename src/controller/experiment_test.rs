use super::*;
use crate::config::{ControllerConfig, NotificationFailurePolicy};
use crate::controller::clock::{Clock, ManualClock};
use crate::controller::events::{reasons, Emitter, RecordingPublisher};
use crate::controller::field::FieldErrorKind;
use crate::controller::notifications::{StaticNotifications, TriggerRegistry};
use crate::controller::references::StaticReferences;
use crate::crd::experiment::{
    ConditionStatus, ConditionType, Experiment, Phase, TemplateStatus, TemplateStatusCode,
};
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const BASE_YAML: &str = r#"
apiVersion: kulta.io/v1alpha1
kind: Experiment
metadata:
  name: foo
  namespace: default
  uid: foo-uid
  generation: 1
spec:
  templates:
  - name: bar
    replicas: 1
    selector:
      matchLabels:
        app: bar
    template:
      metadata:
        labels:
          app: bar
      spec:
        containers:
        - name: app
          image: nginx:1.25
"#;

fn experiment() -> Experiment {
    serde_yaml::from_str(BASE_YAML).expect("experiment fixture")
}

fn experiment_with(edit: impl FnOnce(&mut Experiment)) -> Experiment {
    let mut exp = experiment();
    edit(&mut exp);
    exp
}

fn subscribe(exp: &mut Experiment, trigger: &str, recipient: &str) {
    exp.annotations_mut().insert(
        format!("notifications.kulta.io/subscribe.{trigger}.webhook"),
        recipient.to_string(),
    );
}

/// A ReplicaSet in `default`, optionally controlled by `owner_uid`
fn replicaset(name: &str, owner_uid: Option<&str>, template: &str) -> ReplicaSet {
    let owners: Vec<serde_json::Value> = owner_uid
        .map(|uid| {
            vec![json!({
                "apiVersion": "kulta.io/v1alpha1",
                "kind": "Experiment",
                "name": "foo",
                "uid": uid,
                "controller": true
            })]
        })
        .unwrap_or_default();
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "ReplicaSet",
        "metadata": {
            "name": name,
            "namespace": "default",
            "labels": {"experiments.kulta.io/template": template},
            "ownerReferences": owners
        },
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": template}}
        }
    }))
    .expect("replicaset fixture")
}

struct Harness {
    cluster: Arc<FakeCluster>,
    publisher: Arc<RecordingPublisher>,
    notifications: Arc<StaticNotifications>,
    clock: Arc<ManualClock>,
    controller: ExperimentController,
}

impl Harness {
    fn new(cluster: FakeCluster) -> Self {
        Self::with(cluster, StaticReferences::default(), ControllerConfig::default())
    }

    fn with(cluster: FakeCluster, references: StaticReferences, config: ControllerConfig) -> Self {
        let cluster = Arc::new(cluster);
        let publisher = Arc::new(RecordingPublisher::default());
        let notifications = Arc::new(StaticNotifications::new(&[
            ("on-completed", &["my-template"]),
            ("on-running", &["running-template"]),
        ]));
        let clock = Arc::new(ManualClock::fixed());
        let registry = Arc::new(TriggerRegistry::builtin().expect("builtin registry"));
        let emitter = Emitter::new(publisher.clone(), notifications.clone(), registry, None);
        let controller = ExperimentController::new(
            cluster.clone(),
            Arc::new(references),
            emitter,
            clock.clone(),
            config,
        );
        Self {
            cluster,
            publisher,
            notifications,
            clock,
            controller,
        }
    }

    async fn sync(&self) -> SyncOutcome {
        self.controller.sync(&key()).await.expect("sync succeeds")
    }

    fn experiment(&self) -> Experiment {
        self.cluster.experiment("default", "foo")
    }

    fn phase(&self) -> Option<Phase> {
        self.experiment().status.and_then(|s| s.phase)
    }

    fn edit(&self, edit: impl FnOnce(&mut Experiment)) {
        let mut exp = self.experiment();
        edit(&mut exp);
        self.cluster.put_experiment(exp);
    }

    /// Drive a fresh experiment to Running
    async fn run_to_running(&self) {
        self.sync().await;
        self.cluster.mark_ready("default", "foo-bar");
        self.sync().await;
        assert_eq!(self.phase(), Some(Phase::Running));
        self.cluster.clear_actions();
    }
}

fn key() -> ExperimentKey {
    ExperimentKey::new("default", "foo")
}

// ---- sync: lifecycle ----

#[tokio::test]
async fn test_first_sync_creates_child_and_goes_pending_then_running() {
    let h = Harness::new(FakeCluster::default().with_experiment(experiment()));

    let outcome = h.sync().await;

    assert_eq!(
        h.cluster.actions()[0],
        ClusterAction::CreateReplicaSet {
            name: "foo-bar".to_string(),
            replicas: 1
        }
    );
    let rs = h.cluster.replicaset("default", "foo-bar").expect("child created");
    assert_eq!(rs.labels().get("app").map(String::as_str), Some("bar"));
    assert_eq!(
        rs.labels().get(TEMPLATE_LABEL).map(String::as_str),
        Some("bar")
    );
    assert!(is_owned_by(&rs, "foo-uid"));
    let selector = rs.spec.as_ref().unwrap().selector.match_labels.clone().unwrap();
    assert_eq!(selector.get("app").map(String::as_str), Some("bar"));
    assert_eq!(selector.get(TEMPLATE_LABEL).map(String::as_str), Some("bar"));

    let status = h.experiment().status.expect("status written");
    assert_eq!(status.phase, Some(Phase::Pending));
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(status.started_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    assert_eq!(status.template_statuses[0].replica_set.as_deref(), Some("foo-bar"));
    assert_eq!(
        status.template_statuses[0].status,
        TemplateStatusCode::Progressing
    );
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(300)));
    assert_eq!(
        h.publisher.reasons(),
        vec![reasons::SCALING_REPLICASET, reasons::EXPERIMENT_PENDING]
    );

    h.cluster.mark_ready("default", "foo-bar");
    h.clock.advance(chrono::Duration::seconds(10));
    h.sync().await;

    let status = h.experiment().status.expect("status written");
    assert_eq!(status.phase, Some(Phase::Running));
    assert_eq!(status.available_at.as_deref(), Some("2024-01-01T00:00:10Z"));
    assert_eq!(status.started_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    assert_eq!(status.template_statuses[0].status, TemplateStatusCode::Running);
    assert_eq!(
        h.publisher.reasons().last().map(String::as_str),
        Some(reasons::EXPERIMENT_RUNNING)
    );
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let h = Harness::new(FakeCluster::default().with_experiment(experiment()));
    h.run_to_running().await;
    let events_before = h.publisher.events().len();

    h.clock.advance(chrono::Duration::seconds(30));
    h.sync().await;

    assert!(h.cluster.actions().is_empty(), "{:?}", h.cluster.actions());
    assert_eq!(h.publisher.events().len(), events_before);
}

#[tokio::test]
async fn test_generation_bump_patches_only_observed_generation() {
    let h = Harness::new(FakeCluster::default().with_experiment(experiment()));
    h.run_to_running().await;

    h.edit(|exp| exp.metadata.generation = Some(2));
    h.sync().await;

    assert_eq!(
        h.cluster.status_patches(),
        vec![json!({"status": {"observedGeneration": 2}})]
    );
}

/// Adds a second template `baz` with two replicas
fn with_second_template(exp: &mut Experiment) {
    let mut baz = exp.spec.templates[0].clone();
    baz.name = "baz".to_string();
    baz.replicas = 2;
    baz.selector.match_labels = Some([("app".to_string(), "baz".to_string())].into());
    if let Some(metadata) = baz.template.metadata.as_mut() {
        metadata.labels = Some([("app".to_string(), "baz".to_string())].into());
    }
    exp.spec.templates.push(baz);
}

fn replicas(h: &Harness, name: &str) -> Option<i32> {
    h.cluster
        .replicaset("default", name)
        .and_then(|rs| rs.spec)
        .and_then(|spec| spec.replicas)
}

#[tokio::test]
async fn test_terminate_is_observed_before_scale_down() {
    let exp = experiment_with(with_second_template);
    let h = Harness::new(FakeCluster::default().with_experiment(exp));
    h.sync().await;
    h.cluster.mark_ready("default", "foo-bar");
    h.cluster.mark_ready("default", "foo-baz");
    h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Running));
    h.cluster.clear_actions();

    h.edit(|exp| exp.spec.terminate = true);
    let outcome = h.sync().await;

    assert_eq!(h.phase(), Some(Phase::Terminating));
    let actions = h.cluster.actions();
    assert_eq!(actions.len(), 1, "only the status patch: {actions:?}");
    assert!(matches!(actions[0], ClusterAction::PatchStatus(_)));
    assert_eq!(replicas(&h, "foo-bar"), Some(1));
    assert_eq!(replicas(&h, "foo-baz"), Some(2));
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(5)));
    h.cluster.clear_actions();

    // next cycle scales both down
    h.sync().await;
    let actions = h.cluster.actions();
    assert_eq!(
        actions[..2],
        [
            ClusterAction::UpdateReplicaSet {
                name: "foo-bar".to_string(),
                replicas: 0
            },
            ClusterAction::UpdateReplicaSet {
                name: "foo-baz".to_string(),
                replicas: 0
            },
        ]
    );
    assert!(!actions
        .iter()
        .any(|a| matches!(a, ClusterAction::DeleteReplicaSet(_))));
    assert_eq!(h.phase(), Some(Phase::Terminating), "pods still running");

    h.cluster.mark_ready("default", "foo-bar");
    h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Terminating), "foo-baz still running");

    h.cluster.mark_ready("default", "foo-baz");
    let outcome = h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Successful));
    assert_eq!(outcome.requeue_after, None);
    assert_eq!(
        h.cluster.replicaset_names(),
        vec!["foo-bar".to_string(), "foo-baz".to_string()],
        "scaled, not deleted"
    );
    assert_eq!(
        h.publisher.reasons().last().map(String::as_str),
        Some(reasons::EXPERIMENT_COMPLETED)
    );
}

#[tokio::test]
async fn test_terminated_before_first_sync_creates_nothing() {
    let exp = experiment_with(|e| e.spec.terminate = true);
    let h = Harness::new(FakeCluster::default().with_experiment(exp));

    h.sync().await;

    assert_eq!(h.phase(), Some(Phase::Terminating));
    assert!(h.cluster.replicaset_names().is_empty());
    let actions = h.cluster.actions();
    assert!(
        actions
            .iter()
            .all(|a| matches!(a, ClusterAction::PatchStatus(_))),
        "{actions:?}"
    );

    h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Successful));
    assert!(h.cluster.replicaset_names().is_empty());
}

/// Moves one second forward every time it is read
struct TickingClock {
    now: std::sync::Mutex<chrono::DateTime<chrono::Utc>>,
}

impl Clock for TickingClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        let mut now = self.now.lock().unwrap();
        let current = *now;
        *now += chrono::Duration::seconds(1);
        current
    }
}

#[tokio::test]
async fn test_started_at_matches_expiry_base() {
    let exp = experiment_with(|e| e.spec.duration = Some("1m".to_string()));
    let cluster = Arc::new(FakeCluster::default().with_experiment(exp));
    let registry = Arc::new(TriggerRegistry::builtin().unwrap());
    let emitter = Emitter::new(
        Arc::new(RecordingPublisher::default()),
        Arc::new(StaticNotifications::new(&[])),
        registry,
        None,
    );
    let clock = TickingClock {
        now: std::sync::Mutex::new(ManualClock::fixed().now()),
    };
    let controller = ExperimentController::new(
        cluster.clone(),
        Arc::new(StaticReferences::default()),
        emitter,
        Arc::new(clock),
        ControllerConfig::default(),
    );

    let outcome = controller.sync(&key()).await.unwrap();

    let status = cluster.experiment("default", "foo").status.unwrap();
    assert_eq!(status.started_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    assert_eq!(status.conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(60)));
}

#[tokio::test]
async fn test_completed_notification_sent_once() {
    let exp = experiment_with(|e| subscribe(e, "on-completed", "ops"));
    let h = Harness::new(FakeCluster::default().with_experiment(exp));
    h.run_to_running().await;

    h.edit(|exp| exp.spec.terminate = true);
    h.sync().await;
    h.sync().await;
    h.cluster.mark_ready("default", "foo-bar");
    h.sync().await;
    // terminal and unchanged: nothing more to send
    h.sync().await;

    let sent = h.notifications.sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].templates, vec!["my-template".to_string()]);
    assert_eq!(sent[0].destination.recipient, "ops");
    let rollout = &sent[0].vars["rollout"];
    assert_eq!(rollout["metadata"]["name"], "foo");
    assert_eq!(rollout["status"]["phase"], "Successful");
}

#[tokio::test]
async fn test_duration_elapsed_terminates() {
    let exp = experiment_with(|e| e.spec.duration = Some("1m".to_string()));
    let h = Harness::new(FakeCluster::default().with_experiment(exp));

    let outcome = h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Pending));
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(60)));

    h.clock.advance(chrono::Duration::seconds(45));
    let outcome = h.sync().await;
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(15)));

    h.clock.advance(chrono::Duration::seconds(16));
    h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Terminating));
}

#[tokio::test]
async fn test_failed_analysis_fails_then_cleans_up() {
    let h = Harness::new(FakeCluster::default().with_experiment(experiment()));
    h.run_to_running().await;

    h.edit(|exp| {
        exp.annotations_mut()
            .insert(ANALYSIS_OUTCOME_ANNOTATION.to_string(), "Failed".to_string());
    });
    h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Failed));
    let last = h.publisher.events().pop().expect("phase event");
    assert_eq!(last.reason, reasons::EXPERIMENT_FAILED);
    assert_eq!(last.type_, kube::runtime::events::EventType::Warning);

    let conditions = h.experiment().status.unwrap().conditions;
    let completed = conditions.last().unwrap();
    assert_eq!(completed.type_, ConditionType::Completed);
    assert_eq!(completed.status, ConditionStatus::False);

    h.cluster.clear_actions();
    h.sync().await;
    assert_eq!(
        h.cluster.actions()[0],
        ClusterAction::UpdateReplicaSet {
            name: "foo-bar".to_string(),
            replicas: 0
        }
    );
    assert_eq!(h.phase(), Some(Phase::Failed), "terminal phases absorb");
}

#[tokio::test]
async fn test_analysis_outcome_waits_for_availability() {
    let exp = experiment_with(|e| {
        e.annotations_mut()
            .insert(ANALYSIS_OUTCOME_ANNOTATION.to_string(), "Successful".to_string());
    });
    let h = Harness::new(FakeCluster::default().with_experiment(exp));

    h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Pending));

    h.cluster.mark_ready("default", "foo-bar");
    h.sync().await;
    assert_eq!(h.phase(), Some(Phase::Successful));
}

// ---- sync: validation ----

#[tokio::test]
async fn test_invalid_spec_goes_to_error_without_children() {
    let exp = experiment_with(|e| e.spec.templates.clear());
    let h = Harness::new(FakeCluster::default().with_experiment(exp));

    let outcome = h.sync().await;

    assert_eq!(outcome.requeue_after, None);
    let status = h.experiment().status.unwrap();
    assert_eq!(status.phase, Some(Phase::Error));
    assert!(status
        .message
        .unwrap()
        .contains("spec.templates: Required value"));
    assert_eq!(status.conditions[0].type_, ConditionType::InvalidSpec);
    assert!(h.cluster.replicaset_names().is_empty());

    let events = h.publisher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, reasons::INVALID_SPEC);
    assert_eq!(events[0].type_, kube::runtime::events::EventType::Warning);

    h.cluster.clear_actions();
    h.sync().await;
    assert!(h.cluster.actions().is_empty());
    assert_eq!(h.publisher.events().len(), 1);
}

#[tokio::test]
async fn test_invalid_references_skip_cycle_and_retry() {
    let exp = experiment_with(|e| {
        e.spec.analyses = vec![crate::crd::experiment::ExperimentAnalysis {
            name: "a".to_string(),
            template_name: "absent".to_string(),
            cluster_scope: false,
        }];
    });
    let h = Harness::new(FakeCluster::default().with_experiment(exp));

    let outcome = h.sync().await;

    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));
    assert!(h.cluster.actions().is_empty());
    let events = h.publisher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, reasons::INVALID_REFERENCES);
    assert!(events[0]
        .note
        .as_deref()
        .unwrap()
        .contains("AnalysisTemplate absent not found"));
}

#[tokio::test]
async fn test_name_too_long_for_label_goes_to_error() {
    let name = "e".repeat(70);
    let exp = experiment_with(|e| e.metadata.name = Some(name.clone()));
    let h = Harness::new(FakeCluster::default().with_experiment(exp));

    let outcome = h
        .controller
        .sync(&ExperimentKey::new("default", name.clone()))
        .await
        .expect("invalid spec is not a sync error");

    assert_eq!(outcome.requeue_after, None);
    let status = h.cluster.experiment("default", &name).status.unwrap();
    assert_eq!(status.phase, Some(Phase::Error));
    assert!(status.message.unwrap().starts_with("metadata.name: Invalid value"));
    assert!(h.cluster.replicaset_names().is_empty());
}

#[tokio::test]
async fn test_missing_experiment_is_success() {
    let h = Harness::new(FakeCluster::default());
    let outcome = h.controller.sync(&key()).await.expect("absent is fine");
    assert_eq!(outcome, SyncOutcome::done());
    assert!(h.cluster.actions().is_empty());
}

// ---- sync: ownership ----

#[tokio::test]
async fn test_unowned_name_collision_is_an_error() {
    let cluster = FakeCluster::default()
        .with_experiment(experiment())
        .with_replicaset(replicaset("foo-bar", Some("someone-else"), "bar"));
    let h = Harness::new(cluster);

    let err = h.controller.sync(&key()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::NameCollision(ref name) if name == "foo-bar"));
    let rs = h.cluster.replicaset("default", "foo-bar").unwrap();
    assert!(is_owned_by(&rs, "someone-else"), "foreign object untouched");
}

#[tokio::test]
async fn test_already_exists_adopts_owned_child() {
    let cluster = FakeCluster::default()
        .with_experiment(experiment())
        .with_unlisted_replicaset(replicaset("foo-bar", Some("foo-uid"), "bar"));
    let h = Harness::new(cluster);

    h.sync().await;

    let status = h.experiment().status.unwrap();
    assert_eq!(status.template_statuses[0].replica_set.as_deref(), Some("foo-bar"));
    assert_eq!(h.cluster.replicaset_names(), vec!["foo-bar".to_string()]);
}

#[tokio::test]
async fn test_orphans_kept_while_active_deleted_on_cleanup() {
    let cluster = FakeCluster::default()
        .with_experiment(experiment())
        .with_replicaset(replicaset("foo-old", Some("foo-uid"), "old"));
    let h = Harness::new(cluster);
    h.run_to_running().await;
    assert!(h.cluster.replicaset("default", "foo-old").is_some());

    h.edit(|exp| exp.spec.terminate = true);
    h.sync().await;
    h.sync().await;

    assert!(h.cluster.replicaset("default", "foo-old").is_none());
    assert!(h
        .cluster
        .actions()
        .contains(&ClusterAction::DeleteReplicaSet("foo-old".to_string())));
    assert!(h
        .publisher
        .reasons()
        .contains(&reasons::DELETING_REPLICASET.to_string()));
}

#[tokio::test]
async fn test_template_change_updates_in_place() {
    let h = Harness::new(FakeCluster::default().with_experiment(experiment()));
    h.run_to_running().await;
    let before = h.cluster.replicaset("default", "foo-bar").unwrap();

    h.edit(|exp| {
        let pod = exp.spec.templates[0].template.spec.as_mut().unwrap();
        pod.containers[0].image = Some("nginx:1.27".to_string());
    });
    h.sync().await;

    assert_eq!(
        h.cluster.actions()[0],
        ClusterAction::UpdateReplicaSet {
            name: "foo-bar".to_string(),
            replicas: 1
        }
    );
    let after = h.cluster.replicaset("default", "foo-bar").unwrap();
    assert_ne!(
        after.annotations().get(TEMPLATE_HASH_ANNOTATION),
        before.annotations().get(TEMPLATE_HASH_ANNOTATION)
    );
    assert_eq!(
        after.spec.as_ref().unwrap().selector,
        before.spec.as_ref().unwrap().selector
    );
    assert!(h
        .publisher
        .reasons()
        .contains(&reasons::EXPERIMENT_UPDATED.to_string()));
}

// ---- sync: notification failures ----

#[tokio::test]
async fn test_notification_failure_isolated_by_default() {
    let exp = experiment_with(|e| subscribe(e, "on-running", "ops"));
    let h = Harness::new(FakeCluster::default().with_experiment(exp));
    h.notifications.sender.fail_with("connection refused");

    h.sync().await;
    h.cluster.mark_ready("default", "foo-bar");
    h.controller.sync(&key()).await.expect("failure is isolated");

    let status = h.experiment().status.unwrap();
    assert_eq!(status.phase, Some(Phase::Running));
    let last = status.conditions.last().unwrap();
    assert_eq!(last.type_, ConditionType::NotificationDelivery);
    assert_eq!(last.status, ConditionStatus::False);
    assert!(last.message.contains("connection refused"));
    assert!(h
        .publisher
        .reasons()
        .contains(&reasons::NOTIFICATION_FAILED.to_string()));

    // the appended condition does not cause another write
    h.cluster.clear_actions();
    h.sync().await;
    assert!(h.cluster.actions().is_empty());
}

#[tokio::test]
async fn test_notification_failure_propagated_when_configured() {
    let exp = experiment_with(|e| subscribe(e, "on-running", "ops"));
    let config = ControllerConfig {
        notification_failures: NotificationFailurePolicy::Propagate,
        ..ControllerConfig::default()
    };
    let h = Harness::with(
        FakeCluster::default().with_experiment(exp),
        StaticReferences::default(),
        config,
    );
    h.notifications.sender.fail_with("connection refused");

    h.sync().await;
    h.cluster.mark_ready("default", "foo-bar");
    let err = h.controller.sync(&key()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Notification(_)));
    // status was written before events
    assert_eq!(h.phase(), Some(Phase::Running));
}

// ---- phase state machine ----

fn ready(name: &str) -> TemplateStatus {
    TemplateStatus {
        name: name.to_string(),
        replica_set: Some(format!("foo-{name}")),
        desired_replicas: 1,
        updated_replicas: 1,
        ready_replicas: 1,
        available_replicas: 1,
        status: TemplateStatusCode::Running,
    }
}

fn not_ready(name: &str) -> TemplateStatus {
    TemplateStatus {
        ready_replicas: 0,
        available_replicas: 0,
        status: TemplateStatusCode::Progressing,
        ..ready(name)
    }
}

fn inputs(previous: Option<Phase>, templates: &[TemplateStatus]) -> PhaseInputs<'_> {
    PhaseInputs {
        previous,
        spec_invalid: false,
        terminate: false,
        duration_elapsed: false,
        analysis: None,
        templates,
    }
}

#[test]
fn test_next_phase_progression() {
    let waiting = [not_ready("a"), ready("b")];
    let all = [ready("a"), ready("b")];

    assert_eq!(next_phase(inputs(None, &waiting)), Phase::Pending);
    assert_eq!(next_phase(inputs(Some(Phase::Pending), &all)), Phase::Running);
    assert_eq!(
        next_phase(inputs(Some(Phase::Running), &waiting)),
        Phase::Running,
        "never back to Pending"
    );
}

#[test]
fn test_next_phase_terminal_absorbs() {
    let all = [ready("a")];
    for terminal in [Phase::Successful, Phase::Failed, Phase::Error] {
        let mut i = inputs(Some(terminal), &all);
        i.terminate = true;
        i.analysis = Some(AnalysisOutcome::Successful);
        assert_eq!(next_phase(i), terminal);
    }
}

#[test]
fn test_next_phase_spec_error_wins() {
    let mut i = inputs(Some(Phase::Running), &[]);
    i.spec_invalid = true;
    assert_eq!(next_phase(i), Phase::Error);
}

#[test]
fn test_next_phase_terminating_waits_for_scale_down() {
    let draining = [TemplateStatus {
        desired_replicas: 0,
        ..ready("a")
    }];
    let drained = [TemplateStatus {
        desired_replicas: 0,
        ready_replicas: 0,
        available_replicas: 0,
        ..ready("a")
    }];

    assert_eq!(
        next_phase(inputs(Some(Phase::Terminating), &draining)),
        Phase::Terminating
    );
    assert_eq!(
        next_phase(inputs(Some(Phase::Terminating), &drained)),
        Phase::Successful
    );

    let mut failed = inputs(Some(Phase::Terminating), &drained);
    failed.analysis = Some(AnalysisOutcome::Failed);
    assert_eq!(next_phase(failed), Phase::Failed);
}

#[test]
fn test_next_phase_duration_elapsed() {
    let all = [ready("a")];
    let mut i = inputs(Some(Phase::Running), &all);
    i.duration_elapsed = true;
    assert_eq!(next_phase(i), Phase::Terminating);
}

#[test]
fn test_phase_ordering_is_monotonic_for_forward_moves() {
    let all = [ready("a")];
    let previous = Phase::Running;
    let mut i = inputs(Some(previous), &all);
    i.terminate = true;
    assert!(next_phase(i).rank() > previous.rank());
}

// ---- status ----

#[test]
fn test_status_patch_none_when_unchanged() {
    let exp = experiment();
    let now = ManualClock::fixed().now();
    let status = compute_status(&exp, Phase::Pending, "m".to_string(), vec![], now);
    assert_eq!(status_patch(Some(&status), &status).unwrap(), None);

    let full = status_patch(None, &status).unwrap().unwrap();
    assert_eq!(full["status"]["phase"], "Pending");
    assert_eq!(full["status"]["startedAt"], "2024-01-01T00:00:00Z");
}

#[test]
fn test_requeue_after() {
    let now = ManualClock::fixed().now();
    let resync = Duration::from_secs(300);
    let term = Duration::from_secs(5);

    assert_eq!(requeue_after(Phase::Successful, None, now, resync, term), None);
    assert_eq!(
        requeue_after(Phase::Terminating, None, now, resync, term),
        Some(term)
    );
    assert_eq!(
        requeue_after(Phase::Running, None, now, resync, term),
        Some(resync)
    );
    let past = now - chrono::Duration::seconds(10);
    assert_eq!(
        requeue_after(Phase::Running, Some(past), now, resync, term),
        Some(Duration::from_secs(1)),
        "expired deadlines still wait at least a second"
    );
}

// ---- fleet helpers ----

#[test]
fn test_pod_template_hash_is_stable_and_sensitive() {
    let exp = experiment();
    let template = &exp.spec.templates[0].template;

    let first = compute_pod_template_hash(template).unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(first, compute_pod_template_hash(template).unwrap());

    let mut changed = template.clone();
    changed.spec.as_mut().unwrap().containers[0].image = Some("nginx:1.27".to_string());
    assert_ne!(first, compute_pod_template_hash(&changed).unwrap());
}

#[test]
fn test_build_replicaset_requires_uid() {
    let exp = experiment_with(|e| e.metadata.uid = None);
    let err = build_replicaset(&exp, &exp.spec.templates[0], 1).unwrap_err();
    assert!(matches!(err, ReconcileError::MissingUid(_)));
}

#[test]
fn test_template_status_without_child() {
    let missing = template_status("bar", None, 2);
    assert_eq!(missing.status, TemplateStatusCode::Progressing);
    assert!(!missing.is_ready());

    let cleaned = template_status("bar", None, 0);
    assert_eq!(cleaned.status, TemplateStatusCode::ScaledDown);
}

// ---- spec validation ----

fn error_paths(exp: &Experiment) -> Vec<(String, FieldErrorKind)> {
    validate_experiment_spec(exp)
        .into_iter()
        .map(|e| (e.path.to_string(), e.kind))
        .collect()
}

#[test]
fn test_valid_spec_has_no_errors() {
    assert!(validate_experiment_spec(&experiment()).is_empty());
}

#[test]
fn test_validation_collects_every_error() {
    let exp = experiment_with(|e| {
        let mut dup = e.spec.templates[0].clone();
        dup.replicas = -1;
        dup.weight = Some(150);
        e.spec.templates.push(dup);
        e.spec.duration = Some("0s".to_string());
    });

    assert_eq!(
        error_paths(&exp),
        vec![
            ("spec.templates[1].name".to_string(), FieldErrorKind::Duplicate),
            ("spec.templates[1].replicas".to_string(), FieldErrorKind::Invalid),
            ("spec.templates[1].weight".to_string(), FieldErrorKind::Invalid),
            ("spec.duration".to_string(), FieldErrorKind::Invalid),
        ]
    );
}

#[test]
fn test_validation_selector_must_match_labels() {
    let exp = experiment_with(|e| {
        e.spec.templates[0].selector.match_labels =
            Some([("app".to_string(), "other".to_string())].into());
    });
    let errors = validate_experiment_spec(&exp);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].to_string(),
        "spec.templates[0].selector: Invalid value: `selector` does not match template `labels`"
    );
}

#[test]
fn test_validation_experiment_name_fits_label_value() {
    let at_limit = experiment_with(|e| e.metadata.name = Some("e".repeat(63)));
    assert!(validate_experiment_spec(&at_limit).is_empty());

    let too_long = experiment_with(|e| e.metadata.name = Some("e".repeat(64)));
    assert_eq!(
        error_paths(&too_long),
        vec![("metadata.name".to_string(), FieldErrorKind::Invalid)]
    );
}

#[test]
fn test_validation_template_name_must_be_dns_label() {
    let exp = experiment_with(|e| e.spec.templates[0].name = "Bar_1".to_string());
    assert_eq!(
        error_paths(&exp),
        vec![("spec.templates[0].name".to_string(), FieldErrorKind::Invalid)]
    );
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
    assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
    assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    assert_eq!(parse_duration(" 10s "), Some(Duration::from_secs(10)));
    assert_eq!(parse_duration("0s"), None);
    assert_eq!(parse_duration("86401s"), None);
    assert_eq!(parse_duration("169h"), None);
    assert_eq!(parse_duration("5d"), None);
    assert_eq!(parse_duration("abc"), None);
    assert_eq!(parse_duration(""), None);
}

// ---- keys and back-off ----

#[test]
fn test_experiment_key_parse() {
    let key: ExperimentKey = "default/foo".parse().unwrap();
    assert_eq!(key, ExperimentKey::new("default", "foo"));
    assert_eq!(key.to_string(), "default/foo");

    for bad in ["foo", "/foo", "default/", "a/b/c"] {
        assert!(
            matches!(bad.parse::<ExperimentKey>(), Err(ReconcileError::InvalidKey(_))),
            "{bad}"
        );
    }
}

#[test]
fn test_retry_backoff_doubles_caps_and_resets() {
    let backoff = RetryBackoff::new(Duration::from_secs(5), Duration::from_secs(30));

    let delays: Vec<u64> = (0..5)
        .map(|_| backoff.next_delay("default/foo").as_secs())
        .collect();
    assert_eq!(delays, vec![5, 10, 20, 30, 30]);

    assert_eq!(backoff.next_delay("default/other"), Duration::from_secs(5));

    backoff.reset("default/foo");
    assert_eq!(backoff.next_delay("default/foo"), Duration::from_secs(5));
}

#[test]
fn test_sync_outcome_action() {
    use kube::runtime::controller::Action;
    assert_eq!(
        SyncOutcome::after(Duration::from_secs(7)).action(),
        Action::requeue(Duration::from_secs(7))
    );
    assert_eq!(SyncOutcome::done().action(), Action::await_change());
}
