use super::client::ExperimentClient;
use super::reconcile::ReconcileError;
use crate::controller::client::ClientError;
use crate::controller::events::reasons;
use crate::crd::experiment::{Experiment, Phase, TemplateSpec, TemplateStatus, TemplateStatusCode};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Marks ReplicaSets managed by this controller
pub const MANAGED_LABEL: &str = "experiments.kulta.io/managed";
pub const EXPERIMENT_LABEL: &str = "experiments.kulta.io/experiment";
pub const TEMPLATE_LABEL: &str = "experiments.kulta.io/template";
pub const TEMPLATE_HASH_ANNOTATION: &str = "experiments.kulta.io/template-hash";

/// Label selector for watching managed ReplicaSets
pub const MANAGED_SELECTOR: &str = "experiments.kulta.io/managed=true";

/// Compute a stable 10-character hash for a PodTemplateSpec
///
/// FNV-1a over the JSON encoding, so the value is identical across
/// processes and restarts (unlike `DefaultHasher`).
pub fn compute_pod_template_hash(template: &PodTemplateSpec) -> Result<String, ReconcileError> {
    let json = serde_json::to_string(template)?;

    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in json.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    Ok(format!("{hash:016x}")[..10].to_string())
}

/// Name of the ReplicaSet backing `template`
pub fn child_name(experiment: &str, template: &str) -> String {
    format!("{}-{}", experiment, template)
}

/// True if `rs` has a controller owner reference with `uid`
pub fn is_owned_by(rs: &ReplicaSet, uid: &str) -> bool {
    rs.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

/// Build the desired ReplicaSet for one template
///
/// Pod labels are the template's labels plus the three management labels.
/// The selector is the template's selector plus the template label, so
/// sibling templates with identical labels never select each other's pods.
pub fn build_replicaset(
    experiment: &Experiment,
    template: &TemplateSpec,
    replicas: i32,
) -> Result<ReplicaSet, ReconcileError> {
    let experiment_name = experiment.name_any();
    let owner = experiment
        .controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::MissingUid(experiment_name.clone()))?;
    let hash = compute_pod_template_hash(&template.template)?;

    let mut pod_template = template.template.clone();
    let mut labels = pod_template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(EXPERIMENT_LABEL.to_string(), experiment_name.clone());
    labels.insert(TEMPLATE_LABEL.to_string(), template.name.clone());

    let mut pod_metadata = pod_template.metadata.take().unwrap_or_default();
    pod_metadata.labels = Some(labels.clone());
    pod_template.metadata = Some(pod_metadata);

    let mut match_labels = template.selector.match_labels.clone().unwrap_or_default();
    match_labels.insert(TEMPLATE_LABEL.to_string(), template.name.clone());
    let selector = LabelSelector {
        match_labels: Some(match_labels),
        match_expressions: template.selector.match_expressions.clone(),
    };

    Ok(ReplicaSet {
        metadata: ObjectMeta {
            name: Some(child_name(&experiment_name, &template.name)),
            namespace: experiment.namespace(),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                TEMPLATE_HASH_ANNOTATION.to_string(),
                hash,
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(replicas),
            selector,
            template: Some(pod_template),
            ..Default::default()
        }),
        status: None,
    })
}

/// A fleet change worth an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetEvent {
    pub reason: &'static str,
    pub message: String,
}

impl FleetEvent {
    fn new(reason: &'static str, message: String) -> Self {
        Self { reason, message }
    }
}

/// Result of one pass over the children
#[derive(Debug, Default)]
pub struct FleetReport {
    /// One entry per template, in spec order
    pub statuses: Vec<TemplateStatus>,
    pub events: Vec<FleetEvent>,
}

/// Snapshot of a template's child, or of its absence
pub fn template_status(name: &str, rs: Option<&ReplicaSet>, desired: i32) -> TemplateStatus {
    let Some(rs) = rs else {
        return TemplateStatus {
            name: name.to_string(),
            desired_replicas: desired,
            status: if desired == 0 {
                TemplateStatusCode::ScaledDown
            } else {
                TemplateStatusCode::Progressing
            },
            ..Default::default()
        };
    };

    let live = rs.status.clone().unwrap_or_default();
    let mut status = TemplateStatus {
        name: name.to_string(),
        replica_set: Some(rs.name_any()),
        desired_replicas: desired,
        updated_replicas: live.fully_labeled_replicas.unwrap_or(live.replicas),
        ready_replicas: live.ready_replicas.unwrap_or(0),
        available_replicas: live.available_replicas.unwrap_or(0),
        status: TemplateStatusCode::Progressing,
    };
    status.status = if status.is_scaled_down() {
        TemplateStatusCode::ScaledDown
    } else if status.is_ready() {
        TemplateStatusCode::Running
    } else {
        TemplateStatusCode::Progressing
    };
    status
}

fn replicas_of(rs: &ReplicaSet) -> i32 {
    rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

fn hash_of(rs: &ReplicaSet) -> Option<&str> {
    rs.annotations()
        .get(TEMPLATE_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Drive the owned ReplicaSets toward `experiment.spec.templates`
///
/// `phase` is the persisted phase. While it is Pending or Running every
/// template gets its desired replicas; otherwise every child is scaled to
/// zero, nothing is created and orphans are deleted. Missing children are
/// not created once `spec.terminate` is set.
pub async fn reconcile_children(
    client: &dyn ExperimentClient,
    experiment: &Experiment,
    phase: Phase,
) -> Result<FleetReport, ReconcileError> {
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = experiment.name_any();
    let uid = experiment
        .uid()
        .ok_or_else(|| ReconcileError::MissingUid(name.clone()))?;
    let cleanup = !phase.is_active();

    let mut owned: Vec<ReplicaSet> = client
        .list_replicasets(&namespace)
        .await?
        .into_iter()
        .filter(|rs| is_owned_by(rs, &uid))
        .collect();
    owned.sort_by_key(|rs| rs.name_any());

    let mut report = FleetReport::default();
    for template in &experiment.spec.templates {
        let desired = if cleanup { 0 } else { template.replicas };
        let current = take_child(&mut owned, &name, &template.name);

        let snapshot = match current {
            Some(rs) => {
                sync_child(client, experiment, template, rs, desired, cleanup, &mut report).await?
            }
            // a terminating experiment never gains children
            None if cleanup || experiment.spec.terminate => None,
            None => create_child(client, experiment, template, desired, &uid, &mut report).await?,
        };
        report
            .statuses
            .push(template_status(&template.name, snapshot.as_ref(), desired));
    }

    // whatever is left is an extra or belongs to a removed template
    for orphan in owned {
        let orphan_name = orphan.name_any();
        if phase.is_active() {
            debug!(experiment = ?name, replicaset = ?orphan_name, "Keeping orphan while active");
            continue;
        }
        client.delete_replicaset(&namespace, &orphan_name).await?;
        info!(experiment = ?name, replicaset = ?orphan_name, "Deleted orphaned ReplicaSet");
        report.events.push(FleetEvent::new(
            reasons::DELETING_REPLICASET,
            format!("Deleted ReplicaSet {}", orphan_name),
        ));
    }

    Ok(report)
}

/// Remove and return the child for `template` from `owned`
///
/// The conventionally named child wins; otherwise the first owned
/// ReplicaSet carrying the template label.
fn take_child(owned: &mut Vec<ReplicaSet>, experiment: &str, template: &str) -> Option<ReplicaSet> {
    let expected = child_name(experiment, template);
    let position = owned
        .iter()
        .position(|rs| rs.name_any() == expected)
        .or_else(|| {
            owned.iter().position(|rs| {
                rs.labels().get(TEMPLATE_LABEL).map(String::as_str) == Some(template)
            })
        })?;
    Some(owned.remove(position))
}

async fn create_child(
    client: &dyn ExperimentClient,
    experiment: &Experiment,
    template: &TemplateSpec,
    desired: i32,
    uid: &str,
    report: &mut FleetReport,
) -> Result<Option<ReplicaSet>, ReconcileError> {
    let rs = build_replicaset(experiment, template, desired)?;
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let rs_name = rs.name_any();

    match client.create_replicaset(&namespace, &rs).await {
        Ok(created) => {
            info!(
                experiment = ?experiment.name_any(),
                replicaset = ?rs_name,
                replicas = desired,
                "Created ReplicaSet"
            );
            report.events.push(FleetEvent::new(
                reasons::SCALING_REPLICASET,
                format!("Created ReplicaSet {} with {} replicas", rs_name, desired),
            ));
            Ok(Some(created))
        }
        Err(ClientError::AlreadyExists(_)) => {
            // the cache is behind; trust the server
            match client.get_replicaset(&namespace, &rs_name).await? {
                Some(existing) if is_owned_by(&existing, uid) => {
                    debug!(replicaset = ?rs_name, "Adopting existing ReplicaSet state");
                    Ok(Some(existing))
                }
                Some(_) => Err(ReconcileError::NameCollision(rs_name)),
                None => Err(ClientError::Conflict(rs_name).into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn sync_child(
    client: &dyn ExperimentClient,
    experiment: &Experiment,
    template: &TemplateSpec,
    current: ReplicaSet,
    desired: i32,
    cleanup: bool,
    report: &mut FleetReport,
) -> Result<Option<ReplicaSet>, ReconcileError> {
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let rs_name = current.name_any();
    let current_replicas = replicas_of(&current);
    let expected_hash = compute_pod_template_hash(&template.template)?;
    let template_changed = !cleanup && hash_of(&current) != Some(expected_hash.as_str());

    if template_changed {
        let built = build_replicaset(experiment, template, desired)?;
        let mut updated = current.clone();
        updated.metadata.labels = built.metadata.labels;
        updated
            .annotations_mut()
            .insert(TEMPLATE_HASH_ANNOTATION.to_string(), expected_hash);
        if let (Some(spec), Some(built_spec)) = (updated.spec.as_mut(), built.spec) {
            // selector is immutable
            spec.template = built_spec.template;
            spec.replicas = Some(desired);
        }
        let written = client.update_replicaset(&namespace, &updated).await?;
        info!(replicaset = ?rs_name, replicas = desired, "Updated ReplicaSet pod template");
        report.events.push(FleetEvent::new(
            reasons::EXPERIMENT_UPDATED,
            format!("Updated ReplicaSet {} pod template", rs_name),
        ));
        return Ok(Some(written));
    }

    if current_replicas != desired {
        let mut scaled = current.clone();
        if let Some(spec) = scaled.spec.as_mut() {
            spec.replicas = Some(desired);
        } else {
            warn!(replicaset = ?rs_name, "ReplicaSet has no spec, skipping scale");
            return Ok(Some(current));
        }
        let written = client.update_replicaset(&namespace, &scaled).await?;
        info!(
            replicaset = ?rs_name,
            from = current_replicas,
            to = desired,
            "Scaled ReplicaSet"
        );
        report.events.push(FleetEvent::new(
            reasons::SCALING_REPLICASET,
            format!(
                "Scaled ReplicaSet {} from {} to {}",
                rs_name, current_replicas, desired
            ),
        ));
        return Ok(Some(written));
    }

    debug!(replicaset = ?rs_name, replicas = desired, "ReplicaSet up to date");
    Ok(Some(current))
}
