use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Experiment is an ephemeral, multi-template workload
///
/// Each template runs as its own ReplicaSet owned by the Experiment. Typical
/// use is running a baseline and a canary side by side while an analysis
/// compares them.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kulta.io",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    shortname = "exp",
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Duration", "type":"string", "jsonPath":".spec.duration"}"#,
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.availableAt"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// Templates to run, one ReplicaSet each
    pub templates: Vec<TemplateSpec>,

    /// How long the experiment runs before it is terminated (e.g. "30s", "5m", "2h")
    /// If not specified, runs until terminated or the analysis concludes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Scale the experiment down and finish it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminate: bool,

    /// Analyses that gate this experiment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analyses: Vec<ExperimentAnalysis>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct TemplateSpec {
    /// Unique name of the template within the experiment
    pub name: String,

    /// Number of desired pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Label selector for pods; matchLabels must be present on the pod template
    pub selector: LabelSelector,

    /// Template describes the pods that will be created
    pub template: PodTemplateSpec,

    /// Traffic weight percentage for this variant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

fn default_replicas() -> i32 {
    1
}

/// Reference to an AnalysisTemplate (or ClusterAnalysisTemplate) run alongside the experiment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentAnalysis {
    /// Name of the analysis within the experiment
    pub name: String,

    /// Name of the referenced template
    #[serde(rename = "templateName")]
    pub template_name: String,

    /// Look up a ClusterAnalysisTemplate instead of a namespaced AnalysisTemplate
    #[serde(
        rename = "clusterScope",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub cluster_scope: bool,
}

/// Phase of an Experiment
///
/// Phases only move forward: Pending → Running → Terminating →
/// Successful | Failed. Error is entered from anywhere on an invalid spec.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum Phase {
    /// Children are being created or are not ready yet
    Pending,
    /// Every template has its desired ready replicas
    Running,
    /// Analysis (or termination) concluded successfully
    Successful,
    /// Analysis concluded unsuccessfully
    Failed,
    /// The spec cannot be reconciled
    Error,
    /// Terminate requested or duration elapsed, children scaling down
    Terminating,
}

impl Phase {
    /// Terminal phases are never left
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Successful | Phase::Failed | Phase::Error)
    }

    /// Children keep their desired replicas only while active
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Pending | Phase::Running)
    }

    pub(crate) fn rank(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Running => 1,
            Phase::Terminating => 2,
            Phase::Successful | Phase::Failed | Phase::Error => 3,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Successful => "Successful",
            Phase::Failed => "Failed",
            Phase::Error => "Error",
            Phase::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

/// Per-template status code
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TemplateStatusCode {
    /// ReplicaSet is missing or has fewer ready replicas than desired
    #[default]
    Progressing,
    /// ReplicaSet has all desired replicas ready
    Running,
    /// ReplicaSet was scaled to zero during cleanup
    ScaledDown,
}

/// Observed state of one template's ReplicaSet
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TemplateStatus {
    pub name: String,

    /// Name of the ReplicaSet backing the template
    #[serde(rename = "replicaSet", skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<String>,

    #[serde(rename = "desiredReplicas", default)]
    pub desired_replicas: i32,

    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,

    #[serde(default)]
    pub status: TemplateStatusCode,
}

impl TemplateStatus {
    pub fn is_ready(&self) -> bool {
        self.replica_set.is_some() && self.ready_replicas >= self.desired_replicas
    }

    pub fn is_available(&self) -> bool {
        self.replica_set.is_some() && self.available_replicas >= self.desired_replicas
    }

    /// Nothing left running for this template
    pub fn is_scaled_down(&self) -> bool {
        self.desired_replicas == 0 && self.ready_replicas == 0 && self.available_replicas == 0
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// Experiment is pending, running or terminating
    Progressing,
    /// Experiment reached Successful or Failed
    Completed,
    /// Spec failed validation
    InvalidSpec,
    /// A lifecycle notification could not be delivered
    NotificationDelivery,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One entry in the append-only condition history
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// RFC3339 timestamp of the transition
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// Status of the Experiment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(rename = "templateStatuses", default, skip_serializing_if = "Vec::is_empty")]
    pub template_statuses: Vec<TemplateStatus>,

    /// When the controller first picked up the experiment (RFC3339)
    /// Duration is measured from here
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// When every template first became available (RFC3339)
    #[serde(rename = "availableAt", skip_serializing_if = "Option::is_none")]
    pub available_at: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ExperimentCondition>,

    /// Last spec generation fully reconciled
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;
