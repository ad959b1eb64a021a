use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AnalysisTemplate describes the metrics an analysis run measures
///
/// Only the shape needed to decide whether a run terminates is modelled;
/// provider specifics are carried opaquely.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kulta.io",
    version = "v1alpha1",
    kind = "AnalysisTemplate",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct AnalysisTemplateSpec {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

/// ClusterAnalysisTemplate is the cluster-scoped variant of AnalysisTemplate
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kulta.io",
    version = "v1alpha1",
    kind = "ClusterAnalysisTemplate",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ClusterAnalysisTemplateSpec {
    #[serde(flatten)]
    pub template: AnalysisTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Metric {
    pub name: String,

    /// Time between measurements (e.g. "30s"); empty means measure once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Number of measurements to take
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,

    /// Condition evaluated against each measurement
    #[serde(rename = "successCondition", skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,

    #[serde(rename = "failureLimit", skip_serializing_if = "Option::is_none")]
    pub failure_limit: Option<i32>,

    /// Metric provider configuration (prometheus, web, job, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<std::collections::BTreeMap<String, serde_json::Value>>")]
    pub provider: Option<serde_json::Value>,
}

impl Metric {
    /// How many times the metric is measured
    ///
    /// `None` means the metric keeps measuring until the run is stopped.
    /// A zero or negative `count` is the same as leaving it unset.
    pub fn effective_count(&self) -> Option<i32> {
        match (self.count.filter(|c| *c > 0), self.interval.as_deref()) {
            (Some(count), _) => Some(count),
            (None, None) | (None, Some("")) => Some(1),
            (None, Some(_)) => None,
        }
    }
}
