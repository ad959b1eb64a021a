use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Rollout as seen by the reference validator
///
/// Follows the Argo Rollouts API. Only the strategy fields that point at
/// other cluster objects (services, ingresses, virtual services, analysis
/// templates) are modelled; the strategy engine itself lives elsewhere.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kulta.io",
    version = "v1alpha1",
    kind = "Rollout",
    namespaced
)]
pub struct RolloutSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,

    #[serde(default)]
    pub strategy: RolloutStrategy,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RolloutStrategy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStrategy>,

    #[serde(rename = "blueGreen", skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct BlueGreenStrategy {
    /// Service that receives production traffic
    #[serde(rename = "activeService")]
    pub active_service: String,

    /// Service for previewing the new version before promotion
    #[serde(rename = "previewService", default)]
    pub preview_service: String,

    #[serde(
        rename = "prePromotionAnalysis",
        skip_serializing_if = "Option::is_none"
    )]
    pub pre_promotion_analysis: Option<RolloutAnalysis>,

    #[serde(
        rename = "postPromotionAnalysis",
        skip_serializing_if = "Option::is_none"
    )]
    pub post_promotion_analysis: Option<RolloutAnalysis>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryStrategy {
    /// Service pointing at canary pods
    #[serde(rename = "canaryService", default)]
    pub canary_service: String,

    /// Service pointing at stable pods
    #[serde(rename = "stableService", default)]
    pub stable_service: String,

    #[serde(default)]
    pub steps: Vec<CanaryStep>,

    #[serde(rename = "trafficRouting", skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<TrafficRouting>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryStep {
    /// Set the percentage of traffic to route to canary
    #[serde(rename = "setWeight", skip_serializing_if = "Option::is_none")]
    pub set_weight: Option<i32>,

    /// Pause the rollout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseDuration>,

    /// Run an analysis before moving to the next step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<RolloutAnalysis>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct PauseDuration {
    /// If not specified, pauses indefinitely until manually resumed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RolloutAnalysis {
    #[serde(default)]
    pub templates: Vec<AnalysisTemplateRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AnalysisTemplateRef {
    #[serde(rename = "templateName")]
    pub template_name: String,

    #[serde(
        rename = "clusterScope",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub cluster_scope: bool,
}

/// Traffic providers, checked in field order
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TrafficRouting {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx: Option<NginxTrafficRouting>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alb: Option<AlbTrafficRouting>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub istio: Option<IstioTrafficRouting>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct NginxTrafficRouting {
    /// Ingress that routes to the stable service
    #[serde(rename = "stableIngress")]
    pub stable_ingress: String,

    #[serde(rename = "annotationPrefix", skip_serializing_if = "Option::is_none")]
    pub annotation_prefix: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AlbTrafficRouting {
    /// Ingress that routes to the stable service
    pub ingress: String,

    #[serde(rename = "servicePort")]
    pub service_port: i32,

    #[serde(rename = "rootService", skip_serializing_if = "Option::is_none")]
    pub root_service: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct IstioTrafficRouting {
    #[serde(rename = "virtualService")]
    pub virtual_service: IstioVirtualService,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct IstioVirtualService {
    pub name: String,

    /// Named HTTP routes to manipulate; empty means the single unnamed route
    #[serde(default)]
    pub routes: Vec<String>,
}

impl Rollout {
    pub fn canary(&self) -> Option<&CanaryStrategy> {
        self.spec.strategy.canary.as_ref()
    }

    pub fn traffic_routing(&self) -> Option<&TrafficRouting> {
        self.canary().and_then(|c| c.traffic_routing.as_ref())
    }
}

#[cfg(test)]
#[path = "rollout_test.rs"]
mod tests;
