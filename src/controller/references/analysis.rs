use crate::controller::field::{FieldError, FieldPath};
use crate::crd::analysis::{AnalysisTemplate, AnalysisTemplateSpec, ClusterAnalysisTemplate};
use kube::ResourceExt;

/// Where in the referencing object an analysis template was named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOrigin {
    PrePromotion,
    PostPromotion,
    CanaryStep(usize),
    Experiment(usize),
}

impl AnalysisOrigin {
    pub fn field_path(self) -> FieldPath {
        match self {
            AnalysisOrigin::PrePromotion => {
                FieldPath::new(["spec", "strategy", "blueGreen", "prePromotionAnalysis", "templates"])
            }
            AnalysisOrigin::PostPromotion => {
                FieldPath::new(["spec", "strategy", "blueGreen", "postPromotionAnalysis", "templates"])
            }
            AnalysisOrigin::CanaryStep(i) => FieldPath::new(["spec", "strategy", "canary", "steps"])
                .index(i)
                .child("analysis")
                .child("templates"),
            AnalysisOrigin::Experiment(i) => FieldPath::new(["spec", "analyses"]).index(i),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResolvedTemplate {
    Namespaced(AnalysisTemplate),
    Cluster(ClusterAnalysisTemplate),
}

impl ResolvedTemplate {
    pub fn name(&self) -> String {
        match self {
            ResolvedTemplate::Namespaced(t) => t.name_any(),
            ResolvedTemplate::Cluster(t) => t.name_any(),
        }
    }

    pub fn spec(&self) -> &AnalysisTemplateSpec {
        match self {
            ResolvedTemplate::Namespaced(t) => &t.spec,
            ResolvedTemplate::Cluster(t) => &t.spec.template,
        }
    }
}

/// A resolved analysis template tagged with where it was referenced from
#[derive(Debug, Clone)]
pub struct AnalysisTemplateWithType {
    pub template: ResolvedTemplate,
    pub origin: AnalysisOrigin,
}

/// Every metric must terminate on its own
pub fn validate_analysis_template(with_type: &AnalysisTemplateWithType) -> Vec<FieldError> {
    let path = with_type.origin.field_path();
    let name = with_type.template.name();

    with_type
        .template
        .spec()
        .metrics
        .iter()
        .filter(|metric| metric.effective_count().is_none())
        .map(|metric| {
            FieldError::forbidden(
                path.clone(),
                format!(
                    "AnalysisTemplate {} has metric {} which runs indefinitely",
                    name, metric.name
                ),
            )
        })
        .collect()
}
