use super::analysis::{AnalysisOrigin, AnalysisTemplateWithType, ResolvedTemplate};
use super::ReferenceLister;
use crate::controller::client::ClientError;
use crate::controller::field::{FieldError, FieldPath};
use crate::crd::experiment::Experiment;
use crate::crd::rollout::{AnalysisTemplateRef, Rollout};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::DynamicObject;
use kube::ResourceExt;

/// Everything a Rollout or Experiment references, resolved for one cycle
#[derive(Debug, Clone, Default)]
pub struct ReferenceBundle {
    pub analysis_templates: Vec<AnalysisTemplateWithType>,
    pub ingresses: Vec<Ingress>,
    pub virtual_services: Vec<DynamicObject>,
}

/// Resolve the references of a Rollout
///
/// Missing objects are reported as `NotFound` field errors next to the
/// partial bundle; only API failures abort.
pub async fn build_rollout_bundle(
    lister: &dyn ReferenceLister,
    rollout: &Rollout,
) -> Result<(ReferenceBundle, Vec<FieldError>), ClientError> {
    let namespace = rollout.namespace().unwrap_or_default();
    let mut bundle = ReferenceBundle::default();
    let mut errors = Vec::new();

    if let Some(bg) = &rollout.spec.strategy.blue_green {
        let stages = [
            (AnalysisOrigin::PrePromotion, &bg.pre_promotion_analysis),
            (AnalysisOrigin::PostPromotion, &bg.post_promotion_analysis),
        ];
        for (origin, analysis) in stages {
            for template_ref in analysis.iter().flat_map(|a| a.templates.iter()) {
                resolve_template(lister, &namespace, template_ref, origin, &mut bundle, &mut errors)
                    .await?;
            }
        }
    }

    if let Some(canary) = rollout.canary() {
        for (i, step) in canary.steps.iter().enumerate() {
            for template_ref in step.analysis.iter().flat_map(|a| a.templates.iter()) {
                resolve_template(
                    lister,
                    &namespace,
                    template_ref,
                    AnalysisOrigin::CanaryStep(i),
                    &mut bundle,
                    &mut errors,
                )
                .await?;
            }
        }

        let routing_path = FieldPath::new(["spec", "strategy", "canary", "trafficRouting"]);
        if let Some(routing) = &canary.traffic_routing {
            let ingress_ref = routing
                .nginx
                .as_ref()
                .map(|n| (n.stable_ingress.as_str(), routing_path.child("nginx").child("stableIngress")))
                .or_else(|| {
                    routing
                        .alb
                        .as_ref()
                        .map(|a| (a.ingress.as_str(), routing_path.child("alb").child("ingress")))
                });
            if let Some((name, path)) = ingress_ref {
                match lister.get_ingress(&namespace, name).await? {
                    Some(ingress) => bundle.ingresses.push(ingress),
                    None => errors.push(FieldError::not_found(
                        path,
                        name,
                        format!("ingress `{name}` not found"),
                    )),
                }
            }

            if let Some(istio) = &routing.istio {
                let name = istio.virtual_service.name.as_str();
                match lister.get_virtual_service(&namespace, name).await? {
                    Some(vsvc) => bundle.virtual_services.push(vsvc),
                    None => errors.push(FieldError::not_found(
                        routing_path
                            .child("istio")
                            .child("virtualService")
                            .child("name"),
                        name,
                        format!("VirtualService `{name}` not found"),
                    )),
                }
            }
        }
    }

    Ok((bundle, errors))
}

/// Resolve the analysis templates an Experiment references
pub async fn build_experiment_bundle(
    lister: &dyn ReferenceLister,
    experiment: &Experiment,
) -> Result<(ReferenceBundle, Vec<FieldError>), ClientError> {
    let namespace = experiment.namespace().unwrap_or_default();
    let mut bundle = ReferenceBundle::default();
    let mut errors = Vec::new();

    for (i, analysis) in experiment.spec.analyses.iter().enumerate() {
        let template_ref = AnalysisTemplateRef {
            template_name: analysis.template_name.clone(),
            cluster_scope: analysis.cluster_scope,
        };
        resolve_template(
            lister,
            &namespace,
            &template_ref,
            AnalysisOrigin::Experiment(i),
            &mut bundle,
            &mut errors,
        )
        .await?;
    }

    Ok((bundle, errors))
}

async fn resolve_template(
    lister: &dyn ReferenceLister,
    namespace: &str,
    template_ref: &AnalysisTemplateRef,
    origin: AnalysisOrigin,
    bundle: &mut ReferenceBundle,
    errors: &mut Vec<FieldError>,
) -> Result<(), ClientError> {
    let name = template_ref.template_name.as_str();
    let resolved = if template_ref.cluster_scope {
        lister
            .get_cluster_analysis_template(name)
            .await?
            .map(ResolvedTemplate::Cluster)
    } else {
        lister
            .get_analysis_template(namespace, name)
            .await?
            .map(ResolvedTemplate::Namespaced)
    };

    match resolved {
        Some(template) => bundle
            .analysis_templates
            .push(AnalysisTemplateWithType { template, origin }),
        None => {
            let kind = if template_ref.cluster_scope {
                "ClusterAnalysisTemplate"
            } else {
                "AnalysisTemplate"
            };
            errors.push(FieldError::not_found(
                origin.field_path(),
                name,
                format!("{kind} {name} not found"),
            ));
        }
    }
    Ok(())
}
