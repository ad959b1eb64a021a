//! Cross-resource reference validation
//!
//! Before acting, the controller resolves every object a Rollout or
//! Experiment points at (analysis templates, ingresses, Istio virtual
//! services) into a [`ReferenceBundle`] and checks the references for
//! consistency. Validation is pure and collects every error; lookups go
//! through the [`ReferenceLister`] seam.

mod analysis;
mod bundle;
mod ingress;
mod istio;

pub use analysis::{validate_analysis_template, AnalysisOrigin, AnalysisTemplateWithType, ResolvedTemplate};
pub use bundle::{build_experiment_bundle, build_rollout_bundle, ReferenceBundle};
pub use ingress::validate_ingress;
pub use istio::{validate_http_routes, validate_virtual_service, HttpRoute, IstioRouteError};

use crate::controller::client::ClientError;
use crate::controller::field::FieldError;
use crate::crd::analysis::{AnalysisTemplate, ClusterAnalysisTemplate};
use crate::crd::experiment::Experiment;
use crate::crd::rollout::Rollout;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tracing::debug;

/// Read access to the objects a Rollout or Experiment references
///
/// Absent objects are `Ok(None)`; only transport failures are errors.
#[async_trait]
pub trait ReferenceLister: Send + Sync {
    async fn get_analysis_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AnalysisTemplate>, ClientError>;

    async fn get_cluster_analysis_template(
        &self,
        name: &str,
    ) -> Result<Option<ClusterAnalysisTemplate>, ClientError>;

    async fn get_ingress(&self, namespace: &str, name: &str)
        -> Result<Option<Ingress>, ClientError>;

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClientError>;
}

/// Istio VirtualService, read untyped
pub fn virtual_service_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "networking.istio.io",
        "v1beta1",
        "VirtualService",
    ))
}

/// ReferenceLister backed by the API server
pub struct KubeReferenceLister {
    client: kube::Client,
    virtual_service: ApiResource,
}

impl KubeReferenceLister {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            virtual_service: virtual_service_resource(),
        }
    }
}

#[async_trait]
impl ReferenceLister for KubeReferenceLister {
    async fn get_analysis_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AnalysisTemplate>, ClientError> {
        let api: Api<AnalysisTemplate> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(name, e))
    }

    async fn get_cluster_analysis_template(
        &self,
        name: &str,
    ) -> Result<Option<ClusterAnalysisTemplate>, ClientError> {
        let api: Api<ClusterAnalysisTemplate> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(name, e))
    }

    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Ingress>, ClientError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(name, e))
    }

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClientError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.virtual_service);
        api.get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(name, e))
    }
}

/// Validate everything a Rollout references
pub fn validate_rollout_references(rollout: &Rollout, bundle: &ReferenceBundle) -> Vec<FieldError> {
    let mut errors = Vec::new();
    for template in &bundle.analysis_templates {
        errors.extend(validate_analysis_template(template));
    }
    for ingress in &bundle.ingresses {
        errors.extend(validate_ingress(rollout, ingress));
    }
    for vsvc in &bundle.virtual_services {
        errors.extend(validate_virtual_service(rollout, vsvc));
    }
    debug!(
        rollout = ?rollout.name_any(),
        errors = errors.len(),
        "Validated rollout references"
    );
    errors
}

/// Validate the analysis templates an Experiment references
pub fn validate_experiment_references(
    experiment: &Experiment,
    bundle: &ReferenceBundle,
) -> Vec<FieldError> {
    let errors: Vec<FieldError> = bundle
        .analysis_templates
        .iter()
        .flat_map(validate_analysis_template)
        .collect();
    debug!(
        experiment = ?experiment.name_any(),
        errors = errors.len(),
        "Validated experiment references"
    );
    errors
}

/// In-memory lister for tests
#[cfg(test)]
#[derive(Default)]
pub struct StaticReferences {
    pub analysis_templates: std::collections::BTreeMap<(String, String), AnalysisTemplate>,
    pub cluster_analysis_templates: std::collections::BTreeMap<String, ClusterAnalysisTemplate>,
    pub ingresses: std::collections::BTreeMap<(String, String), Ingress>,
    pub virtual_services: std::collections::BTreeMap<(String, String), DynamicObject>,
}

#[cfg(test)]
impl StaticReferences {
    pub fn with_analysis_template(mut self, namespace: &str, template: AnalysisTemplate) -> Self {
        self.analysis_templates
            .insert((namespace.to_string(), template.name_any()), template);
        self
    }

    pub fn with_ingress(mut self, namespace: &str, ingress: Ingress) -> Self {
        self.ingresses
            .insert((namespace.to_string(), ingress.name_any()), ingress);
        self
    }

    pub fn with_virtual_service(mut self, namespace: &str, vsvc: DynamicObject) -> Self {
        self.virtual_services
            .insert((namespace.to_string(), vsvc.name_any()), vsvc);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl ReferenceLister for StaticReferences {
    async fn get_analysis_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AnalysisTemplate>, ClientError> {
        Ok(self
            .analysis_templates
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_cluster_analysis_template(
        &self,
        name: &str,
    ) -> Result<Option<ClusterAnalysisTemplate>, ClientError> {
        Ok(self.cluster_analysis_templates.get(name).cloned())
    }

    async fn get_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Ingress>, ClientError> {
        Ok(self
            .ingresses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ClientError> {
        Ok(self
            .virtual_services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "references_test.rs"]
mod tests;
