use crate::controller::field::{FieldError, FieldPath};
use crate::crd::rollout::Rollout;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

/// The ingress a traffic provider manages must route to the stable service
///
/// Only nginx and ALB manage ingresses; nginx wins when both are set.
pub fn validate_ingress(rollout: &Rollout, ingress: &Ingress) -> Vec<FieldError> {
    let Some(canary) = rollout.canary() else {
        return Vec::new();
    };
    let Some(routing) = &canary.traffic_routing else {
        return Vec::new();
    };

    let base = FieldPath::new(["spec", "strategy", "canary", "trafficRouting"]);
    let (path, value) = if let Some(nginx) = &routing.nginx {
        (base.child("nginx"), serde_json::to_value(nginx))
    } else if let Some(alb) = &routing.alb {
        (base.child("alb"), serde_json::to_value(alb))
    } else {
        return Vec::new();
    };

    if has_rule_with_service(ingress, &canary.stable_service) {
        return Vec::new();
    }

    vec![FieldError::invalid(
        path,
        value.unwrap_or(serde_json::Value::Null),
        format!(
            "ingress `{}` has no rules using service {} backend",
            ingress.name_any(),
            canary.stable_service
        ),
    )]
}

/// True if any rule path sends traffic to `service`
pub fn has_rule_with_service(ingress: &Ingress, service: &str) -> bool {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.rules.iter().flatten())
        .flat_map(|rule| rule.http.iter())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref())
        .any(|backend| backend.name == service)
}
