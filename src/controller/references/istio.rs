use crate::controller::field::{FieldError, FieldPath};
use crate::crd::rollout::Rollout;
use kube::api::DynamicObject;
use serde::Deserialize;
use thiserror::Error;

/// One entry of a VirtualService's `spec.http`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct HttpRoute {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub route: Vec<RouteDestination>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RouteDestination {
    pub destination: Destination,

    #[serde(default)]
    pub weight: i64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Destination {
    pub host: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum IstioRouteError {
    #[error("spec.http must contain exactly one route when no route names are configured, found {0}")]
    AmbiguousRoute(usize),

    #[error("HTTP route `{0}` not found")]
    RouteNotFound(String),

    #[error("route `{route}` must have exactly two destinations, found {count}")]
    DestinationCount { route: String, count: usize },

    #[error("route `{route}` has no destination for service {service}")]
    MissingDestination { route: String, service: String },
}

/// Check the routes a canary rollout would shift traffic on
pub fn validate_http_routes(rollout: &Rollout, routes: &[HttpRoute]) -> Result<(), IstioRouteError> {
    let Some(canary) = rollout.canary() else {
        return Ok(());
    };
    let names = rollout
        .traffic_routing()
        .and_then(|r| r.istio.as_ref())
        .map(|i| i.virtual_service.routes.as_slice())
        .unwrap_or_default();

    let selected: Vec<&HttpRoute> = if names.is_empty() {
        if routes.len() != 1 {
            return Err(IstioRouteError::AmbiguousRoute(routes.len()));
        }
        routes.iter().collect()
    } else {
        names
            .iter()
            .map(|name| {
                routes
                    .iter()
                    .find(|r| &r.name == name)
                    .ok_or_else(|| IstioRouteError::RouteNotFound(name.clone()))
            })
            .collect::<Result<_, _>>()?
    };

    for route in selected {
        if route.route.len() != 2 {
            return Err(IstioRouteError::DestinationCount {
                route: route.name.clone(),
                count: route.route.len(),
            });
        }
        for service in [&canary.stable_service, &canary.canary_service] {
            if !route
                .route
                .iter()
                .any(|d| host_matches(&d.destination.host, service))
            {
                return Err(IstioRouteError::MissingDestination {
                    route: route.name.clone(),
                    service: service.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Short names and in-cluster FQDNs both address a service
fn host_matches(host: &str, service: &str) -> bool {
    host == service
        || host
            .strip_prefix(service)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Decode `spec.http` and check the configured routes
pub fn validate_virtual_service(rollout: &Rollout, vsvc: &DynamicObject) -> Vec<FieldError> {
    let path = FieldPath::new(["spec", "strategy", "canary", "trafficRouting", "istio"]);
    let value: Vec<String> = rollout
        .traffic_routing()
        .and_then(|r| r.istio.as_ref())
        .map(|i| i.virtual_service.routes.clone())
        .unwrap_or_default();

    let routes = match http_routes(vsvc) {
        Some(routes) => routes,
        None => {
            return vec![FieldError::invalid(
                path,
                value,
                "Unable to get HTTP routes for Istio VirtualService",
            )]
        }
    };

    match validate_http_routes(rollout, &routes) {
        Ok(()) => Vec::new(),
        Err(err) => vec![FieldError::invalid(
            path,
            value,
            format!("Istio VirtualService has invalid HTTP routes. Error: {err}"),
        )],
    }
}

fn http_routes(vsvc: &DynamicObject) -> Option<Vec<HttpRoute>> {
    let http = vsvc.data.get("spec")?.get("http")?;
    if !http.is_array() {
        return None;
    }
    serde_json::from_value(http.clone()).ok()
}
