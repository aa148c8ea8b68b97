//! External exposure of module services.
//!
//! OpenShift clusters expose services through `Route` objects whose host is
//! assigned by the platform. Other clusters get a `networking.k8s.io/v1`
//! Ingress whose host is derived from the instance base URL. Which one is
//! used is decided once at startup and carried in [`ClusterCapabilities`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec as K8sIngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use crate::crd::{ApicurioStudio, IngressSpec, Module};

use super::common::{HTTP_PORT, object_meta};

/// API group served by OpenShift routers.
pub const ROUTE_API_GROUP: &str = "route.openshift.io";

/// How services are made reachable from outside the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Exposure {
    /// OpenShift `Route` with edge TLS termination.
    Route,
    /// Kubernetes `Ingress`.
    Ingress,
}

impl fmt::Display for Exposure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exposure::Route => write!(f, "route"),
            Exposure::Ingress => write!(f, "ingress"),
        }
    }
}

impl FromStr for Exposure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "route" => Ok(Exposure::Route),
            "ingress" => Ok(Exposure::Ingress),
            _ => Err(format!("Unknown exposure kind: {}", s)),
        }
    }
}

/// Cluster features resolved once at startup and passed to provisioners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterCapabilities {
    pub exposure: Exposure,
}

impl ClusterCapabilities {
    /// Derive capabilities from the API groups served by the cluster.
    pub fn from_api_groups<'a>(groups: impl IntoIterator<Item = &'a str>) -> Self {
        let has_routes = groups.into_iter().any(|g| g == ROUTE_API_GROUP);
        Self {
            exposure: if has_routes {
                Exposure::Route
            } else {
                Exposure::Ingress
            },
        }
    }
}

// ============================================================================
// OpenShift Route types
// ============================================================================

/// OpenShift Route resource.
///
/// Minimal representation of `route.openshift.io/v1` Route, applied as a
/// dynamic object.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: RouteSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Host assigned by the router. Left empty on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub to: RouteTargetReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    pub target_port: IntOrString,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub termination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_edge_termination_policy: Option<String>,
}

/// Edge-terminated Route to a module's service.
pub fn generate_route(studio: &ApicurioStudio, module: Module) -> Route {
    let name = module.object_name(&studio.spec.name);
    Route {
        api_version: format!("{}/v1", ROUTE_API_GROUP),
        kind: "Route".to_string(),
        metadata: object_meta(studio, name.clone(), module),
        spec: RouteSpec {
            host: None,
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name,
            },
            port: Some(RoutePort {
                target_port: IntOrString::Int(HTTP_PORT),
            }),
            tls: Some(TlsConfig {
                termination: "edge".to_string(),
                insecure_edge_termination_policy: Some("Redirect".to_string()),
            }),
        },
    }
}

// ============================================================================
// Ingress generation
// ============================================================================

/// Host of a module's Ingress: `<module-label>.<base-url>`.
pub fn ingress_host(module: Module, base_url: &str) -> String {
    format!("{}.{}", module.label(), base_url)
}

/// Default TLS secret name for a module's Ingress.
pub fn default_tls_secret(module: Module) -> String {
    format!("{}-ingress-secret", module.label())
}

/// TLS secret referenced by an Ingress.
///
/// An explicit `secretRef` wins; otherwise the default name is used unless
/// certificate generation was turned off.
pub fn tls_secret_name(spec: Option<&IngressSpec>, default_name: String) -> Option<String> {
    match spec {
        Some(IngressSpec {
            secret_ref: Some(secret),
            ..
        }) => Some(secret.clone()),
        Some(IngressSpec {
            generate_cert: false,
            ..
        }) => None,
        _ => Some(default_name),
    }
}

/// Ingress routing `host` to the module's service on the HTTP port.
pub fn generate_ingress(
    studio: &ApicurioStudio,
    module: Module,
    host: &str,
    spec: Option<&IngressSpec>,
) -> Ingress {
    let name = module.object_name(&studio.spec.name);

    let mut annotations = BTreeMap::from([(
        "ingress.kubernetes.io/rewrite-target".to_string(),
        "/".to_string(),
    )]);
    if let Some(extra) = spec.and_then(|s| s.annotations.as_ref()) {
        annotations.extend(extra.clone());
    }

    let mut metadata = object_meta(studio, name.clone(), module);
    metadata.annotations = Some(annotations);

    Ingress {
        metadata,
        spec: Some(K8sIngressSpec {
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![host.to_string()]),
                secret_name: tls_secret_name(spec, default_tls_secret(module)),
            }]),
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name,
                                port: Some(ServiceBackendPort {
                                    number: Some(HTTP_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
