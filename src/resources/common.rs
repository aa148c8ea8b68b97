//! Common resource generation utilities.
//!
//! Labels, owner references, metadata and small builders shared by every
//! module provisioner.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Probe, ResourceRequirements,
    SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeResourceRequirements,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::crd::{ApicurioStudio, MODULE_LABEL, Module, ResourceRequirementsSpec};

/// Label marking objects managed by this operator.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] and field manager for server-side apply.
pub const OPERATOR_ID: &str = "apicurio-studio-operator";

/// Label carrying the application name.
pub const APP_LABEL: &str = "app";

/// Container port shared by the API, WS, UI and identity modules.
pub const HTTP_PORT: i32 = 8080;

/// Standard labels applied to every object owned by an instance.
pub fn standard_labels(studio: &ApicurioStudio, module: Module) -> BTreeMap<String, String> {
    let mut labels = selector_labels(studio, module);
    labels.insert(MANAGED_BY_LABEL.to_string(), OPERATOR_ID.to_string());
    labels
}

/// Labels used by services and deployments to select a module's pods.
pub fn selector_labels(studio: &ApicurioStudio, module: Module) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), studio.spec.name.clone()),
        (MODULE_LABEL.to_string(), module.label().to_string()),
    ])
}

/// Controller owner reference back to the instance.
pub fn owner_reference(studio: &ApicurioStudio) -> OwnerReference {
    OwnerReference {
        api_version: "studio.apicur.io/v1alpha1".to_string(),
        kind: "ApicurioStudio".to_string(),
        name: studio.name_any(),
        uid: studio.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for an owned object.
pub fn object_meta(studio: &ApicurioStudio, name: String, module: Module) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: studio.namespace(),
        labels: Some(standard_labels(studio, module)),
        owner_references: Some(vec![owner_reference(studio)]),
        ..Default::default()
    }
}

/// Random alphanumeric string used for generated credentials.
pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Pick the first non-blank value among the declared and previously stored
/// credential, generating a fresh one otherwise.
pub fn credential(declared: Option<&str>, existing: Option<&str>, generated_len: usize) -> String {
    [declared, existing]
        .into_iter()
        .flatten()
        .find(|v| !v.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| random_alphanumeric(generated_len))
}

pub fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Convert declared requests and limits into container resources.
pub fn resource_requirements(spec: &ResourceRequirementsSpec) -> ResourceRequirements {
    let to_map = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(to_map(&spec.requests.cpu, &spec.requests.memory)),
        limits: Some(to_map(&spec.limits.cpu, &spec.limits.memory)),
        ..Default::default()
    }
}

/// HTTP probe against the container port.
pub fn http_probe(path: &str, initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(HTTP_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        timeout_seconds: Some(5),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

pub fn container_port(port: i32) -> ContainerPort {
    ContainerPort {
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Single-replica deployment for a module with one container.
///
/// Stateful modules (identity, database) use the `Recreate` strategy so the
/// claim is never mounted by two pods at once.
pub fn module_deployment(
    studio: &ApicurioStudio,
    module: Module,
    container: Container,
    volumes: Option<Vec<Volume>>,
) -> Deployment {
    let selector = selector_labels(studio, module);
    let strategy = volumes.as_ref().map(|_| DeploymentStrategy {
        type_: Some("Recreate".to_string()),
        ..Default::default()
    });

    Deployment {
        metadata: object_meta(studio, module.object_name(&studio.spec.name), module),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(studio, module)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service exposing one TCP port of a module.
pub fn module_service(
    studio: &ApicurioStudio,
    module: Module,
    port: i32,
    annotations: Option<BTreeMap<String, String>>,
) -> Service {
    let mut metadata = object_meta(studio, module.object_name(&studio.spec.name), module);
    metadata.annotations = annotations;

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            session_affinity: Some("None".to_string()),
            selector: Some(selector_labels(studio, module)),
            ports: Some(vec![ServicePort {
                name: Some(format!("{}-tcp", port)),
                port,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ReadWriteOnce claim holding a module's data.
pub fn module_claim(
    studio: &ApicurioStudio,
    module: Module,
    name: String,
    size: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: object_meta(studio, name, module),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn claim_volume(volume_name: &str, claim_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: Some(false),
        }),
        ..Default::default()
    }
}
