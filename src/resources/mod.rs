//! Resource generation module.
//!
//! Pure functions turning an `ApicurioStudio` into the objects it owns. No
//! function here talks to the cluster.
//!
//! ## Resources Generated
//!
//! | Module | Objects |
//! |--------|---------|
//! | Identity | Secret, PersistentVolumeClaim, Service, Deployment, Route or Ingress |
//! | Database | Secret, PersistentVolumeClaim, Service, Deployment |
//! | API / WS / UI | Service, Deployment, Route or Ingress |

pub mod common;
pub mod database;
pub mod exposure;
pub mod identity;
pub mod studio;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;

pub use common::{owner_reference, standard_labels};
pub use exposure::{ClusterCapabilities, Exposure, Route};
pub use studio::Endpoints;

/// Read a key from a secret, looking at both `data` and `stringData`.
pub fn secret_value(secret: Option<&Secret>, key: &str) -> Option<String> {
    let secret = secret?;
    let from_data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok());
    from_data.or_else(|| {
        secret
            .string_data
            .as_ref()
            .and_then(|data| data.get(key).cloned())
    })
}

/// An owned object applied by create-or-replace.
///
/// Persistent volume claims and routes are not listed: claims are only
/// created when absent, and routes are applied as dynamic objects.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnedObject {
    Secret(Secret),
    Service(Service),
    Deployment(Deployment),
    Ingress(Ingress),
}

impl OwnedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            OwnedObject::Secret(_) => "Secret",
            OwnedObject::Service(_) => "Service",
            OwnedObject::Deployment(_) => "Deployment",
            OwnedObject::Ingress(_) => "Ingress",
        }
    }

    pub fn name(&self) -> &str {
        let metadata = match self {
            OwnedObject::Secret(o) => &o.metadata,
            OwnedObject::Service(o) => &o.metadata,
            OwnedObject::Deployment(o) => &o.metadata,
            OwnedObject::Ingress(o) => &o.metadata,
        };
        metadata.name.as_deref().unwrap_or_default()
    }
}

impl From<Secret> for OwnedObject {
    fn from(value: Secret) -> Self {
        OwnedObject::Secret(value)
    }
}

impl From<Service> for OwnedObject {
    fn from(value: Service) -> Self {
        OwnedObject::Service(value)
    }
}

impl From<Deployment> for OwnedObject {
    fn from(value: Deployment) -> Self {
        OwnedObject::Deployment(value)
    }
}

impl From<Ingress> for OwnedObject {
    fn from(value: Ingress) -> Self {
        OwnedObject::Ingress(value)
    }
}
