//! Keycloak identity provider resources.
//!
//! Secret with admin credentials, data claim, Service, Deployment and the
//! external exposure (Route or Ingress) for `<instance>-auth`.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, Secret, Service, VolumeMount};
use k8s_openapi::api::networking::v1::Ingress;

use crate::crd::{ApicurioStudio, Module, ResourceQuantity, ResourceRequirementsSpec};

use super::common::{
    HTTP_PORT, claim_volume, container_port, credential, env_from_secret, env_value,
    module_claim, module_deployment, module_service, object_meta, resource_requirements,
};
use super::exposure::{Route, generate_ingress, generate_route};
use super::secret_value;

/// Image of the Keycloak distribution preloaded with the studio realm.
pub const KEYCLOAK_IMAGE: &str = "apicurio/apicurio-studio-auth:latest";

pub const USER_KEY: &str = "keycloak-user";
pub const PASSWORD_KEY: &str = "keycloak-password";

const DATA_VOLUME: &str = "keycloak-data";

pub fn secret_name(studio: &ApicurioStudio) -> String {
    format!("{}-auth-keycloak", studio.spec.name)
}

pub fn claim_name(studio: &ApicurioStudio) -> String {
    format!("{}-auth-claim", studio.spec.name)
}

/// Admin credentials. Values already stored in `existing` are kept so that
/// re-provisioning does not rotate generated passwords.
pub fn generate_secret(studio: &ApicurioStudio, existing: Option<&Secret>) -> Secret {
    let keycloak = &studio.spec.keycloak;
    let stored = |key: &str| secret_value(existing, key);

    Secret {
        metadata: object_meta(studio, secret_name(studio), Module::Identity),
        string_data: Some(BTreeMap::from([
            (
                USER_KEY.to_string(),
                credential(keycloak.user.as_deref(), stored(USER_KEY).as_deref(), 8),
            ),
            (
                PASSWORD_KEY.to_string(),
                credential(keycloak.password.as_deref(), stored(PASSWORD_KEY).as_deref(), 16),
            ),
        ])),
        ..Default::default()
    }
}

pub fn generate_claim(studio: &ApicurioStudio) -> PersistentVolumeClaim {
    module_claim(
        studio,
        Module::Identity,
        claim_name(studio),
        &studio.spec.keycloak.volume_size,
    )
}

pub fn generate_service(studio: &ApicurioStudio) -> Service {
    module_service(studio, Module::Identity, HTTP_PORT, None)
}

/// Keycloak deployment. `studio_url` is the external UI host, used as the
/// redirect target of the studio client.
pub fn generate_deployment(studio: &ApicurioStudio, studio_url: &str) -> Deployment {
    let secret = secret_name(studio);
    let resources = ResourceRequirementsSpec {
        requests: ResourceQuantity {
            cpu: "100m".to_string(),
            memory: "600Mi".to_string(),
        },
        limits: ResourceQuantity {
            cpu: "1".to_string(),
            memory: "1300Mi".to_string(),
        },
    };

    let container = Container {
        name: "keycloak".to_string(),
        image: Some(KEYCLOAK_IMAGE.to_string()),
        ports: Some(vec![container_port(HTTP_PORT)]),
        env: Some(vec![
            env_value("APICURIO_UI_URL", format!("https://{}", studio_url)),
            env_from_secret("APICURIO_KEYCLOAK_USER", &secret, USER_KEY),
            env_from_secret("APICURIO_KEYCLOAK_PASSWORD", &secret, PASSWORD_KEY),
        ]),
        resources: Some(resource_requirements(&resources)),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: "/opt/jboss/keycloak/standalone/data".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    module_deployment(
        studio,
        Module::Identity,
        container,
        Some(vec![claim_volume(DATA_VOLUME, &claim_name(studio))]),
    )
}

pub fn generate_keycloak_route(studio: &ApicurioStudio) -> Route {
    generate_route(studio, Module::Identity)
}

/// Ingress on the host declared in `keycloak.url`.
pub fn generate_keycloak_ingress(studio: &ApicurioStudio) -> Ingress {
    let keycloak = &studio.spec.keycloak;
    generate_ingress(
        studio,
        Module::Identity,
        keycloak.url.as_deref().unwrap_or_default(),
        keycloak.ingress.as_ref(),
    )
}
