//! API, WebSocket and UI module resources.
//!
//! Each module gets a Service on port 8080, a Deployment and, depending on
//! the cluster, a Route or an Ingress. The UI and API need the external
//! hostnames of the other modules, collected in [`Endpoints`].

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, EnvVar, Service};
use k8s_openapi::api::networking::v1::Ingress;

use crate::crd::{ApicurioStudio, Module};

use super::common::{
    HTTP_PORT, container_port, env_from_secret, env_value, http_probe, module_deployment,
    module_service, resource_requirements,
};
use super::database;
use super::exposure::{generate_ingress, ingress_host};

/// External hostnames of the modules, as recorded in the status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub studio_url: String,
    pub api_url: String,
    pub ws_url: String,
    pub keycloak_url: String,
}

pub fn generate_service(studio: &ApicurioStudio, module: Module) -> Service {
    let metrics_path = match module {
        Module::Api => Some("/system/metrics"),
        Module::Ws => Some("/metrics"),
        _ => None,
    };
    let annotations = metrics_path.map(|path| {
        BTreeMap::from([
            ("prometheus.io/scrape".to_string(), "true".to_string()),
            ("prometheus.io/path".to_string(), path.to_string()),
        ])
    });
    module_service(studio, module, HTTP_PORT, annotations)
}

/// Ingress for an application module on `<module-label>.<url>`.
pub fn generate_module_ingress(studio: &ApicurioStudio, module: Module) -> Ingress {
    let host = ingress_host(module, &studio.spec.url);
    let spec = studio
        .spec
        .module_spec(module)
        .and_then(|m| m.ingress.as_ref());
    generate_ingress(studio, module, &host, spec)
}

/// Deployment for one of the API, WS or UI modules.
///
/// Returns `None` for the identity and database modules.
pub fn generate_deployment(
    studio: &ApicurioStudio,
    module: Module,
    endpoints: &Endpoints,
) -> Option<Deployment> {
    let module_spec = studio.spec.module_spec(module)?;
    let image = module_spec
        .image
        .clone()
        .or_else(|| module.default_image().map(str::to_string));
    let resources = module_spec
        .resources
        .clone()
        .or_else(|| module.default_resources());

    let (env, probe_path, liveness_delay, readiness_delay) = match module {
        Module::Api => (api_env(studio, endpoints), "/system/ready", 30, 15),
        Module::Ws => (database_env(studio), "/metrics", 30, 15),
        Module::Ui => (ui_env(studio, endpoints), "/ready", 30, 15),
        Module::Identity | Module::Database => return None,
    };

    let container = Container {
        name: module.suffix().to_string(),
        image,
        ports: Some(vec![container_port(HTTP_PORT)]),
        env: Some(env),
        resources: resources.as_ref().map(resource_requirements),
        liveness_probe: Some(http_probe(probe_path, liveness_delay)),
        readiness_probe: Some(http_probe(probe_path, readiness_delay)),
        ..Default::default()
    };

    Some(module_deployment(studio, module, container, None))
}

fn keycloak_env(studio: &ApicurioStudio, endpoints: &Endpoints) -> Vec<EnvVar> {
    vec![
        env_value(
            "APICURIO_KC_AUTH_URL",
            format!("https://{}/auth", endpoints.keycloak_url),
        ),
        env_value("APICURIO_KC_REALM", studio.spec.keycloak.realm.clone()),
    ]
}

fn database_env(studio: &ApicurioStudio) -> Vec<EnvVar> {
    let db = &studio.spec.database;
    let secret = database::secret_name(&studio.spec);
    vec![
        env_value("APICURIO_DB_TYPE", db.r#type.clone()),
        env_value("APICURIO_DB_DRIVER_NAME", db.driver.clone()),
        env_value("APICURIO_DB_CONNECTION_URL", database::jdbc_url(&studio.spec)),
        env_value("APICURIO_HUB_STORAGE_JDBC_TYPE", db.r#type.clone()),
        env_from_secret("APICURIO_DB_USER_NAME", &secret, database::USER_KEY),
        env_from_secret("APICURIO_DB_PASSWORD", &secret, database::PASSWORD_KEY),
    ]
}

fn api_env(studio: &ApicurioStudio, endpoints: &Endpoints) -> Vec<EnvVar> {
    let mut env = keycloak_env(studio, endpoints);
    env.extend(database_env(studio));

    let microcks = &studio.spec.features.microcks;
    if microcks.is_enabled() {
        env.push(env_value(
            "APICURIO_MICROCKS_API_URL",
            microcks.api_url.clone().unwrap_or_default(),
        ));
        env.push(env_value(
            "APICURIO_MICROCKS_CLIENT_ID",
            microcks.client_id.clone().unwrap_or_default(),
        ));
        env.push(env_value(
            "APICURIO_MICROCKS_CLIENT_SECRET",
            microcks.client_secret.clone().unwrap_or_default(),
        ));
    }
    env
}

fn ui_env(studio: &ApicurioStudio, endpoints: &Endpoints) -> Vec<EnvVar> {
    let features = &studio.spec.features;
    let mut env = keycloak_env(studio, endpoints);
    env.extend([
        env_value(
            "APICURIO_UI_HUB_API_URL",
            format!("https://{}", endpoints.api_url),
        ),
        env_value(
            "APICURIO_UI_EDITING_URL",
            format!("wss://{}", endpoints.ws_url),
        ),
        env_value("APICURIO_UI_LOGOUT_REDIRECT", "/"),
    ]);

    let flags = [
        ("APICURIO_UI_FEATURE_ASYNCAPI", features.async_api),
        ("APICURIO_UI_FEATURE_GRAPHQL", features.graph_ql),
        ("APICURIO_UI_FEATURE_MICROCKS", features.microcks.is_enabled()),
    ];
    env.extend(
        flags
            .into_iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(name, _)| env_value(name, "true")),
    );
    env
}
