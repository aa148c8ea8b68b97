//! ApicurioStudio Custom Resource Definition.
//!
//! Declares a full Apicurio Studio installation: the API, WebSocket and UI
//! modules plus an identity provider and a database, each of which can be
//! provisioned by the operator or supplied externally.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Module;

/// ApicurioStudio is a custom resource for deploying Apicurio Studio.
///
/// Example:
/// ```yaml
/// apiVersion: studio.apicur.io/v1alpha1
/// kind: ApicurioStudio
/// metadata:
///   name: demo
/// spec:
///   name: demo
///   url: studio.example.com
///   keycloak:
///     install: true
///   database:
///     install: true
///     type: postgresql
///     driver: postgresql
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "studio.apicur.io",
    version = "v1alpha1",
    kind = "ApicurioStudio",
    plural = "apicuriostudios",
    shortname = "studio",
    status = "ApicurioStudioStatus",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.studioUrl"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApicurioStudioSpec {
    /// Application name. Prefix of every owned object name.
    pub name: String,

    /// Externally reachable base domain (e.g. `studio.example.com`).
    pub url: String,

    /// WebSocket module overrides.
    #[serde(default)]
    pub ws_module: ModuleSpec,

    /// API module overrides.
    #[serde(default)]
    pub api_module: ModuleSpec,

    /// UI module overrides.
    #[serde(default)]
    pub studio_module: ModuleSpec,

    /// Identity provider configuration.
    #[serde(default)]
    pub keycloak: KeycloakSpec,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseSpec,

    /// Optional UI features and third-party integrations.
    #[serde(default)]
    pub features: FeaturesSpec,
}

impl ApicurioStudioSpec {
    /// Overrides declared for one of the application modules.
    pub fn module_spec(&self, module: Module) -> Option<&ModuleSpec> {
        match module {
            Module::Api => Some(&self.api_module),
            Module::Ws => Some(&self.ws_module),
            Module::Ui => Some(&self.studio_module),
            Module::Identity | Module::Database => None,
        }
    }
}

/// Per-module overrides for the API, WS and UI modules.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Container image. Defaults to the module's `latest` image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Ingress settings, used when the cluster exposes services through Ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,

    /// Compute resources. Defaults depend on the module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,
}

/// Resource requests and limits for a module container.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    pub requests: ResourceQuantity,
    pub limits: ResourceQuantity,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantity {
    pub cpu: String,
    pub memory: String,
}

/// Ingress configuration shared by all exposed modules.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Whether a TLS secret is expected under the default name (default: true).
    #[serde(default = "default_true")]
    pub generate_cert: bool,

    /// Name of an existing TLS secret. Takes precedence over `generateCert`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,

    /// Extra annotations merged onto the generated Ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for IngressSpec {
    fn default() -> Self {
        Self {
            generate_cert: true,
            secret_ref: None,
            annotations: None,
        }
    }
}

/// Keycloak identity provider configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakSpec {
    /// Provision Keycloak (default: true). When false, `url` must point to an
    /// existing instance.
    #[serde(default = "default_true")]
    pub install: bool,

    /// Realm holding the studio clients (default: apicurio).
    #[serde(default = "default_realm")]
    pub realm: String,

    /// External hostname of the identity provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Storage requested for Keycloak data (default: 500Mi).
    #[serde(default = "default_volume_size")]
    pub volume_size: String,

    /// Admin user. Generated when blank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Admin password. Generated when blank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
}

impl Default for KeycloakSpec {
    fn default() -> Self {
        Self {
            install: true,
            realm: default_realm(),
            url: None,
            volume_size: default_volume_size(),
            user: None,
            password: None,
            ingress: None,
        }
    }
}

/// Database configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Provision the database (default: true). When false, `url` must hold the
    /// `host:port` of an existing server.
    #[serde(default = "default_true")]
    pub install: bool,

    /// Database type passed to the API (default: postgresql).
    #[serde(default = "default_database_engine")]
    pub r#type: String,

    /// JDBC driver name, also selects the engine and port (default: postgresql).
    #[serde(default = "default_database_engine")]
    pub driver: String,

    /// `host:port` of an external database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Database name (default: apicuriodb).
    #[serde(default = "default_database_name")]
    pub database: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,

    /// Storage requested for database data (default: 500Mi).
    #[serde(default = "default_volume_size")]
    pub volume_size: String,
}

impl Default for DatabaseSpec {
    fn default() -> Self {
        Self {
            install: true,
            r#type: default_database_engine(),
            driver: default_database_engine(),
            url: None,
            database: default_database_name(),
            user: None,
            password: None,
            root_password: None,
            volume_size: default_volume_size(),
        }
    }
}

/// Optional UI features.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesSpec {
    #[serde(default, rename = "asyncAPI")]
    pub async_api: bool,

    #[serde(default, rename = "graphQL")]
    pub graph_ql: bool,

    /// Microcks mocking integration.
    #[serde(default)]
    pub microcks: MicrocksSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MicrocksSpec {
    /// Microcks API endpoint. Enables the integration when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl MicrocksSpec {
    pub fn is_enabled(&self) -> bool {
        self.api_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

fn default_true() -> bool {
    true
}

fn default_realm() -> String {
    "apicurio".to_string()
}

fn default_volume_size() -> String {
    "500Mi".to_string()
}

fn default_database_engine() -> String {
    "postgresql".to_string()
}

fn default_database_name() -> String {
    "apicuriodb".to_string()
}

/// Status of an ApicurioStudio.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApicurioStudioStatus {
    /// Aggregate state of the instance.
    #[serde(default)]
    pub state: StudioState,

    #[serde(default)]
    pub error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// External hostname of the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub studio_url: Option<String>,

    /// External hostname of the API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// External hostname of the WebSocket server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// External hostname of the identity provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keycloak_url: Option<String>,

    #[serde(default)]
    pub api_module: ModuleStatus,

    #[serde(default)]
    pub ws_module: ModuleStatus,

    #[serde(default)]
    pub ui_module: ModuleStatus,

    #[serde(default)]
    pub keycloak_module: ModuleStatus,

    #[serde(default)]
    pub database_module: ModuleStatus,
}

impl ApicurioStudioStatus {
    pub fn module(&self, module: Module) -> &ModuleStatus {
        match module {
            Module::Api => &self.api_module,
            Module::Ws => &self.ws_module,
            Module::Ui => &self.ui_module,
            Module::Identity => &self.keycloak_module,
            Module::Database => &self.database_module,
        }
    }

    pub fn module_mut(&mut self, module: Module) -> &mut ModuleStatus {
        match module {
            Module::Api => &mut self.api_module,
            Module::Ws => &mut self.ws_module,
            Module::Ui => &mut self.ui_module,
            Module::Identity => &mut self.keycloak_module,
            Module::Database => &mut self.database_module,
        }
    }

    /// Module states in `Module::ALL` order.
    pub fn module_states(&self) -> [ModuleState; 5] {
        Module::ALL.map(|m| self.module(m).state)
    }
}

/// Readiness of one module.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    #[serde(default)]
    pub state: ModuleState,

    #[serde(default)]
    pub error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 time of the last change to state, error or message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Aggregate state of an instance.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum StudioState {
    /// Not yet reconciled.
    #[default]
    Unknown,
    /// Resources applied, waiting for modules to become ready.
    Deploying,
    /// Every module is ready or preexisting.
    Ready,
    /// Reserved. Never assigned by the aggregator.
    Error,
}

impl std::fmt::Display for StudioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StudioState::Unknown => write!(f, "Unknown"),
            StudioState::Deploying => write!(f, "Deploying"),
            StudioState::Ready => write!(f, "Ready"),
            StudioState::Error => write!(f, "Error"),
        }
    }
}

/// State of a single module.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ModuleState {
    #[default]
    Unknown,
    Deploying,
    Ready,
    Error,
    /// Supplied externally. Terminal.
    Preexisting,
}

impl ModuleState {
    /// Whether this state satisfies readiness for a module that may be external.
    pub fn is_ready_or_preexisting(self) -> bool {
        matches!(self, ModuleState::Ready | ModuleState::Preexisting)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleState::Unknown => write!(f, "Unknown"),
            ModuleState::Deploying => write!(f, "Deploying"),
            ModuleState::Ready => write!(f, "Ready"),
            ModuleState::Error => write!(f, "Error"),
            ModuleState::Preexisting => write!(f, "Preexisting"),
        }
    }
}
