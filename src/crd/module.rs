//! Module identities for the five sub-applications of an ApicurioStudio.
//!
//! Every owned object carries a `module` label. The label is resolved once
//! into a [`Module`] when a notification arrives; downstream code matches on
//! the enum, never on the raw string.

use std::fmt;

use super::{ResourceQuantity, ResourceRequirementsSpec};

/// Label key carrying the module identity on every owned object.
pub const MODULE_LABEL: &str = "module";

/// One of the five provisioned sub-applications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Module {
    /// REST API server.
    Api,
    /// WebSocket collaborative editing server.
    Ws,
    /// Web frontend.
    Ui,
    /// Keycloak identity provider.
    Identity,
    /// Backing relational database.
    Database,
}

/// Unit of re-provisioning. Drift on one module re-runs its whole group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProvisioningGroup {
    /// API, WS and UI.
    Studio,
    Identity,
    Database,
}

impl Module {
    /// All modules in provisioning order.
    pub const ALL: [Module; 5] = [
        Module::Identity,
        Module::Database,
        Module::Api,
        Module::Ws,
        Module::Ui,
    ];

    /// The application modules provisioned together by the studio group.
    pub const STUDIO: [Module; 3] = [Module::Api, Module::Ws, Module::Ui];

    /// Value of the `module` label for this module.
    pub fn label(self) -> &'static str {
        match self {
            Module::Api => "apicurio-studio-api",
            Module::Ws => "apicurio-studio-ws",
            Module::Ui => "apicurio-studio-ui",
            Module::Identity => "apicurio-studio-auth",
            Module::Database => "apicurio-studio-db",
        }
    }

    /// Resolve a `module` label value. Unknown values yield `None`.
    pub fn from_label(value: &str) -> Option<Module> {
        Module::ALL.into_iter().find(|m| m.label() == value)
    }

    /// Suffix appended to the instance name for this module's objects.
    pub fn suffix(self) -> &'static str {
        match self {
            Module::Api => "api",
            Module::Ws => "ws",
            Module::Ui => "ui",
            Module::Identity => "auth",
            Module::Database => "db",
        }
    }

    /// Stable object name (`<instance>-<suffix>`) for the workload and service.
    pub fn object_name(self, instance: &str) -> String {
        format!("{}-{}", instance, self.suffix())
    }

    pub fn group(self) -> ProvisioningGroup {
        match self {
            Module::Api | Module::Ws | Module::Ui => ProvisioningGroup::Studio,
            Module::Identity => ProvisioningGroup::Identity,
            Module::Database => ProvisioningGroup::Database,
        }
    }

    /// Default container image for the application modules.
    pub fn default_image(self) -> Option<&'static str> {
        match self {
            Module::Api => Some("apicurio/apicurio-studio-api:latest"),
            Module::Ws => Some("apicurio/apicurio-studio-ws:latest"),
            Module::Ui => Some("apicurio/apicurio-studio-ui:latest"),
            Module::Identity | Module::Database => None,
        }
    }

    /// Default compute resources for the application modules.
    pub fn default_resources(self) -> Option<ResourceRequirementsSpec> {
        let (limit_memory, request_memory) = match self {
            Module::Api => ("1700Mi", "800Mi"),
            Module::Ws => ("1800Mi", "900Mi"),
            Module::Ui => ("1300Mi", "600Mi"),
            Module::Identity | Module::Database => return None,
        };
        Some(ResourceRequirementsSpec {
            requests: ResourceQuantity {
                cpu: "100m".to_string(),
                memory: request_memory.to_string(),
            },
            limits: ResourceQuantity {
                cpu: "1".to_string(),
                memory: limit_memory.to_string(),
            },
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Module::Api => write!(f, "Api"),
            Module::Ws => write!(f, "Ws"),
            Module::Ui => write!(f, "Ui"),
            Module::Identity => write!(f, "Identity"),
            Module::Database => write!(f, "Database"),
        }
    }
}

impl fmt::Display for ProvisioningGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningGroup::Studio => write!(f, "Studio"),
            ProvisioningGroup::Identity => write!(f, "Identity"),
            ProvisioningGroup::Database => write!(f, "Database"),
        }
    }
}
