//! Database module resources and connection string synthesis.
//!
//! A self-provisioned database is a single-replica PostgreSQL or MySQL
//! Deployment behind the `<instance>-db` Service, with its credentials in
//! `<instance>-db-connection` and data in `<instance>-db-claim`.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, Secret, Service, VolumeMount};

use crate::crd::{ApicurioStudio, ApicurioStudioSpec, Module};

use super::common::{
    claim_volume, container_port, credential, env_from_secret, env_value, module_claim,
    module_deployment, module_service, object_meta,
};
use super::secret_value;

pub const POSTGRESQL: &str = "postgresql";
pub const MYSQL: &str = "mysql";

pub const USER_KEY: &str = "database-user";
pub const PASSWORD_KEY: &str = "database-password";
pub const ROOT_PASSWORD_KEY: &str = "database-rootPassword";

const POSTGRESQL_IMAGE: &str = "quay.io/centos7/postgresql-12-centos7:latest";
const MYSQL_IMAGE: &str = "mysql:8.0";

/// Supported database engines, selected by the declared driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    PostgreSql,
    MySql,
}

impl Engine {
    /// Anything other than `mysql` runs on PostgreSQL.
    pub fn from_driver(driver: &str) -> Self {
        if driver == MYSQL {
            Engine::MySql
        } else {
            Engine::PostgreSql
        }
    }

    pub fn port(self) -> i32 {
        match self {
            Engine::PostgreSql => 5432,
            Engine::MySql => 3306,
        }
    }
}

pub fn secret_name(spec: &ApicurioStudioSpec) -> String {
    format!("{}-db-connection", spec.name)
}

pub fn claim_name(spec: &ApicurioStudioSpec) -> String {
    format!("{}-db-claim", spec.name)
}

/// Connection string for the database module.
///
/// Self-provisioned: `<driver>://<instance>-db:<port>/<database>`.
/// External: `<driver>://<url>/<database>` with `url` used verbatim. A
/// missing external url is not rejected here.
pub fn connection_string(spec: &ApicurioStudioSpec) -> String {
    let database = &spec.database;
    let address = match (&database.url, database.install) {
        (Some(url), false) => url.clone(),
        _ => format!(
            "{}:{}",
            Module::Database.object_name(&spec.name),
            Engine::from_driver(&database.driver).port()
        ),
    };
    format!("{}://{}/{}", database.driver, address, database.database)
}

/// JDBC form of [`connection_string`] handed to the API and WS modules.
pub fn jdbc_url(spec: &ApicurioStudioSpec) -> String {
    format!("jdbc:{}", connection_string(spec))
}

/// Database credentials. Stored values win over generated ones.
pub fn generate_secret(studio: &ApicurioStudio, existing: Option<&Secret>) -> Secret {
    let database = &studio.spec.database;
    let stored = |key: &str| secret_value(existing, key);

    Secret {
        metadata: object_meta(studio, secret_name(&studio.spec), Module::Database),
        string_data: Some(BTreeMap::from([
            (
                USER_KEY.to_string(),
                credential(database.user.as_deref(), stored(USER_KEY).as_deref(), 8),
            ),
            (
                PASSWORD_KEY.to_string(),
                credential(database.password.as_deref(), stored(PASSWORD_KEY).as_deref(), 16),
            ),
            (
                ROOT_PASSWORD_KEY.to_string(),
                credential(
                    database.root_password.as_deref(),
                    stored(ROOT_PASSWORD_KEY).as_deref(),
                    16,
                ),
            ),
        ])),
        ..Default::default()
    }
}

pub fn generate_claim(studio: &ApicurioStudio) -> PersistentVolumeClaim {
    module_claim(
        studio,
        Module::Database,
        claim_name(&studio.spec),
        &studio.spec.database.volume_size,
    )
}

pub fn generate_service(studio: &ApicurioStudio) -> Service {
    let engine = Engine::from_driver(&studio.spec.database.driver);
    module_service(studio, Module::Database, engine.port(), None)
}

pub fn generate_deployment(studio: &ApicurioStudio) -> Deployment {
    let spec = &studio.spec;
    let secret = secret_name(spec);
    let engine = Engine::from_driver(&spec.database.driver);

    let (image, volume, mount_path, env) = match engine {
        Engine::PostgreSql => (
            POSTGRESQL_IMAGE,
            "postgresql-apicurio",
            "/var/lib/pgsql/data",
            vec![
                env_value("POSTGRESQL_DATABASE", spec.database.database.clone()),
                env_from_secret("POSTGRESQL_USER", &secret, USER_KEY),
                env_from_secret("POSTGRESQL_PASSWORD", &secret, PASSWORD_KEY),
            ],
        ),
        Engine::MySql => (
            MYSQL_IMAGE,
            "mysql-apicurio",
            "/var/lib/mysql",
            vec![
                env_value("MYSQL_DATABASE", spec.database.database.clone()),
                env_from_secret("MYSQL_USER", &secret, USER_KEY),
                env_from_secret("MYSQL_PASSWORD", &secret, PASSWORD_KEY),
                env_from_secret("MYSQL_ROOT_PASSWORD", &secret, ROOT_PASSWORD_KEY),
            ],
        ),
    };

    let container = Container {
        name: spec.database.driver.clone(),
        image: Some(image.to_string()),
        ports: Some(vec![container_port(engine.port())]),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: volume.to_string(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    module_deployment(
        studio,
        Module::Database,
        container,
        Some(vec![claim_volume(volume, &claim_name(spec))]),
    )
}
