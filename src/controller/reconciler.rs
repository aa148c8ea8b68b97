//! Reconciliation loop for ApicurioStudio.
//!
//! A pass provisions every module group in dependency order: the UI
//! hostname first (the identity provider redirects to it), then the identity
//! provider, the database, and finally the API, WS and UI modules. Module
//! status changes are collected in a [`StatusDelta`] and persisted once at
//! the end of the pass, including when the pass fails part way.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use jiff::Timestamp;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, warn};

use crate::config::FailedPassPolicy;
use crate::controller::aggregator::StatusDelta;
use crate::controller::client::{StudioClient, StudioEvent};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::instance_lock::InstanceKey;
use crate::controller::state_machine::{ModuleEvent, TransitionContext};
use crate::controller::status::{StatusWrite, write_status};
use crate::crd::{ApicurioStudio, ApicurioStudioStatus, Module, ProvisioningGroup, StudioState};
use crate::health::HealthState;
use crate::resources::exposure::{generate_route, ingress_host};
use crate::resources::{ClusterCapabilities, Endpoints, Exposure, database, identity, studio};

/// Outcome of a reconcile pass
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// The instance is Ready; nothing was read or written
    Stable,
    /// Objects were applied and the status persisted
    Provisioned(StatusWrite),
}

/// Endpoints known from a previously persisted status.
fn endpoints_from_status(status: &ApicurioStudioStatus) -> Endpoints {
    Endpoints {
        studio_url: status.studio_url.clone().unwrap_or_default(),
        api_url: status.api_url.clone().unwrap_or_default(),
        ws_url: status.ws_url.clone().unwrap_or_default(),
        keycloak_url: status.keycloak_url.clone().unwrap_or_default(),
    }
}

/// Applies the objects of one instance and records what happened.
struct Provisioner<'a> {
    client: &'a dyn StudioClient,
    capabilities: ClusterCapabilities,
    studio: &'a ApicurioStudio,
    namespace: String,
    endpoints: Endpoints,
    delta: StatusDelta,
}

impl<'a> Provisioner<'a> {
    fn new(
        client: &'a dyn StudioClient,
        capabilities: ClusterCapabilities,
        studio: &'a ApicurioStudio,
        status: &ApicurioStudioStatus,
    ) -> Result<Self> {
        let namespace = studio
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        Ok(Self {
            client,
            capabilities,
            studio,
            namespace,
            endpoints: endpoints_from_status(status),
            delta: StatusDelta::default(),
        })
    }

    fn observe(&mut self, module: Module, event: ModuleEvent) {
        self.delta
            .observe(module, event, TransitionContext::default());
    }

    /// Expose an application module and return its external host.
    async fn expose(&self, module: Module) -> Result<Option<String>> {
        match self.capabilities.exposure {
            Exposure::Route => {
                let route = generate_route(self.studio, module);
                self.client.apply_route(&self.namespace, &route).await
            }
            Exposure::Ingress => {
                let ingress = studio::generate_module_ingress(self.studio, module);
                self.client.apply(&self.namespace, &ingress.into()).await?;
                Ok(Some(ingress_host(module, &self.studio.spec.url)))
            }
        }
    }

    /// Resolve the UI hostname, needed by the identity provider.
    async fn ui_endpoint(&mut self) -> Result<()> {
        if let Some(host) = self.expose(Module::Ui).await? {
            debug!(host = %host, "Resolved studio url");
            self.endpoints.studio_url = host.clone();
            self.delta.studio_url = Some(host);
        }
        Ok(())
    }

    async fn identity(&mut self) -> Result<()> {
        let keycloak = &self.studio.spec.keycloak;
        if !keycloak.install {
            if let Some(url) = keycloak.url.clone() {
                self.endpoints.keycloak_url = url.clone();
                self.delta.keycloak_url = Some(url);
            }
            self.observe(Module::Identity, ModuleEvent::MarkedPreexisting);
            return Ok(());
        }

        let ns = self.namespace.as_str();
        let existing = self
            .client
            .get_secret(ns, &identity::secret_name(self.studio))
            .await?;
        self.client
            .apply(ns, &identity::generate_secret(self.studio, existing.as_ref()).into())
            .await?;
        if self
            .client
            .create_claim_if_absent(ns, &identity::generate_claim(self.studio))
            .await?
        {
            info!(claim = %identity::claim_name(self.studio), "Created identity claim");
        }
        self.client
            .apply(ns, &identity::generate_service(self.studio).into())
            .await?;

        let host = match self.capabilities.exposure {
            Exposure::Route => {
                self.client
                    .apply_route(ns, &identity::generate_keycloak_route(self.studio))
                    .await?
            }
            Exposure::Ingress => {
                self.client
                    .apply(ns, &identity::generate_keycloak_ingress(self.studio).into())
                    .await?;
                keycloak.url.clone()
            }
        };
        if let Some(host) = host {
            self.endpoints.keycloak_url = host.clone();
            self.delta.keycloak_url = Some(host);
        }

        self.client
            .apply(
                ns,
                &identity::generate_deployment(self.studio, &self.endpoints.studio_url).into(),
            )
            .await?;
        self.observe(Module::Identity, ModuleEvent::Provisioned);
        Ok(())
    }

    async fn database(&mut self) -> Result<()> {
        let spec = &self.studio.spec;
        if !spec.database.install {
            self.observe(Module::Database, ModuleEvent::MarkedPreexisting);
            return Ok(());
        }

        let ns = self.namespace.as_str();
        let existing = self
            .client
            .get_secret(ns, &database::secret_name(spec))
            .await?;
        self.client
            .apply(ns, &database::generate_secret(self.studio, existing.as_ref()).into())
            .await?;
        if self
            .client
            .create_claim_if_absent(ns, &database::generate_claim(self.studio))
            .await?
        {
            info!(claim = %database::claim_name(spec), "Created database claim");
        }
        self.client
            .apply(ns, &database::generate_service(self.studio).into())
            .await?;
        self.client
            .apply(ns, &database::generate_deployment(self.studio).into())
            .await?;
        self.observe(Module::Database, ModuleEvent::Provisioned);
        Ok(())
    }

    /// API, WS and UI in that order; the UI is handed the API and WS hosts.
    async fn studio_modules(&mut self) -> Result<()> {
        for module in Module::STUDIO {
            let ns = self.namespace.as_str();
            self.client
                .apply(ns, &studio::generate_service(self.studio, module).into())
                .await?;

            match module {
                Module::Api => {
                    if let Some(host) = self.expose(module).await? {
                        self.endpoints.api_url = host.clone();
                        self.delta.api_url = Some(host);
                    }
                }
                Module::Ws => {
                    if let Some(host) = self.expose(module).await? {
                        self.endpoints.ws_url = host.clone();
                        self.delta.ws_url = Some(host);
                    }
                }
                // Exposed ahead of the identity provider
                _ => {}
            }

            if let Some(deployment) =
                studio::generate_deployment(self.studio, module, &self.endpoints)
            {
                self.client.apply(ns, &deployment.into()).await?;
            }
            self.observe(module, ModuleEvent::Provisioned);
        }
        Ok(())
    }

    async fn group(&mut self, group: ProvisioningGroup) -> Result<()> {
        match group {
            ProvisioningGroup::Identity => self.identity().await,
            ProvisioningGroup::Database => self.database().await,
            ProvisioningGroup::Studio => {
                self.ui_endpoint().await?;
                self.studio_modules().await
            }
        }
    }

    async fn all(&mut self) -> Result<()> {
        self.ui_endpoint().await?;
        self.identity().await?;
        self.database().await?;
        self.studio_modules().await
    }

    /// Persist the collected delta. A provisioning error wins over a
    /// persistence error.
    async fn persist(
        self,
        initial: ApicurioStudioStatus,
        provisioned: Result<()>,
    ) -> Result<StatusWrite> {
        let name = self.studio.name_any();
        let written = write_status(
            self.client,
            &self.namespace,
            &name,
            Some((self.studio.metadata.resource_version.clone(), initial)),
            &self.delta,
        )
        .await;

        match (provisioned, written) {
            (Ok(()), written) => written,
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(persist_error)) => {
                warn!(name = %name, error = %persist_error, "Failed to persist partial status");
                Err(e)
            }
        }
    }
}

/// Run one reconcile pass against `studio`.
pub async fn run_pass(
    client: &dyn StudioClient,
    capabilities: ClusterCapabilities,
    studio: &ApicurioStudio,
) -> Result<PassOutcome> {
    let status = studio.status.clone().unwrap_or_default();
    if status.state == StudioState::Ready {
        debug!(name = %studio.name_any(), "Instance is ready, nothing to do");
        return Ok(PassOutcome::Stable);
    }

    let mut provisioner = Provisioner::new(client, capabilities, studio, &status)?;
    let provisioned = provisioner.all().await;
    provisioner
        .persist(status, provisioned)
        .await
        .map(PassOutcome::Provisioned)
}

/// Re-run a single provisioning group and persist the resulting status.
pub async fn provision_group(
    client: &dyn StudioClient,
    capabilities: ClusterCapabilities,
    studio: &ApicurioStudio,
    group: ProvisioningGroup,
) -> Result<StatusWrite> {
    let status = studio.status.clone().unwrap_or_default();
    let mut provisioner = Provisioner::new(client, capabilities, studio, &status)?;
    let provisioned = provisioner.group(group).await;
    provisioner.persist(status, provisioned).await
}

/// Count modules whose state differs between two statuses.
pub fn record_transitions(
    health: Option<&Arc<HealthState>>,
    before: &ApicurioStudioStatus,
    after: &ApicurioStudioStatus,
) {
    let Some(health) = health else {
        return;
    };
    for module in Module::ALL {
        let state = after.module(module).state;
        if before.module(module).state != state {
            health
                .metrics
                .record_module_transition(&module.to_string(), &state.to_string());
        }
    }
}

/// Reconcile an ApicurioStudio
///
/// This is the main reconciliation function called by the controller.
/// The instance is re-read under its lock so that the pass starts from the
/// status last written by either the reconciler or the deployment watch.
pub async fn reconcile(obj: Arc<ApicurioStudio>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;

    // Owned objects are garbage collected through their owner references
    if obj.metadata.deletion_timestamp.is_some() {
        debug!(name = %name, namespace = %namespace, "Instance is being deleted");
        return Ok(Action::await_change());
    }

    let _guard = ctx.locks.lock(&InstanceKey::new(&namespace, &name)).await;

    let Some(studio) = ctx.client.get_studio(&namespace, &name).await? else {
        debug!(name = %name, "Instance no longer exists");
        return Ok(Action::await_change());
    };

    debug!(name = %name, namespace = %namespace, "Reconciling ApicurioStudio");
    let before = studio.status.clone().unwrap_or_default();
    let outcome = match run_pass(ctx.client.as_ref(), ctx.capabilities, &studio).await {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.client
                .publish_event(
                    &studio,
                    StudioEvent::warning("ProvisioningFailed", "Reconciling", e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    if let PassOutcome::Provisioned(StatusWrite::Written(after)) = &outcome {
        record_transitions(ctx.health_state.as_ref(), &before, after);
        if before.state != after.state {
            ctx.client
                .publish_event(
                    &studio,
                    StudioEvent::normal(
                        "Provisioned",
                        "Reconciling",
                        format!("Instance is {}", after.state),
                    ),
                )
                .await;
        }
        info!(name = %name, state = %after.state, "Reconcile pass complete");
    }

    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        health_state
            .last_reconcile
            .store(Timestamp::now().as_second().unsigned_abs(), Ordering::Relaxed);
    }

    Ok(Action::await_change())
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<ApicurioStudio>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    error!(name = %name, error = %error, retryable = error.is_retryable(), "Reconcile pass failed");
    failed_pass_action(ctx.config.failed_pass_policy)
}

/// Action taken after a failed pass.
pub fn failed_pass_action(policy: FailedPassPolicy) -> Action {
    match policy {
        FailedPassPolicy::AwaitTrigger => Action::await_change(),
        FailedPassPolicy::Requeue(delay) => Action::requeue(delay),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::controller::client::MockStudioClient;
    use crate::crd::ModuleState;
    use crate::resources::OwnedObject;
    use crate::resources::common::tests::studio as fixture;
    use std::sync::Mutex;
    use std::time::Duration;

    const INGRESS: ClusterCapabilities = ClusterCapabilities {
        exposure: Exposure::Ingress,
    };
    const ROUTES: ClusterCapabilities = ClusterCapabilities {
        exposure: Exposure::Route,
    };

    /// Mock accepting every call and recording applied object names.
    fn recording_client(applied: Arc<Mutex<Vec<String>>>) -> MockStudioClient {
        let mut client = MockStudioClient::new();
        client.expect_get_secret().returning(|_, _| Ok(None));
        client
            .expect_apply()
            .returning(move |_, object: &OwnedObject| {
                applied
                    .lock()
                    .unwrap()
                    .push(format!("{}/{}", object.kind(), object.name()));
                Ok(())
            });
        client.expect_create_claim_if_absent().returning(|_, _| Ok(true));
        client.expect_apply_route().returning(|_, route| {
            Ok(route
                .metadata
                .name
                .as_ref()
                .map(|n| format!("{}.apps.example.com", n)))
        });
        client.expect_replace_status().returning(|_, _, _, _| Ok(()));
        client
    }

    fn written(outcome: PassOutcome) -> ApicurioStudioStatus {
        match outcome {
            PassOutcome::Provisioned(StatusWrite::Written(status)) => status,
            other => panic!("expected a written status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_instance_makes_no_calls() {
        let client = MockStudioClient::new();
        let mut studio = fixture("demo");
        studio.status = Some(ApicurioStudioStatus {
            state: StudioState::Ready,
            ..Default::default()
        });

        let outcome = run_pass(&client, INGRESS, &studio).await.unwrap();
        assert_eq!(outcome, PassOutcome::Stable);
    }

    #[tokio::test]
    async fn test_full_pass_order_and_status() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let client = recording_client(applied.clone());

        let status = written(run_pass(&client, INGRESS, &fixture("demo")).await.unwrap());

        assert_eq!(
            *applied.lock().unwrap(),
            vec![
                "Ingress/demo-ui",
                "Secret/demo-auth-keycloak",
                "Service/demo-auth",
                "Ingress/demo-auth",
                "Deployment/demo-auth",
                "Secret/demo-db-connection",
                "Service/demo-db",
                "Deployment/demo-db",
                "Service/demo-api",
                "Ingress/demo-api",
                "Deployment/demo-api",
                "Service/demo-ws",
                "Ingress/demo-ws",
                "Deployment/demo-ws",
                "Service/demo-ui",
                "Deployment/demo-ui",
            ]
        );
        assert_eq!(status.state, StudioState::Deploying);
        assert_eq!(status.studio_url.as_deref(), Some("apicurio-studio-ui.studio.example.com"));
        assert_eq!(status.api_url.as_deref(), Some("apicurio-studio-api.studio.example.com"));
        for module in Module::ALL {
            assert_eq!(status.module(module).state, ModuleState::Deploying, "{}", module);
        }
    }

    #[tokio::test]
    async fn test_external_modules_are_preexisting() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockStudioClient::new();
        client.expect_get_secret().never();
        client.expect_create_claim_if_absent().never();
        {
            let applied = applied.clone();
            client.expect_apply().returning(move |_, object: &OwnedObject| {
                applied.lock().unwrap().push(object.name().to_string());
                Ok(())
            });
        }
        client.expect_replace_status().returning(|_, _, _, _| Ok(()));

        let mut studio = fixture("demo");
        studio.spec.keycloak.install = false;
        studio.spec.keycloak.url = Some("sso.corp.example.com".to_string());
        studio.spec.database.install = false;
        studio.spec.database.url = Some("pg.corp.internal:5432".to_string());

        let status = written(run_pass(&client, INGRESS, &studio).await.unwrap());

        assert_eq!(status.keycloak_module.state, ModuleState::Preexisting);
        assert_eq!(status.database_module.state, ModuleState::Preexisting);
        assert_eq!(status.keycloak_url.as_deref(), Some("sso.corp.example.com"));
        let applied = applied.lock().unwrap();
        assert!(!applied.is_empty());
        assert!(
            applied
                .iter()
                .all(|name| !name.starts_with("demo-auth") && !name.starts_with("demo-db"))
        );
    }

    #[tokio::test]
    async fn test_route_hosts_are_recorded() {
        let client = recording_client(Arc::new(Mutex::new(Vec::new())));

        let status = written(run_pass(&client, ROUTES, &fixture("demo")).await.unwrap());

        assert_eq!(status.studio_url.as_deref(), Some("demo-ui.apps.example.com"));
        assert_eq!(status.keycloak_url.as_deref(), Some("demo-auth.apps.example.com"));
        assert_eq!(status.ws_url.as_deref(), Some("demo-ws.apps.example.com"));
    }

    #[tokio::test]
    async fn test_failed_pass_persists_partial_status() {
        let mut client = MockStudioClient::new();
        client.expect_get_secret().returning(|_, _| Ok(None));
        client.expect_create_claim_if_absent().returning(|_, _| Ok(false));
        client.expect_apply().returning(|_, object: &OwnedObject| {
            if object.name() == "demo-db" && object.kind() == "Service" {
                Err(Error::Transient("connection reset".to_string()))
            } else {
                Ok(())
            }
        });
        client
            .expect_replace_status()
            .withf(|_, _, _, status| {
                status.keycloak_module.state == ModuleState::Deploying
                    && status.database_module.state == ModuleState::Unknown
                    && status.state == StudioState::Deploying
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let err = run_pass(&client, INGRESS, &fixture("demo")).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
    }

    #[tokio::test]
    async fn test_provision_group_only_touches_group() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let client = recording_client(applied.clone());

        let mut studio = fixture("demo");
        studio.status = Some(ApicurioStudioStatus {
            database_module: crate::crd::ModuleStatus {
                state: ModuleState::Error,
                error: true,
                ..Default::default()
            },
            ..Default::default()
        });

        let outcome = provision_group(&client, INGRESS, &studio, ProvisioningGroup::Database)
            .await
            .unwrap();

        assert_eq!(
            *applied.lock().unwrap(),
            vec!["Secret/demo-db-connection", "Service/demo-db", "Deployment/demo-db"]
        );
        match outcome {
            StatusWrite::Written(status) => {
                assert_eq!(status.database_module.state, ModuleState::Deploying);
                assert!(!status.database_module.error);
            }
            other => panic!("expected a write, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_pass_action() {
        assert_eq!(
            failed_pass_action(FailedPassPolicy::AwaitTrigger),
            Action::await_change()
        );
        assert_eq!(
            failed_pass_action(FailedPassPolicy::Requeue(Duration::from_secs(60))),
            Action::requeue(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_endpoints_from_status() {
        let status = ApicurioStudioStatus {
            keycloak_url: Some("auth.example.com".to_string()),
            ..Default::default()
        };
        let endpoints = endpoints_from_status(&status);
        assert_eq!(endpoints.keycloak_url, "auth.example.com");
        assert!(endpoints.api_url.is_empty());
    }
}
