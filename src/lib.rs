//! studio-operator library crate
//!
//! This module exports the controller, CRD definitions, resource generators
//! and the two loops the binary runs: the ApicurioStudio controller and the
//! Deployment watch.

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::{ConfigError, OperatorConfig};
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::client::KubeStudioClient;
use controller::context::Context;
use controller::deployment_watch::{managed_selector, process_events};
use controller::error::Result;
use controller::reconciler::{error_policy, reconcile};
use crd::ApicurioStudio;
use resources::ClusterCapabilities;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Resolve cluster capabilities.
///
/// An explicit `STUDIO_EXPOSURE` wins; otherwise the Route API group is
/// looked up through API discovery.
pub async fn detect_capabilities(
    client: &Client,
    config: &OperatorConfig,
) -> Result<ClusterCapabilities> {
    if let Some(exposure) = config.exposure_override {
        info!(%exposure, "Exposure forced by configuration");
        return Ok(ClusterCapabilities { exposure });
    }

    let groups = client.list_api_groups().await?;
    let capabilities =
        ClusterCapabilities::from_api_groups(groups.groups.iter().map(|g| g.name.as_str()));
    info!(exposure = %capabilities.exposure, "Detected cluster capabilities");
    Ok(capabilities)
}

/// Build the context shared by the controller and the Deployment watch.
pub async fn build_context(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) -> Result<Arc<Context>> {
    let capabilities = detect_capabilities(&client, &config).await?;
    let studio_client = Arc::new(KubeStudioClient::new(client, config.pod_name.clone()));
    Ok(Arc::new(Context::new(
        studio_client,
        capabilities,
        config,
        health_state,
    )))
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = std::result::Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Run the ApicurioStudio controller.
///
/// Status writes do not bump `metadata.generation`, so the generation
/// predicate keeps the operator from reacting to its own status updates.
pub async fn run_controller(client: Client, ctx: Arc<Context>) {
    let namespace = ctx.config.watch_namespace.clone();
    info!(
        "Starting controller for ApicurioStudio resources (scope: {})",
        namespace.as_deref().unwrap_or("cluster-wide")
    );

    if let Some(ref state) = ctx.health_state {
        state.set_ready(true).await;
    }

    let studios: Api<ApicurioStudio> = scoped_api(client, namespace.as_deref());
    let (reader, resource_stream) = create_filtered_stream(studios, WatcherConfig::default());

    Controller::for_stream(resource_stream, reader)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Expected after deletion when a queued trigger outlives the object
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    error!("Controller stream ended unexpectedly");
}

/// Run the Deployment watch until it fails fatally.
///
/// Only Deployments labelled as managed by the operator are watched.
pub async fn run_deployment_watch(client: Client, ctx: Arc<Context>) -> Result<()> {
    let namespace = ctx.config.watch_namespace.clone();
    info!(
        selector = %managed_selector(),
        "Starting deployment watch (scope: {})",
        namespace.as_deref().unwrap_or("cluster-wide")
    );

    let deployments: Api<Deployment> = scoped_api(client, namespace.as_deref());
    let stream = watcher(
        deployments,
        WatcherConfig::default().labels(&managed_selector()),
    )
    .default_backoff();

    process_events(ctx, stream).await
}
