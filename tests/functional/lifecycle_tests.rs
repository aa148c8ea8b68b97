//! Full lifecycle of an instance: first pass, readiness, repeated passes.

use std::sync::Arc;

use kube::runtime::controller::Action;
use studio_operator::controller::aggregator::{READY_MESSAGE, RECONCILING_MESSAGE};
use studio_operator::controller::deployment_watch::{handle_notification, translate};
use studio_operator::controller::reconciler::reconcile;
use studio_operator::crd::{Module, ModuleState, StudioState};
use studio_operator::resources::{Exposure, OwnedObject, secret_value};

use crate::common::fixtures::{ApicurioStudioBuilder, test_studio};
use crate::{DEMO_DEPLOYMENTS, NS, harness};

async fn reconcile_demo(
    cluster: &crate::FakeCluster,
    ctx: &Arc<studio_operator::controller::context::Context>,
) -> Action {
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_first_pass_provisions_every_module() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));

    let action = reconcile_demo(&cluster, &ctx).await;
    assert_eq!(action, Action::await_change());

    for name in DEMO_DEPLOYMENTS {
        assert!(cluster.deployment(NS, name).is_some(), "missing {}", name);
    }
    assert!(cluster.secret(NS, "demo-auth-keycloak").is_some());
    assert!(cluster.secret(NS, "demo-db-connection").is_some());
    assert_eq!(cluster.claim_count(), 2);
    assert_eq!(cluster.route_count(), 0);

    let status = cluster.status(NS, "demo");
    assert_eq!(status.state, StudioState::Deploying);
    assert_eq!(status.message.as_deref(), Some(RECONCILING_MESSAGE));
    assert_eq!(
        status.studio_url.as_deref(),
        Some("apicurio-studio-ui.studio.example.com")
    );
    assert_eq!(
        status.ws_url.as_deref(),
        Some("apicurio-studio-ws.studio.example.com")
    );
    for module in Module::ALL {
        let module_status = status.module(module);
        assert_eq!(module_status.state, ModuleState::Deploying, "{}", module);
        assert!(!module_status.error);
        assert!(module_status.last_transition_time.is_some());
    }

    let events = cluster.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].warning);
}

#[tokio::test]
async fn test_instance_becomes_ready_once_every_module_reports_replicas() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile_demo(&cluster, &ctx).await;

    for (i, name) in DEMO_DEPLOYMENTS.iter().enumerate() {
        let notification = translate(&cluster.mark_ready(NS, name, 1)).unwrap();
        handle_notification(&ctx, &notification).await.unwrap();

        let status = cluster.status(NS, "demo");
        if i + 1 < DEMO_DEPLOYMENTS.len() {
            assert_eq!(status.state, StudioState::Deploying, "after {}", name);
        } else {
            assert_eq!(status.state, StudioState::Ready);
            assert_eq!(status.message.as_deref(), Some(READY_MESSAGE));
        }
    }

    let status = cluster.status(NS, "demo");
    assert_eq!(
        status.api_module.message.as_deref(),
        Some("1 ready replica(s)")
    );
}

#[tokio::test]
async fn test_pass_on_ready_instance_touches_nothing() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile_demo(&cluster, &ctx).await;
    for name in DEMO_DEPLOYMENTS {
        let notification = translate(&cluster.mark_ready(NS, name, 2)).unwrap();
        handle_notification(&ctx, &notification).await.unwrap();
    }
    cluster.take_journal();

    reconcile_demo(&cluster, &ctx).await;

    assert_eq!(cluster.take_journal(), vec!["get ApicurioStudio/demo"]);
    assert_eq!(cluster.status(NS, "demo").state, StudioState::Ready);
}

#[tokio::test]
async fn test_repeated_pass_is_idempotent() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile_demo(&cluster, &ctx).await;

    let objects = cluster.object_count();
    let secret = cluster.secret(NS, "demo-db-connection").unwrap();
    let password = secret_value(Some(&secret), "database-password").unwrap();
    let history = cluster.status_history().len();

    reconcile_demo(&cluster, &ctx).await;

    assert_eq!(cluster.object_count(), objects);
    assert_eq!(cluster.claim_count(), 2);
    let secret = cluster.secret(NS, "demo-db-connection").unwrap();
    assert_eq!(
        secret_value(Some(&secret), "database-password").as_deref(),
        Some(password.as_str())
    );
    // Nothing changed, so the status is not rewritten
    assert_eq!(cluster.status_history().len(), history);
}

#[tokio::test]
async fn test_external_identity_and_database_are_preexisting() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(
        ApicurioStudioBuilder::new("demo")
            .external_keycloak("sso.corp.example.com")
            .external_database("pg.corp.internal:5432")
            .build(),
    );

    reconcile_demo(&cluster, &ctx).await;

    assert!(cluster.deployment(NS, "demo-auth").is_none());
    assert!(cluster.deployment(NS, "demo-db").is_none());
    assert!(cluster.secret(NS, "demo-db-connection").is_none());
    assert_eq!(cluster.claim_count(), 0);

    let status = cluster.status(NS, "demo");
    assert_eq!(status.keycloak_module.state, ModuleState::Preexisting);
    assert_eq!(status.database_module.state, ModuleState::Preexisting);
    assert_eq!(status.keycloak_url.as_deref(), Some("sso.corp.example.com"));

    let api = cluster.deployment(NS, "demo-api").unwrap();
    let env = api.spec.unwrap().template.spec.unwrap().containers[0]
        .env
        .clone()
        .unwrap();
    let connection = env
        .iter()
        .find(|e| e.name == "APICURIO_DB_CONNECTION_URL")
        .and_then(|e| e.value.clone());
    assert_eq!(
        connection.as_deref(),
        Some("jdbc:postgresql://pg.corp.internal:5432/apicuriodb")
    );

    for name in ["demo-api", "demo-ws", "demo-ui"] {
        let notification = translate(&cluster.mark_ready(NS, name, 1)).unwrap();
        handle_notification(&ctx, &notification).await.unwrap();
    }
    assert_eq!(cluster.status(NS, "demo").state, StudioState::Ready);
}

#[tokio::test]
async fn test_route_cluster_records_router_hosts() {
    let (cluster, ctx) = harness(Exposure::Route);
    cluster.insert_studio(test_studio("demo"));

    reconcile_demo(&cluster, &ctx).await;

    assert_eq!(cluster.route_count(), 4);
    assert!(cluster.object("Ingress", NS, "demo-api").is_none());

    let status = cluster.status(NS, "demo");
    assert_eq!(
        status.studio_url.as_deref(),
        Some("demo-ui-apicurio.apps.example.com")
    );
    assert_eq!(
        status.keycloak_url.as_deref(),
        Some("demo-auth-apicurio.apps.example.com")
    );

    // The identity provider redirects back to the UI host
    let Some(OwnedObject::Deployment(keycloak)) = cluster.object("Deployment", NS, "demo-auth")
    else {
        panic!("identity deployment missing");
    };
    let env = keycloak.spec.unwrap().template.spec.unwrap().containers[0]
        .env
        .clone()
        .unwrap();
    assert!(env.iter().any(|e| e.name == "APICURIO_UI_URL"
        && e.value.as_deref() == Some("https://demo-ui-apicurio.apps.example.com")));
}
