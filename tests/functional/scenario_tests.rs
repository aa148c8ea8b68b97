//! Multi-step scenarios: drift repair, concurrent writers, failed passes.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::Action;
use kube::runtime::watcher::{self, Event};
use studio_operator::config::FailedPassPolicy;
use studio_operator::controller::deployment_watch::{
    DeploymentAction, handle_notification, process_events, translate,
};
use studio_operator::controller::error::Error;
use studio_operator::controller::reconciler::{failed_pass_action, reconcile};
use studio_operator::controller::state_machine::UNEXPECTED_DELETION_MESSAGE;
use studio_operator::crd::{ApicurioStudioStatus, ModuleState, ModuleStatus, StudioState};
use studio_operator::resources::{Exposure, database};

use crate::common::fixtures::{ApicurioStudioBuilder, test_studio};
use crate::{NS, harness};

fn count(journal: &[String], entry: &str) -> usize {
    journal.iter().filter(|e| e.as_str() == entry).count()
}

#[test]
fn test_connection_string_for_provisioned_database() {
    let studio = ApicurioStudioBuilder::new("demo")
        .database_name("designs")
        .build();
    assert_eq!(
        database::connection_string(&studio.spec),
        "postgresql://demo-db:5432/designs"
    );
}

#[tokio::test]
async fn test_unexpected_api_deletion_reprovisions_studio_group() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();
    let writes_before = cluster.status_history().len();
    cluster.take_journal();

    let notification = translate(&cluster.delete_deployment(NS, "demo-api")).unwrap();
    assert_eq!(notification.action, DeploymentAction::Deleted);
    handle_notification(&ctx, &notification).await.unwrap();

    // Error is persisted before the group is provisioned again
    let history = cluster.status_history();
    let marked = &history[writes_before];
    assert_eq!(marked.api_module.state, ModuleState::Error);
    assert!(marked.api_module.error);
    assert_eq!(
        marked.api_module.message.as_deref(),
        Some(UNEXPECTED_DELETION_MESSAGE)
    );
    assert_eq!(marked.state, StudioState::Deploying);

    let journal = cluster.take_journal();
    assert_eq!(count(&journal, "apply Deployment/demo-api"), 1);
    assert_eq!(count(&journal, "apply Deployment/demo-ws"), 1);
    assert_eq!(count(&journal, "apply Deployment/demo-ui"), 1);
    assert_eq!(count(&journal, "apply Deployment/demo-auth"), 0);
    assert_eq!(count(&journal, "apply Deployment/demo-db"), 0);

    assert!(cluster.deployment(NS, "demo-api").is_some());
    let status = cluster.status(NS, "demo");
    assert_eq!(status.api_module.state, ModuleState::Deploying);
    assert!(!status.api_module.error);
}

#[tokio::test]
async fn test_unexpected_database_deletion_reprovisions_database_only() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();
    let password = cluster.secret(NS, "demo-db-connection").unwrap();
    cluster.take_journal();

    let notification = translate(&cluster.delete_deployment(NS, "demo-db")).unwrap();
    handle_notification(&ctx, &notification).await.unwrap();

    let journal = cluster.take_journal();
    assert_eq!(count(&journal, "apply Deployment/demo-db"), 1);
    assert_eq!(count(&journal, "apply Deployment/demo-api"), 0);
    // The existing claim is left alone
    assert_eq!(cluster.claim_count(), 2);
    assert_eq!(cluster.secret(NS, "demo-db-connection").unwrap(), password);
}

#[tokio::test]
async fn test_ready_ws_replica_transitions_module() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();

    let mut status = cluster.status(NS, "demo");
    status.ws_module.last_transition_time = Some("2024-01-01T00:00:00Z".to_string());
    cluster.set_status(NS, "demo", status);

    let notification = translate(&cluster.mark_ready(NS, "demo-ws", 1)).unwrap();
    handle_notification(&ctx, &notification).await.unwrap();

    let status = cluster.status(NS, "demo");
    assert_eq!(status.ws_module.state, ModuleState::Ready);
    assert_ne!(
        status.ws_module.last_transition_time.as_deref(),
        Some("2024-01-01T00:00:00Z")
    );
    assert!(status.ws_module.last_transition_time.is_some());
    // Other modules are still deploying
    assert_eq!(status.state, StudioState::Deploying);
}

#[tokio::test]
async fn test_zero_ready_replicas_leave_status_alone() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();
    let writes = cluster.status_history().len();

    let notification = translate(&cluster.mark_ready(NS, "demo-ui", 0)).unwrap();
    handle_notification(&ctx, &notification).await.unwrap();

    assert_eq!(cluster.status_history().len(), writes);
    assert_eq!(
        cluster.status(NS, "demo").ui_module.state,
        ModuleState::Deploying
    );
}

#[tokio::test]
async fn test_terminating_deployment_marks_module_error() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();
    cluster.take_journal();

    let notification = translate(&cluster.terminating(NS, "demo-auth")).unwrap();
    assert_eq!(notification.action, DeploymentAction::Modified);
    handle_notification(&ctx, &notification).await.unwrap();

    let status = cluster.status(NS, "demo");
    assert_eq!(status.keycloak_module.state, ModuleState::Error);
    // Re-provisioning waits for the deletion itself
    assert!(
        cluster
            .take_journal()
            .iter()
            .all(|entry| !entry.starts_with("apply"))
    );
}

#[tokio::test]
async fn test_status_write_survives_conflicting_writers() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();
    cluster.take_journal();
    cluster.reject_status_writes(2);

    let notification = translate(&cluster.mark_ready(NS, "demo-api", 1)).unwrap();
    handle_notification(&ctx, &notification).await.unwrap();

    let journal = cluster.take_journal();
    assert_eq!(count(&journal, "status ApicurioStudio/demo"), 3);
    assert_eq!(
        cluster.status(NS, "demo").api_module.state,
        ModuleState::Ready
    );
}

#[tokio::test]
async fn test_pass_keeps_readiness_recorded_by_the_watch() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    let observed = cluster.studio(NS, "demo");
    reconcile(Arc::new(observed.clone()), ctx.clone())
        .await
        .unwrap();

    // Another writer marks the UI ready after the trigger was queued
    let mut status = cluster.status(NS, "demo");
    status.ui_module = ModuleStatus {
        state: ModuleState::Ready,
        ..Default::default()
    };
    cluster.set_status(NS, "demo", status);

    // The pass re-reads the instance instead of trusting the trigger's copy
    reconcile(Arc::new(observed), ctx.clone()).await.unwrap();

    assert_eq!(
        cluster.status(NS, "demo").ui_module.state,
        ModuleState::Ready
    );
}

#[tokio::test]
async fn test_failed_pass_persists_progress_and_awaits_trigger() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    cluster.fail_apply_of("demo-db");

    let err = reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transient(_)));
    assert_eq!(
        failed_pass_action(FailedPassPolicy::AwaitTrigger),
        Action::await_change()
    );
    let events = cluster.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].warning);
    assert_eq!(events[0].reason, "ProvisioningFailed");
    assert!(events[0].note.as_deref().unwrap().contains("demo-db"));

    let status = cluster.status(NS, "demo");
    assert_eq!(status.state, StudioState::Deploying);
    assert_eq!(status.keycloak_module.state, ModuleState::Deploying);
    assert_eq!(status.database_module.state, ModuleState::Unknown);
    assert_eq!(status.api_module.state, ModuleState::Unknown);
    assert!(cluster.deployment(NS, "demo-api").is_none());

    cluster.clear_failures();
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();
    let status = cluster.status(NS, "demo");
    assert_eq!(status.database_module.state, ModuleState::Deploying);
    assert_eq!(status.api_module.state, ModuleState::Deploying);
}

#[tokio::test]
async fn test_notification_for_unknown_instance_is_dropped() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("demo"));
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();

    let mut notification = translate(&cluster.mark_ready(NS, "demo-api", 1)).unwrap();
    notification.instance.name = "other".to_string();
    let writes = cluster.status_history().len();

    handle_notification(&ctx, &notification).await.unwrap();
    assert_eq!(cluster.status_history().len(), writes);
}

#[tokio::test]
async fn test_watch_stream_drives_status_until_it_ends() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(
        ApicurioStudioBuilder::new("demo")
            .external_keycloak("sso.corp.example.com")
            .external_database("pg.corp.internal:5432")
            .build(),
    );
    reconcile(Arc::new(cluster.studio(NS, "demo")), ctx.clone())
        .await
        .unwrap();

    let events = vec![
        Ok(cluster.mark_ready(NS, "demo-api", 1)),
        Ok(cluster.mark_ready(NS, "demo-ws", 1)),
        Ok(cluster.mark_ready(NS, "demo-ui", 1)),
    ];
    let err = process_events(ctx.clone(), futures::stream::iter(events))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Fatal(_)));
    let status: ApicurioStudioStatus = cluster.status(NS, "demo");
    assert_eq!(status.state, StudioState::Ready);
}

#[tokio::test]
async fn test_unresponsive_instance_does_not_hold_up_others() {
    let (cluster, ctx) = harness(Exposure::Ingress);
    cluster.insert_studio(test_studio("slow"));
    cluster.insert_studio(ApicurioStudioBuilder::new("fast").namespace("team-b").build());
    for (namespace, name) in [(NS, "slow"), ("team-b", "fast")] {
        reconcile(Arc::new(cluster.studio(namespace, name)), ctx.clone())
            .await
            .unwrap();
    }
    cluster.stall_reads_of("slow");

    let events: Vec<Result<Event<Deployment>, watcher::Error>> = vec![
        Ok(cluster.mark_ready(NS, "slow-ws", 1)),
        Ok(cluster.mark_ready("team-b", "fast-ws", 1)),
    ];
    let stream = futures::stream::iter(events).chain(futures::stream::pending());
    let watch = tokio::spawn(process_events(ctx.clone(), stream));

    let fast_ready = tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.status("team-b", "fast").ws_module.state != ModuleState::Ready {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    watch.abort();

    assert!(fast_ready.is_ok(), "team-b/fast waited behind apicurio/slow");
    assert_eq!(
        cluster.status(NS, "slow").ws_module.state,
        ModuleState::Deploying
    );
}
