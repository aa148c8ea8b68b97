//! Deployment watch.
//!
//! Watches every Deployment managed by the operator and turns modifications
//! and deletions into module status transitions. A deletion that the
//! operator did not ask for marks the module `Error` and re-provisions its
//! group, so an out-of-band `kubectl delete` heals on its own.
//!
//! Each instance gets its own queue and worker: notifications for one
//! instance are handled in arrival order, while a slow instance never holds
//! up the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use kube::runtime::watcher::{self, Event};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::controller::aggregator::StatusDelta;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::instance_lock::InstanceKey;
use crate::controller::reconciler::{provision_group, record_transitions};
use crate::controller::state_machine::{ModuleEvent, TransitionContext};
use crate::controller::status::{StatusWrite, write_status};
use crate::crd::{ApicurioStudio, MODULE_LABEL, Module};
use crate::resources::common::{MANAGED_BY_LABEL, OPERATOR_ID};

/// Label selector matching every Deployment the operator owns.
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, OPERATOR_ID)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentAction {
    Modified,
    Deleted,
}

impl fmt::Display for DeploymentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentAction::Modified => write!(f, "Modified"),
            DeploymentAction::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A Deployment event resolved to the instance and module it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentNotification {
    pub action: DeploymentAction,
    pub instance: InstanceKey,
    pub module: Module,
    pub ready_replicas: i32,
    /// The Deployment itself carries a deletion timestamp
    pub marked_for_deletion: bool,
}

/// Resolve a Deployment to its notification, if it belongs to an instance.
pub fn notification_for(
    action: DeploymentAction,
    deployment: &Deployment,
) -> Option<DeploymentNotification> {
    let name = deployment.name_any();
    let namespace = deployment.namespace()?;

    let Some(owner) = deployment
        .owner_references()
        .iter()
        .find(|o| o.kind == "ApicurioStudio")
    else {
        debug!(deployment = %name, "Ignoring deployment without an ApicurioStudio owner");
        return None;
    };

    let label = deployment.labels().get(MODULE_LABEL);
    let Some(module) = label.and_then(|l| Module::from_label(l)) else {
        debug!(deployment = %name, label = ?label, "Ignoring deployment with unknown module label");
        return None;
    };

    Some(DeploymentNotification {
        action,
        instance: InstanceKey::new(&namespace, &owner.name),
        module,
        ready_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
        marked_for_deletion: deployment.metadata.deletion_timestamp.is_some(),
    })
}

/// Translate a watcher event. Bookkeeping events yield nothing.
pub fn translate(event: &Event<Deployment>) -> Option<DeploymentNotification> {
    match event {
        Event::Apply(d) | Event::InitApply(d) => notification_for(DeploymentAction::Modified, d),
        Event::Delete(d) => notification_for(DeploymentAction::Deleted, d),
        Event::Init | Event::InitDone => None,
    }
}

/// Module event implied by a modification, if any.
pub fn modified_event(notification: &DeploymentNotification) -> Option<ModuleEvent> {
    if notification.marked_for_deletion {
        Some(ModuleEvent::UnexpectedDeletion)
    } else if notification.ready_replicas >= 1 {
        Some(ModuleEvent::ReplicasReady)
    } else {
        None
    }
}

/// Whether a watch error means the operator can never watch successfully.
pub fn is_fatal(error: &watcher::Error) -> bool {
    let denied = |code: u16| code == 401 || code == 403;
    match error {
        watcher::Error::InitialListFailed(kube::Error::Api(e))
        | watcher::Error::WatchStartFailed(kube::Error::Api(e))
        | watcher::Error::WatchFailed(kube::Error::Api(e)) => denied(e.code),
        watcher::Error::WatchError(e) => denied(e.code),
        _ => false,
    }
}

fn instance_is_live(studio: &ApicurioStudio) -> bool {
    studio.status.is_some() && studio.metadata.deletion_timestamp.is_none()
}

/// Apply one notification to the status of its instance.
pub async fn handle_notification(
    ctx: &Context,
    notification: &DeploymentNotification,
) -> Result<()> {
    let key = &notification.instance;
    let module = notification.module;
    let _guard = ctx.locks.lock(key).await;

    let Some(studio) = ctx.client.get_studio(&key.namespace, &key.name).await? else {
        debug!(instance = %key, "Instance no longer exists, dropping notification");
        return Ok(());
    };
    if !instance_is_live(&studio) {
        debug!(instance = %key, "Instance not reconciled yet or being deleted");
        return Ok(());
    }

    if let Some(ref health) = ctx.health_state {
        health
            .metrics
            .record_watch_notification(&notification.action.to_string());
    }

    let event = match notification.action {
        DeploymentAction::Modified => match modified_event(notification) {
            Some(event) => event,
            None => return Ok(()),
        },
        DeploymentAction::Deleted => ModuleEvent::UnexpectedDeletion,
    };

    let before = studio.status.clone().unwrap_or_default();
    let delta = StatusDelta::single(
        module,
        event,
        TransitionContext::new(notification.ready_replicas),
    );
    let written = write_status(
        ctx.client.as_ref(),
        &key.namespace,
        &key.name,
        Some((studio.metadata.resource_version.clone(), before.clone())),
        &delta,
    )
    .await?;

    if let StatusWrite::Written(ref after) = written {
        record_transitions(ctx.health_state.as_ref(), &before, after);
        info!(
            instance = %key,
            module = %module,
            state = %after.module(module).state,
            "Module status updated"
        );
    }

    if notification.action == DeploymentAction::Deleted {
        // Re-read so that provisioning starts from the status just written
        let Some(studio) = ctx.client.get_studio(&key.namespace, &key.name).await? else {
            return Ok(());
        };
        let group = module.group();
        warn!(
            instance = %key,
            module = %module,
            ?group,
            "Deployment deleted out of band, re-provisioning"
        );
        if let Some(ref health) = ctx.health_state {
            health.metrics.record_drift_repair(&format!("{:?}", group));
        }
        let before = studio.status.clone().unwrap_or_default();
        if let StatusWrite::Written(after) =
            provision_group(ctx.client.as_ref(), ctx.capabilities, &studio, group).await?
        {
            record_transitions(ctx.health_state.as_ref(), &before, &after);
        }
    }

    Ok(())
}

/// Routes notifications to one worker task per instance.
struct Dispatcher {
    ctx: Arc<Context>,
    queues: HashMap<InstanceKey, mpsc::UnboundedSender<DeploymentNotification>>,
    workers: JoinSet<()>,
}

impl Dispatcher {
    fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            queues: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    fn dispatch(&mut self, notification: DeploymentNotification) {
        // Reap workers that stopped, e.g. after a panic in a handler
        while let Some(result) = self.workers.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "Notification worker stopped unexpectedly");
            }
        }

        let notification = match self.queues.get(&notification.instance) {
            Some(queue) => match queue.send(notification) {
                Ok(()) => return,
                Err(mpsc::error::SendError(notification)) => notification,
            },
            None => notification,
        };

        let key = notification.instance.clone();
        let (queue, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so the first send cannot fail
        let _ = queue.send(notification);
        self.workers
            .spawn(run_worker(self.ctx.clone(), key.clone(), receiver));
        self.queues.insert(key, queue);
    }

    /// Close every queue and wait for the queued notifications to finish.
    async fn drain(mut self) {
        self.queues.clear();
        while self.workers.join_next().await.is_some() {}
    }
}

async fn run_worker(
    ctx: Arc<Context>,
    key: InstanceKey,
    mut receiver: mpsc::UnboundedReceiver<DeploymentNotification>,
) {
    while let Some(notification) = receiver.recv().await {
        if let Err(e) = handle_notification(&ctx, &notification).await {
            warn!(
                instance = %key,
                module = %notification.module,
                error = %e,
                "Failed to handle deployment notification"
            );
        }
    }
    debug!(instance = %key, "Notification queue closed");
}

/// Drive notifications from a watch stream until it ends or fails fatally.
///
/// A fatal error returns at once and abandons queued notifications; the end
/// of the stream lets queued notifications finish first.
pub async fn process_events<S>(ctx: Arc<Context>, stream: S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Event<Deployment>, watcher::Error>>,
{
    let mut dispatcher = Dispatcher::new(ctx);
    let mut stream = std::pin::pin!(stream);
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(notification) = translate(&event) {
                    dispatcher.dispatch(notification);
                }
            }
            Err(e) if is_fatal(&e) => {
                return Err(Error::Fatal(format!("deployment watch denied: {}", e)));
            }
            Err(e) => {
                warn!(error = %e, "Deployment watch error, backing off");
            }
        }
    }
    dispatcher.drain().await;
    Err(Error::Fatal("deployment watch stream ended".to_string()))
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
    use crate::config::OperatorConfig;
    use crate::controller::client::MockStudioClient;
    use crate::crd::{ApicurioStudioStatus, ModuleState, ModuleStatus, StudioState};
    use crate::resources::common::tests::studio as fixture;
    use crate::resources::{ClusterCapabilities, Exposure, studio};
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn api_deployment(ready_replicas: Option<i32>) -> Deployment {
        let mut deployment =
            studio::generate_deployment(&fixture("demo"), Module::Api, &Default::default())
                .unwrap();
        deployment.status = Some(DeploymentStatus {
            ready_replicas,
            ..Default::default()
        });
        deployment
    }

    fn context(client: MockStudioClient) -> Context {
        Context::new(
            Arc::new(client),
            ClusterCapabilities {
                exposure: Exposure::Ingress,
            },
            OperatorConfig::default(),
            None,
        )
    }

    fn deploying_studio() -> ApicurioStudio {
        let mut studio = fixture("demo");
        studio.metadata.resource_version = Some("7".to_string());
        studio.status = Some(ApicurioStudioStatus {
            state: StudioState::Deploying,
            api_module: ModuleStatus {
                state: ModuleState::Deploying,
                ..Default::default()
            },
            ..Default::default()
        });
        studio
    }

    fn notification(action: DeploymentAction, ready_replicas: i32) -> DeploymentNotification {
        DeploymentNotification {
            action,
            instance: InstanceKey::new("apicurio", "demo"),
            module: Module::Api,
            ready_replicas,
            marked_for_deletion: false,
        }
    }

    #[test]
    fn test_translate_apply() {
        let n = translate(&Event::Apply(api_deployment(Some(2)))).unwrap();
        assert_eq!(n.action, DeploymentAction::Modified);
        assert_eq!(n.instance, InstanceKey::new("apicurio", "demo"));
        assert_eq!(n.module, Module::Api);
        assert_eq!(n.ready_replicas, 2);
        assert!(!n.marked_for_deletion);
    }

    #[test]
    fn test_translate_delete_and_bookkeeping() {
        let n = translate(&Event::Delete(api_deployment(None))).unwrap();
        assert_eq!(n.action, DeploymentAction::Deleted);
        assert_eq!(n.ready_replicas, 0);
        assert!(translate(&Event::Init).is_none());
        assert!(translate(&Event::InitDone).is_none());
    }

    #[test]
    fn test_translate_ignores_unknown_module_label() {
        let mut deployment = api_deployment(Some(1));
        deployment
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(MODULE_LABEL.to_string(), "sidecar".to_string());
        assert!(translate(&Event::Apply(deployment)).is_none());
    }

    #[test]
    fn test_translate_ignores_unowned_deployment() {
        let mut deployment = api_deployment(Some(1));
        deployment.metadata.owner_references = None;
        assert!(translate(&Event::Apply(deployment)).is_none());
    }

    #[test]
    fn test_modified_event() {
        let mut n = notification(DeploymentAction::Modified, 0);
        assert_eq!(modified_event(&n), None);
        n.ready_replicas = 1;
        assert_eq!(modified_event(&n), Some(ModuleEvent::ReplicasReady));
        n.marked_for_deletion = true;
        assert_eq!(modified_event(&n), Some(ModuleEvent::UnexpectedDeletion));
    }

    #[test]
    fn test_marked_for_deletion_is_translated() {
        let mut deployment = api_deployment(Some(1));
        deployment.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2026-03-01T12:00:00Z")).unwrap());
        let n = translate(&Event::Apply(deployment)).unwrap();
        assert!(n.marked_for_deletion);
    }

    #[test]
    fn test_managed_selector() {
        assert_eq!(
            managed_selector(),
            "app.kubernetes.io/managed-by=apicurio-studio-operator"
        );
    }

    #[tokio::test]
    async fn test_ready_replicas_mark_module_ready() {
        let mut client = MockStudioClient::new();
        client
            .expect_get_studio()
            .returning(|_, _| Ok(Some(deploying_studio())));
        client
            .expect_replace_status()
            .withf(|ns, name, rv, status| {
                ns == "apicurio"
                    && name == "demo"
                    && rv.as_deref() == Some("7")
                    && status.api_module.state == ModuleState::Ready
                    && status.api_module.message.as_deref() == Some("1 ready replica(s)")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let ctx = context(client);
        handle_notification(&ctx, &notification(DeploymentAction::Modified, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_ready_replicas_write_nothing() {
        let mut client = MockStudioClient::new();
        client
            .expect_get_studio()
            .returning(|_, _| Ok(Some(deploying_studio())));
        client.expect_replace_status().never();

        let ctx = context(client);
        handle_notification(&ctx, &notification(DeploymentAction::Modified, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreconciled_instance_is_skipped() {
        let mut client = MockStudioClient::new();
        client
            .expect_get_studio()
            .returning(|_, _| Ok(Some(fixture("demo"))));
        client.expect_replace_status().never();

        let ctx = context(client);
        handle_notification(&ctx, &notification(DeploymentAction::Deleted, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_instance_is_skipped() {
        let mut client = MockStudioClient::new();
        client.expect_get_studio().returning(|_, _| Ok(None));

        let ctx = context(client);
        handle_notification(&ctx, &notification(DeploymentAction::Modified, 3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deletion_marks_error_then_reprovisions_group() {
        let mut client = MockStudioClient::new();
        let mut seq = mockall::Sequence::new();

        client
            .expect_get_studio()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(deploying_studio())));
        client
            .expect_replace_status()
            .withf(|_, _, _, status| {
                status.api_module.state == ModuleState::Error && status.api_module.error
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        client
            .expect_get_studio()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                let mut studio = deploying_studio();
                studio.metadata.resource_version = Some("8".to_string());
                studio.status.as_mut().unwrap().api_module = ModuleStatus {
                    state: ModuleState::Error,
                    error: true,
                    ..Default::default()
                };
                Ok(Some(studio))
            });
        client.expect_apply().returning(|_, _| Ok(()));
        client
            .expect_replace_status()
            .withf(|_, _, rv, status| {
                rv.as_deref() == Some("8")
                    && status.api_module.state == ModuleState::Deploying
                    && !status.api_module.error
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        let ctx = context(client);
        handle_notification(&ctx, &notification(DeploymentAction::Deleted, 0))
            .await
            .unwrap();
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(
            serde_json::from_value(serde_json::json!({
                "status": "Failure",
                "message": format!("{} from test", reason),
                "reason": reason,
                "code": code,
            }))
            .unwrap(),
        )
    }

    fn watch_error(code: u16, reason: &str) -> watcher::Error {
        watcher::Error::WatchError(
            serde_json::from_value(serde_json::json!({
                "status": "Failure",
                "message": format!("{} from test", reason),
                "reason": reason,
                "code": code,
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_denied_watch_is_fatal() {
        assert!(is_fatal(&watch_error(403, "Forbidden")));
        assert!(is_fatal(&watch_error(401, "Unauthorized")));
        assert!(is_fatal(&watcher::Error::InitialListFailed(api_error(
            403,
            "Forbidden"
        ))));
        assert!(!is_fatal(&watch_error(500, "InternalError")));
        assert!(!is_fatal(&watcher::Error::WatchFailed(api_error(
            503,
            "ServiceUnavailable"
        ))));
    }

    #[tokio::test]
    async fn test_forbidden_watch_ends_processing() {
        let mut client = MockStudioClient::new();
        client.expect_get_studio().never();
        let ctx = Arc::new(context(client));

        let stream = futures::stream::iter(vec![
            Err(watch_error(403, "Forbidden")),
            Ok(Event::Apply(api_deployment(Some(1)))),
        ]);
        let err = process_events(ctx, stream).await.unwrap_err();
        match err {
            Error::Fatal(message) => assert!(message.contains("denied"), "{}", message),
            other => panic!("expected a fatal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_watch_error_keeps_processing() {
        let mut client = MockStudioClient::new();
        client
            .expect_get_studio()
            .returning(|_, _| Ok(Some(deploying_studio())));
        client
            .expect_replace_status()
            .withf(|_, _, _, status| status.api_module.state == ModuleState::Ready)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let ctx = Arc::new(context(client));

        let stream = futures::stream::iter(vec![
            Err(watch_error(500, "InternalError")),
            Ok(Event::Apply(api_deployment(Some(1)))),
        ]);
        let err = process_events(ctx, stream).await.unwrap_err();
        match err {
            Error::Fatal(message) => assert!(message.contains("ended"), "{}", message),
            other => panic!("expected the stream end, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_end_is_fatal() {
        let ctx = Arc::new(context(MockStudioClient::new()));
        let stream = futures::stream::iter(vec![Ok(Event::Init), Ok(Event::InitDone)]);
        let err = process_events(ctx, stream).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
