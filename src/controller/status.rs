//! Status persistence.
//!
//! Status writes are optimistic: the write carries the resource version that
//! was read, and a conflict re-reads the instance and re-applies the same
//! [`StatusDelta`] before trying again.

use jiff::Timestamp;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::controller::aggregator::StatusDelta;
use crate::controller::client::StudioClient;
use crate::controller::error::{Error, Result};
use crate::crd::{ApicurioStudioStatus, Module};

/// Attempts made before a conflicting status write is given up.
pub const MAX_STATUS_ATTEMPTS: usize = 5;

/// Outcome of a status write
#[derive(Debug, Clone, PartialEq)]
pub enum StatusWrite {
    /// The delta changed the status and it was persisted
    Written(ApicurioStudioStatus),
    /// The delta was a no-op against the current status
    Unchanged(ApicurioStudioStatus),
    /// The instance no longer exists
    Gone,
}

/// Status key of each module in the serialized status.
fn module_key(module: Module) -> &'static str {
    match module {
        Module::Api => "apiModule",
        Module::Ws => "wsModule",
        Module::Ui => "uiModule",
        Module::Identity => "keycloakModule",
        Module::Database => "databaseModule",
    }
}

/// JSON merge patch writing `status` as a whole.
///
/// Optional module fields that are unset are sent as explicit nulls, since a
/// merge patch keeps keys it does not mention.
pub fn status_patch(
    status: &ApicurioStudioStatus,
    resource_version: Option<String>,
) -> Result<Value> {
    let mut value = serde_json::to_value(status)?;
    for module in Module::ALL {
        if let Some(entry) = value
            .get_mut(module_key(module))
            .and_then(Value::as_object_mut)
        {
            for key in ["message", "lastTransitionTime"] {
                entry.entry(key).or_insert(Value::Null);
            }
        }
    }

    let mut patch = json!({ "status": value });
    if let Some(resource_version) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": resource_version });
    }
    Ok(patch)
}

/// Apply `delta` to the instance status and persist it.
///
/// `initial` is the instance as last read by the caller; on conflict the
/// instance is re-read and the delta applied again, up to
/// [`MAX_STATUS_ATTEMPTS`] times.
pub async fn write_status(
    client: &dyn StudioClient,
    namespace: &str,
    name: &str,
    initial: Option<(Option<String>, ApicurioStudioStatus)>,
    delta: &StatusDelta,
) -> Result<StatusWrite> {
    let mut current = initial;

    for attempt in 1..=MAX_STATUS_ATTEMPTS {
        let (resource_version, mut status) = match current.take() {
            Some(read) => read,
            None => match client.get_studio(namespace, name).await? {
                Some(studio) => (
                    studio.metadata.resource_version.clone(),
                    studio.status.unwrap_or_default(),
                ),
                None => return Ok(StatusWrite::Gone),
            },
        };

        if !delta.apply(&mut status, Timestamp::now()) {
            debug!(name = %name, "Status unchanged, skipping write");
            return Ok(StatusWrite::Unchanged(status));
        }

        match client
            .replace_status(namespace, name, resource_version, &status)
            .await
        {
            Ok(()) => return Ok(StatusWrite::Written(status)),
            Err(e) if e.is_conflict() => {
                warn!(name = %name, attempt, "Status write conflicted, re-reading instance");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Conflict(format!(
        "{}/{} after {} attempts",
        namespace, name, MAX_STATUS_ATTEMPTS
    )))
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
    use crate::controller::state_machine::{ModuleEvent, TransitionContext};
    use crate::crd::{ModuleState, StudioState};
    use crate::resources::common::tests::studio;
    use mockall::predicate::eq;

    #[test]
    fn test_status_patch_nulls_cleared_fields() {
        let mut status = ApicurioStudioStatus::default();
        status.api_module.message = Some("1 ready replica(s)".to_string());

        let patch = status_patch(&status, Some("42".to_string())).unwrap();

        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["apiModule"]["message"], "1 ready replica(s)");
        assert!(patch["status"]["wsModule"]["message"].is_null());
        assert!(
            patch["status"]["wsModule"]
                .as_object()
                .unwrap()
                .contains_key("lastTransitionTime")
        );
    }

    #[test]
    fn test_status_patch_without_version() {
        let patch = status_patch(&ApicurioStudioStatus::default(), None).unwrap();
        assert!(patch.get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_write_retries_after_conflict() {
        let mut client = MockStudioClient::new();
        let mut stale = studio("demo");
        stale.metadata.resource_version = Some("1".to_string());
        let mut fresh = stale.clone();
        fresh.metadata.resource_version = Some("2".to_string());
        fresh.status = Some(ApicurioStudioStatus {
            ws_module: crate::crd::ModuleStatus {
                state: ModuleState::Ready,
                ..Default::default()
            },
            ..Default::default()
        });

        client
            .expect_replace_status()
            .withf(|_, _, rv, _| rv.as_deref() == Some("1"))
            .times(1)
            .returning(|_, name, _, _| Err(Error::Conflict(name.to_string())));
        client
            .expect_get_studio()
            .with(eq("apicurio"), eq("demo"))
            .times(1)
            .returning(move |_, _| Ok(Some(fresh.clone())));
        client
            .expect_replace_status()
            .withf(|_, _, rv, status| {
                rv.as_deref() == Some("2")
                    && status.ws_module.state == ModuleState::Ready
                    && status.api_module.state == ModuleState::Error
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let delta = StatusDelta::single(
            Module::Api,
            ModuleEvent::UnexpectedDeletion,
            TransitionContext::default(),
        );
        let outcome = write_status(
            &client,
            "apicurio",
            "demo",
            Some((stale.metadata.resource_version.clone(), ApicurioStudioStatus::default())),
            &delta,
        )
        .await
        .unwrap();

        match outcome {
            StatusWrite::Written(status) => assert_eq!(status.state, StudioState::Deploying),
            other => panic!("expected a write, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_gives_up_after_max_attempts() {
        let mut client = MockStudioClient::new();
        client
            .expect_get_studio()
            .times(MAX_STATUS_ATTEMPTS)
            .returning(|_, _| Ok(Some(studio("demo"))));
        client
            .expect_replace_status()
            .times(MAX_STATUS_ATTEMPTS)
            .returning(|_, name, _, _| Err(Error::Conflict(name.to_string())));

        let delta = StatusDelta::single(Module::Ui, ModuleEvent::Provisioned, TransitionContext::default());
        let err = write_status(&client, "apicurio", "demo", None, &delta)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_written() {
        let mut client = MockStudioClient::new();
        client.expect_replace_status().never();

        let mut status = ApicurioStudioStatus::default();
        let delta = StatusDelta::single(Module::Ui, ModuleEvent::Provisioned, TransitionContext::default());
        delta.apply(&mut status, Timestamp::now());

        let outcome = write_status(&client, "apicurio", "demo", Some((None, status)), &delta)
            .await
            .unwrap();
        assert!(matches!(outcome, StatusWrite::Unchanged(_)));
    }

    #[tokio::test]
    async fn test_deleted_instance_is_gone() {
        let mut client = MockStudioClient::new();
        client.expect_get_studio().returning(|_, _| Ok(None));

        let outcome = write_status(&client, "apicurio", "demo", None, &StatusDelta::default())
            .await
            .unwrap();
        assert_eq!(outcome, StatusWrite::Gone);
    }
}
