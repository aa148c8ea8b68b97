//! Cluster client seam.
//!
//! Every control-plane call made by the reconciler and the deployment watch
//! goes through [`StudioClient`]. Production uses [`KubeStudioClient`];
//! tests substitute mocks or an in-memory cluster.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams,
};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::controller::status::status_patch;
use crate::crd::{ApicurioStudio, ApicurioStudioStatus};
use crate::resources::common::OPERATOR_ID;
use crate::resources::exposure::ROUTE_API_GROUP;
use crate::resources::{OwnedObject, Route};

/// A Kubernetes Event to publish on an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StudioEvent {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl StudioEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            ..Self::normal(reason, action, note)
        }
    }
}

/// Trait abstracting Kubernetes operations for ApicurioStudio
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StudioClient: Send + Sync {
    /// Fetch an instance. `None` when it does not exist.
    async fn get_studio(&self, namespace: &str, name: &str) -> Result<Option<ApicurioStudio>>;

    /// Fetch a secret. `None` when it does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create or replace an owned object by name.
    async fn apply(&self, namespace: &str, object: &OwnedObject) -> Result<()>;

    /// Create or replace a Route and return the host assigned by the router.
    async fn apply_route(&self, namespace: &str, route: &Route) -> Result<Option<String>>;

    /// Create a claim unless one with the same name exists. Returns true
    /// when the claim was created.
    async fn create_claim_if_absent(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<bool>;

    /// Write the status subresource.
    ///
    /// With `resource_version` set the write only succeeds against that
    /// version and fails with [`Error::Conflict`] otherwise.
    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &ApicurioStudioStatus,
    ) -> Result<()>;

    /// Publish an event on the instance. Failures are logged, not returned.
    async fn publish_event(&self, studio: &ApicurioStudio, event: StudioEvent);
}

/// Map an API failure onto the controller error. Server-side failures,
/// throttling and connection errors become [`Error::Transient`].
pub fn classify(error: kube::Error) -> Error {
    match &error {
        kube::Error::Api(e) if e.code >= 500 || e.code == 429 => {
            Error::Transient(error.to_string())
        }
        kube::Error::Service(_) => Error::Transient(error.to_string()),
        _ => Error::Kube(error),
    }
}

/// [`StudioClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStudioClient {
    client: Client,
    reporter: Reporter,
}

impl KubeStudioClient {
    /// `instance` identifies this replica on published events.
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: OPERATOR_ID.into(),
                instance,
            },
        }
    }

    async fn apply_typed<K>(&self, namespace: &str, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::MissingField("metadata.name".to_string()))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &name,
            &PatchParams::apply(OPERATOR_ID).force(),
            &Patch::Apply(object),
        )
        .await
        .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl StudioClient for KubeStudioClient {
    async fn get_studio(&self, namespace: &str, name: &str) -> Result<Option<ApicurioStudio>> {
        let api: Api<ApicurioStudio> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(classify)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(classify)
    }

    async fn apply(&self, namespace: &str, object: &OwnedObject) -> Result<()> {
        debug!(kind = object.kind(), name = object.name(), "Applying owned object");
        match object {
            OwnedObject::Secret(o) => self.apply_typed(namespace, o).await,
            OwnedObject::Service(o) => self.apply_typed(namespace, o).await,
            OwnedObject::Deployment(o) => self.apply_typed(namespace, o).await,
            OwnedObject::Ingress(o) => self.apply_typed(namespace, o).await,
        }
    }

    async fn apply_route(&self, namespace: &str, route: &Route) -> Result<Option<String>> {
        let name = route
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::MissingField("metadata.name".to_string()))?;
        let route_ar = ApiResource::from_gvk(&GroupVersionKind {
            group: ROUTE_API_GROUP.to_string(),
            version: "v1".to_string(),
            kind: "Route".to_string(),
        });
        let route_api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &route_ar);
        let route_value = serde_json::to_value(route)?;
        let applied = route_api
            .patch(
                &name,
                &PatchParams::apply(OPERATOR_ID).force(),
                &Patch::Apply(&route_value),
            )
            .await
            .map_err(classify)?;

        Ok(applied
            .data
            .get("spec")
            .and_then(|spec| spec.get("host"))
            .and_then(|host| host.as_str())
            .map(str::to_string))
    }

    async fn create_claim_if_absent(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<bool> {
        let name = claim
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::MissingField("metadata.name".to_string()))?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        if api.get_opt(name).await.map_err(classify)?.is_some() {
            return Ok(false);
        }
        match api.create(&PostParams::default(), claim).await {
            Ok(_) => Ok(true),
            // Created concurrently between the lookup and the create
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &ApicurioStudioStatus,
    ) -> Result<()> {
        let api: Api<ApicurioStudio> = Api::namespaced(self.client.clone(), namespace);
        let patch = status_patch(status, resource_version)?;
        match api
            .patch_status(name, &PatchParams::apply(OPERATOR_ID), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(Error::Conflict(format!("{}/{}", namespace, name)))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn publish_event(&self, studio: &ApicurioStudio, event: StudioEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let object_ref = studio.object_ref(&());
        let type_ = if event.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note,
                    action: event.action,
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
