//! In-memory stand-in for the Kubernetes API.
//!
//! `FakeCluster` implements [`StudioClient`] over a few maps. Status writes
//! honour resource versions the way the API server does, so the conflict
//! handling in the status writer runs against realistic behavior. Every call
//! is appended to a journal that tests assert on.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::runtime::watcher::Event;

use studio_operator::controller::client::{StudioClient, StudioEvent};
use studio_operator::controller::error::{Error, Result};
use studio_operator::crd::{ApicurioStudio, ApicurioStudioStatus};
use studio_operator::resources::{OwnedObject, Route};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    studios: BTreeMap<Key, ApicurioStudio>,
    objects: BTreeMap<(String, String, String), OwnedObject>,
    routes: BTreeMap<Key, Route>,
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    events: Vec<StudioEvent>,
    status_history: Vec<ApicurioStudioStatus>,
    journal: Vec<String>,
    next_version: u64,
    /// Status writes to reject with a conflict before accepting one
    pending_conflicts: usize,
    /// Object names whose apply fails
    failing: Vec<String>,
    /// Instance names whose reads never complete
    stalled: Vec<String>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Store an instance, assigning it a fresh resource version.
    pub fn insert_studio(&self, mut studio: ApicurioStudio) {
        let mut state = self.state();
        studio.metadata.resource_version = Some(state.bump());
        let k = key(&studio.namespace().unwrap(), &studio.name_any());
        state.studios.insert(k, studio);
    }

    pub fn studio(&self, namespace: &str, name: &str) -> ApicurioStudio {
        self.state().studios[&key(namespace, name)].clone()
    }

    pub fn status(&self, namespace: &str, name: &str) -> ApicurioStudioStatus {
        self.studio(namespace, name).status.unwrap_or_default()
    }

    /// Overwrite the stored status out of band, as another writer would.
    pub fn set_status(&self, namespace: &str, name: &str, status: ApicurioStudioStatus) {
        let mut state = self.state();
        let version = state.bump();
        let studio = state.studios.get_mut(&key(namespace, name)).unwrap();
        studio.status = Some(status);
        studio.metadata.resource_version = Some(version);
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<OwnedObject> {
        self.state()
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        match self.object("Deployment", namespace, name)? {
            OwnedObject::Deployment(d) => Some(d),
            _ => None,
        }
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        match self.object("Secret", namespace, name)? {
            OwnedObject::Secret(s) => Some(s),
            _ => None,
        }
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    pub fn route_count(&self) -> usize {
        self.state().routes.len()
    }

    pub fn claim_count(&self) -> usize {
        self.state().claims.len()
    }

    pub fn events(&self) -> Vec<StudioEvent> {
        self.state().events.clone()
    }

    /// Every accepted status write, oldest first.
    pub fn status_history(&self) -> Vec<ApicurioStudioStatus> {
        self.state().status_history.clone()
    }

    /// Calls received since the last `take_journal`.
    pub fn take_journal(&self) -> Vec<String> {
        std::mem::take(&mut self.state().journal)
    }

    pub fn reject_status_writes(&self, count: usize) {
        self.state().pending_conflicts = count;
    }

    pub fn fail_apply_of(&self, name: &str) {
        self.state().failing.push(name.to_string());
    }

    /// Make every read of the named instance hang, as an unresponsive API
    /// server would.
    pub fn stall_reads_of(&self, name: &str) {
        self.state().stalled.push(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    /// Report ready replicas on a stored Deployment and return the watch
    /// event the API server would send.
    pub fn mark_ready(
        &self,
        namespace: &str,
        name: &str,
        ready_replicas: i32,
    ) -> Event<Deployment> {
        let mut deployment = self.deployment(namespace, name).unwrap();
        deployment.status = Some(DeploymentStatus {
            ready_replicas: Some(ready_replicas),
            ..Default::default()
        });
        self.state().objects.insert(
            ("Deployment".to_string(), namespace.to_string(), name.to_string()),
            OwnedObject::Deployment(deployment.clone()),
        );
        Event::Apply(deployment)
    }

    /// Remove a stored Deployment and return the watch event.
    pub fn delete_deployment(&self, namespace: &str, name: &str) -> Event<Deployment> {
        let removed = self
            .state()
            .objects
            .remove(&("Deployment".to_string(), namespace.to_string(), name.to_string()));
        match removed {
            Some(OwnedObject::Deployment(d)) => Event::Delete(d),
            other => panic!("no deployment {}/{}: {:?}", namespace, name, other.is_some()),
        }
    }

    /// Event for a Deployment whose own deletion is in progress.
    pub fn terminating(&self, namespace: &str, name: &str) -> Event<Deployment> {
        let mut deployment = self.deployment(namespace, name).unwrap();
        let now: Time = serde_json::from_value(serde_json::json!("2026-03-01T12:00:00Z")).unwrap();
        deployment.metadata.deletion_timestamp = Some(now);
        Event::Apply(deployment)
    }
}

#[async_trait]
impl StudioClient for FakeCluster {
    async fn get_studio(&self, namespace: &str, name: &str) -> Result<Option<ApicurioStudio>> {
        let stalled = {
            let mut state = self.state();
            state.journal.push(format!("get ApicurioStudio/{}", name));
            state.stalled.iter().any(|n| n == name)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(self.state().studios.get(&key(namespace, name)).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.state().journal.push(format!("get Secret/{}", name));
        Ok(self.secret(namespace, name))
    }

    async fn apply(&self, namespace: &str, object: &OwnedObject) -> Result<()> {
        let mut state = self.state();
        state
            .journal
            .push(format!("apply {}/{}", object.kind(), object.name()));
        if state.failing.iter().any(|n| n == object.name()) {
            return Err(Error::Transient(format!("apply of {} refused", object.name())));
        }
        state.objects.insert(
            (
                object.kind().to_string(),
                namespace.to_string(),
                object.name().to_string(),
            ),
            object.clone(),
        );
        Ok(())
    }

    async fn apply_route(&self, namespace: &str, route: &Route) -> Result<Option<String>> {
        let name = route.metadata.name.clone().unwrap_or_default();
        let mut state = self.state();
        state.journal.push(format!("apply Route/{}", name));
        let host = route
            .spec
            .host
            .clone()
            .unwrap_or_else(|| format!("{}-{}.apps.example.com", name, namespace));
        state.routes.insert(key(namespace, &name), route.clone());
        Ok(Some(host))
    }

    async fn create_claim_if_absent(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<bool> {
        let name = claim.name_any();
        let mut state = self.state();
        state.journal.push(format!("create PersistentVolumeClaim/{}", name));
        let k = key(namespace, &name);
        if state.claims.contains_key(&k) {
            return Ok(false);
        }
        state.claims.insert(k, claim.clone());
        Ok(true)
    }

    async fn replace_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &ApicurioStudioStatus,
    ) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.journal.push(format!("status ApicurioStudio/{}", name));
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            // Someone else wrote in between
            state.bump();
            let version = state.next_version.to_string();
            if let Some(studio) = state.studios.get_mut(&key(namespace, name)) {
                studio.metadata.resource_version = Some(version);
            }
            return Err(Error::Conflict(name.to_string()));
        }

        let version = state.bump();
        let studio = state
            .studios
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::Transient(format!("{} not found", name)))?;
        if resource_version.is_some() && resource_version != studio.metadata.resource_version {
            return Err(Error::Conflict(name.to_string()));
        }
        studio.status = Some(status.clone());
        studio.metadata.resource_version = Some(version);
        state.status_history.push(status.clone());
        Ok(())
    }

    async fn publish_event(&self, _studio: &ApicurioStudio, event: StudioEvent) {
        self.state().events.push(event);
    }
}
