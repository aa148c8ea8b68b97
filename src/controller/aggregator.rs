//! Status aggregation.
//!
//! Module observations are expressed as a [`StatusDelta`]: a pure mutation
//! that can be re-applied to a freshly read status when a write loses an
//! optimistic concurrency race. After every delta the global state is
//! recomputed from the five module states.

use jiff::Timestamp;

use crate::crd::{ApicurioStudioStatus, Module, ModuleState, StudioState};

use super::state_machine::{ModuleEvent, ModuleStateMachine, TransitionContext};

pub const READY_MESSAGE: &str = "All module deployments are ready";
pub const RECONCILING_MESSAGE: &str = "Currently reconciling...";

/// Global state for module states given in [`Module::ALL`] order.
///
/// Ready iff API, WS and UI are ready and identity and database are each
/// ready or preexisting. Never `Error`.
pub fn global_state(states: &[ModuleState; 5]) -> StudioState {
    let ready = Module::ALL
        .iter()
        .zip(states.iter())
        .all(|(module, state)| match module {
            Module::Identity | Module::Database => state.is_ready_or_preexisting(),
            Module::Api | Module::Ws | Module::Ui => *state == ModuleState::Ready,
        });
    if ready {
        StudioState::Ready
    } else {
        StudioState::Deploying
    }
}

/// Recompute global state and message. Returns true when either changed.
pub fn refresh_global(status: &mut ApicurioStudioStatus) -> bool {
    let state = global_state(&status.module_states());
    let message = match state {
        StudioState::Ready => READY_MESSAGE,
        _ => RECONCILING_MESSAGE,
    };
    let changed = status.state != state || status.message.as_deref() != Some(message);
    status.state = state;
    status.message = Some(message.to_string());
    changed
}

/// One module observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleObservation {
    pub module: Module,
    pub event: ModuleEvent,
    pub ctx: TransitionContext,
}

/// Pure status mutation produced by a reconcile pass or a watch notification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusDelta {
    pub studio_url: Option<String>,
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub keycloak_url: Option<String>,
    pub observations: Vec<ModuleObservation>,
}

impl StatusDelta {
    pub fn observe(&mut self, module: Module, event: ModuleEvent, ctx: TransitionContext) {
        self.observations.push(ModuleObservation { module, event, ctx });
    }

    /// Delta for a single module event.
    pub fn single(module: Module, event: ModuleEvent, ctx: TransitionContext) -> Self {
        let mut delta = Self::default();
        delta.observe(module, event, ctx);
        delta
    }

    /// Apply to `status` and refresh the global state. Returns true when the
    /// status changed and needs to be written.
    pub fn apply(&self, status: &mut ApicurioStudioStatus, now: Timestamp) -> bool {
        let machine = ModuleStateMachine::new();
        let mut changed = false;

        for (target, value) in [
            (&mut status.studio_url, &self.studio_url),
            (&mut status.api_url, &self.api_url),
            (&mut status.ws_url, &self.ws_url),
            (&mut status.keycloak_url, &self.keycloak_url),
        ] {
            if value.is_some() && target != value {
                *target = value.clone();
                changed = true;
            }
        }

        for observation in &self.observations {
            let result = machine.apply(
                status.module_mut(observation.module),
                observation.event,
                observation.ctx,
                now,
            );
            if result.changed() {
                changed = true;
            } else {
                tracing::trace!(module = %observation.module, result = ?result, "Module status unchanged");
            }
        }

        refresh_global(status) || changed
    }
}
