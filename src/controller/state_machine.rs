//! Finite state machine for per-module status.
//!
//! Every module of an instance moves through `Unknown`, `Deploying`, `Ready`
//! and `Error`, or is pinned to `Preexisting` when the user brings their own
//! identity provider or database. Transitions are table-driven and guarded;
//! `lastTransitionTime` is only stamped when the observable status changes.

use std::fmt;

use jiff::Timestamp;

use crate::crd::{ModuleState, ModuleStatus};

/// Message recorded when a module's Deployment disappears out-of-band.
pub const UNEXPECTED_DELETION_MESSAGE: &str = "Deployment has been deleted with no reason";

/// Events that trigger module state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleEvent {
    /// The module's objects have been applied
    Provisioned,
    /// The module's Deployment reports ready replicas
    ReplicasReady,
    /// The module's Deployment is gone or being deleted without a spec change
    UnexpectedDeletion,
    /// The module is provided outside of the operator
    MarkedPreexisting,
}

impl fmt::Display for ModuleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleEvent::Provisioned => write!(f, "Provisioned"),
            ModuleEvent::ReplicasReady => write!(f, "ReplicasReady"),
            ModuleEvent::UnexpectedDeletion => write!(f, "UnexpectedDeletion"),
            ModuleEvent::MarkedPreexisting => write!(f, "MarkedPreexisting"),
        }
    }
}

/// Observation accompanying an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// Ready replicas reported by the module's Deployment
    pub ready_replicas: i32,
}

impl TransitionContext {
    pub fn new(ready_replicas: i32) -> Self {
        Self { ready_replicas }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ModuleState,
    pub to: ModuleState,
    pub event: ModuleEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ModuleState,
        to: ModuleState,
        event: ModuleEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was applied; `changed` is false for a no-op re-observation
    Success {
        from: ModuleState,
        to: ModuleState,
        event: ModuleEvent,
        changed: bool,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: ModuleState,
        event: ModuleEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: ModuleState,
        event: ModuleEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Whether the module status was modified
    pub fn changed(&self) -> bool {
        matches!(self, TransitionResult::Success { changed: true, .. })
    }
}

/// Table-driven state machine for module status
pub struct ModuleStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ModuleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        use ModuleEvent::*;
        use ModuleState::*;

        Self {
            transitions: vec![
                // === Provisioning ===
                Transition::new(Unknown, Deploying, Provisioned, "Module objects applied"),
                Transition::new(Error, Deploying, Provisioned, "Module re-provisioned after error"),
                Transition::new(Deploying, Deploying, Provisioned, "Module already deploying"),
                Transition::new(Ready, Ready, Provisioned, "Module already ready"),
                // === Readiness ===
                Transition::new(Unknown, Ready, ReplicasReady, "Deployment reports ready replicas"),
                Transition::new(Deploying, Ready, ReplicasReady, "Deployment reports ready replicas"),
                Transition::new(Error, Ready, ReplicasReady, "Deployment recovered"),
                // === Drift ===
                Transition::new(Unknown, Error, UnexpectedDeletion, "Deployment deleted"),
                Transition::new(Deploying, Error, UnexpectedDeletion, "Deployment deleted"),
                Transition::new(Ready, Error, UnexpectedDeletion, "Deployment deleted"),
                Transition::new(Error, Error, UnexpectedDeletion, "Deployment deleted"),
                // === External modules ===
                Transition::new(Unknown, Preexisting, MarkedPreexisting, "Module provided externally"),
                // Preexisting is terminal
                Transition::new(Preexisting, Preexisting, MarkedPreexisting, "Module provided externally"),
            ],
        }
    }

    fn find(&self, from: ModuleState, event: ModuleEvent) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: ModuleState, event: ModuleEvent) -> bool {
        self.find(from, event).is_some()
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: ModuleState) -> Vec<ModuleEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    /// Apply an event to a module status.
    ///
    /// `now` is stamped into `lastTransitionTime` only when state, error
    /// flag or message actually change.
    pub fn apply(
        &self,
        status: &mut ModuleStatus,
        event: ModuleEvent,
        ctx: TransitionContext,
        now: Timestamp,
    ) -> TransitionResult {
        let from = status.state;
        let Some(transition) = self.find(from, event) else {
            return TransitionResult::InvalidTransition {
                current: from,
                event,
            };
        };

        if let Some(reason) = check_guard(transition, ctx) {
            return TransitionResult::GuardFailed {
                from,
                event,
                reason,
            };
        }

        let next = target_status(transition, status, ctx);
        let changed = next.state != status.state
            || next.error != status.error
            || next.message != status.message;

        if changed {
            status.state = next.state;
            status.error = next.error;
            status.message = next.message;
            status.last_transition_time = Some(now.to_string());
            tracing::debug!(
                from = %from,
                to = %transition.to,
                event = %event,
                description = transition.description,
                "Module state transition"
            );
        }

        TransitionResult::Success {
            from,
            to: transition.to,
            event,
            changed,
        }
    }
}

fn check_guard(transition: &Transition, ctx: TransitionContext) -> Option<String> {
    match transition.event {
        ModuleEvent::ReplicasReady if ctx.ready_replicas < 1 => Some(format!(
            "No ready replicas reported: {}",
            ctx.ready_replicas
        )),
        _ => None,
    }
}

/// Status the module should have after `transition`. No-op transitions keep
/// the current error flag and message.
fn target_status(
    transition: &Transition,
    current: &ModuleStatus,
    ctx: TransitionContext,
) -> ModuleStatus {
    if transition.from == transition.to && transition.event != ModuleEvent::UnexpectedDeletion {
        return current.clone();
    }

    let (error, message) = match transition.event {
        ModuleEvent::Provisioned | ModuleEvent::MarkedPreexisting => (false, None),
        ModuleEvent::ReplicasReady => (
            false,
            Some(format!("{} ready replica(s)", ctx.ready_replicas)),
        ),
        ModuleEvent::UnexpectedDeletion => (true, Some(UNEXPECTED_DELETION_MESSAGE.to_string())),
    };

    ModuleStatus {
        state: transition.to,
        error,
        message,
        last_transition_time: current.last_transition_time.clone(),
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

    fn now() -> Timestamp {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn module(state: ModuleState) -> ModuleStatus {
        ModuleStatus {
            state,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_to_deploying() {
        let sm = ModuleStateMachine::new();
        let mut status = module(ModuleState::Unknown);

        let result = sm.apply(&mut status, ModuleEvent::Provisioned, TransitionContext::default(), now());

        assert!(result.changed());
        assert_eq!(status.state, ModuleState::Deploying);
        assert_eq!(status.last_transition_time.as_deref(), Some("2026-03-01T12:00:00Z"));
    }

    #[test]
    fn test_deploying_to_ready_records_replicas() {
        let sm = ModuleStateMachine::new();
        let mut status = module(ModuleState::Deploying);

        let result = sm.apply(&mut status, ModuleEvent::ReplicasReady, TransitionContext::new(2), now());

        match result {
            TransitionResult::Success { from, to, changed, .. } => {
                assert_eq!(from, ModuleState::Deploying);
                assert_eq!(to, ModuleState::Ready);
                assert!(changed);
            }
            other => panic!("Expected successful transition, got {:?}", other),
        }
        assert!(!status.error);
        assert_eq!(status.message.as_deref(), Some("2 ready replica(s)"));
    }

    #[test]
    fn test_ready_guard_requires_replicas() {
        let sm = ModuleStateMachine::new();
        let mut status = module(ModuleState::Deploying);

        let result = sm.apply(&mut status, ModuleEvent::ReplicasReady, TransitionContext::new(0), now());

        assert!(matches!(result, TransitionResult::GuardFailed { .. }));
        assert_eq!(status, module(ModuleState::Deploying));
    }

    #[test]
    fn test_ready_ignores_further_replica_reports() {
        let sm = ModuleStateMachine::new();
        let mut status = module(ModuleState::Ready);

        let result = sm.apply(&mut status, ModuleEvent::ReplicasReady, TransitionContext::new(3), now());

        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));
        assert!(status.last_transition_time.is_none());
    }

    #[test]
    fn test_noop_provisioning_keeps_transition_time() {
        let sm = ModuleStateMachine::new();
        let mut status = ModuleStatus {
            state: ModuleState::Ready,
            message: Some("1 ready replica(s)".to_string()),
            last_transition_time: Some("2026-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let before = status.clone();

        let result = sm.apply(&mut status, ModuleEvent::Provisioned, TransitionContext::default(), now());

        assert!(!result.changed());
        assert_eq!(status, before);
    }

    #[test]
    fn test_unexpected_deletion_marks_error() {
        let sm = ModuleStateMachine::new();
        for state in [
            ModuleState::Unknown,
            ModuleState::Deploying,
            ModuleState::Ready,
        ] {
            let mut status = module(state);
            let result = sm.apply(&mut status, ModuleEvent::UnexpectedDeletion, TransitionContext::default(), now());
            assert!(result.changed(), "from {}", state);
            assert_eq!(status.state, ModuleState::Error);
            assert!(status.error);
            assert_eq!(status.message.as_deref(), Some(UNEXPECTED_DELETION_MESSAGE));
        }
    }

    #[test]
    fn test_repeated_deletion_is_noop() {
        let sm = ModuleStateMachine::new();
        let mut status = module(ModuleState::Ready);
        sm.apply(&mut status, ModuleEvent::UnexpectedDeletion, TransitionContext::default(), now());
        let stamped = status.clone();

        let later: Timestamp = "2026-03-01T13:00:00Z".parse().unwrap();
        let result = sm.apply(&mut status, ModuleEvent::UnexpectedDeletion, TransitionContext::default(), later);

        assert!(!result.changed());
        assert_eq!(status, stamped);
    }

    #[test]
    fn test_error_recovers_through_provisioning() {
        let sm = ModuleStateMachine::new();
        let mut status = module(ModuleState::Error);
        status.error = true;

        sm.apply(&mut status, ModuleEvent::Provisioned, TransitionContext::default(), now());

        assert_eq!(status.state, ModuleState::Deploying);
        assert!(!status.error);
        assert!(status.message.is_none());
    }

    #[test]
    fn test_preexisting_is_terminal() {
        let sm = ModuleStateMachine::new();
        assert_eq!(
            sm.valid_events(ModuleState::Preexisting),
            vec![ModuleEvent::MarkedPreexisting]
        );

        let mut status = module(ModuleState::Preexisting);
        for event in [
            ModuleEvent::Provisioned,
            ModuleEvent::ReplicasReady,
            ModuleEvent::UnexpectedDeletion,
        ] {
            sm.apply(&mut status, event, TransitionContext::new(1), now());
            assert_eq!(status.state, ModuleState::Preexisting);
        }
    }

    #[test]
    fn test_deletion_from_every_managed_state() {
        let sm = ModuleStateMachine::new();
        for state in [
            ModuleState::Unknown,
            ModuleState::Deploying,
            ModuleState::Ready,
            ModuleState::Error,
        ] {
            assert!(
                sm.can_transition(state, ModuleEvent::UnexpectedDeletion),
                "Should be able to record deletion from {:?}",
                state
            );
        }
    }
}
