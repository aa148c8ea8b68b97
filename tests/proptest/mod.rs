// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for studio-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use proptest::prelude::*;

use studio_operator::controller::aggregator::{
    READY_MESSAGE, RECONCILING_MESSAGE, StatusDelta, global_state, refresh_global,
};
use studio_operator::controller::state_machine::{
    ModuleEvent, ModuleStateMachine, TransitionContext, TransitionResult,
};
use studio_operator::controller::status::status_patch;
use studio_operator::crd::{
    ApicurioStudioSpec, ApicurioStudioStatus, Module, ModuleState, ModuleStatus, StudioState,
};
use studio_operator::resources::database;

/// Strategy for generating module states.
fn any_state() -> impl Strategy<Value = ModuleState> {
    prop_oneof![
        Just(ModuleState::Unknown),
        Just(ModuleState::Deploying),
        Just(ModuleState::Ready),
        Just(ModuleState::Error),
        Just(ModuleState::Preexisting),
    ]
}

/// Strategy for generating module events.
fn any_event() -> impl Strategy<Value = ModuleEvent> {
    prop_oneof![
        Just(ModuleEvent::Provisioned),
        Just(ModuleEvent::ReplicasReady),
        Just(ModuleEvent::UnexpectedDeletion),
        Just(ModuleEvent::MarkedPreexisting),
    ]
}

fn any_module() -> impl Strategy<Value = Module> {
    prop_oneof![
        Just(Module::Api),
        Just(Module::Ws),
        Just(Module::Ui),
        Just(Module::Identity),
        Just(Module::Database),
    ]
}

fn any_status() -> impl Strategy<Value = ApicurioStudioStatus> {
    prop::array::uniform5(any_state()).prop_map(|states| {
        let mut status = ApicurioStudioStatus::default();
        for (module, state) in Module::ALL.into_iter().zip(states) {
            status.module_mut(module).state = state;
        }
        status
    })
}

/// Strategy for DNS-ish names.
fn dns_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}[a-z0-9]"
}

fn now() -> jiff::Timestamp {
    jiff::Timestamp::from_second(1_700_000_000).unwrap()
}

proptest! {
    /// Property: the global state is Ready exactly when the application
    /// modules are Ready and the others Ready or Preexisting. It is never Error.
    #[test]
    fn test_global_state_invariant(states in prop::array::uniform5(any_state())) {
        let expected_ready = Module::ALL.iter().zip(states.iter()).all(|(m, s)| match m {
            Module::Identity | Module::Database => {
                matches!(s, ModuleState::Ready | ModuleState::Preexisting)
            }
            _ => *s == ModuleState::Ready,
        });
        let state = global_state(&states);
        prop_assert_ne!(state, StudioState::Error);
        prop_assert_eq!(state == StudioState::Ready, expected_ready);
    }

    /// Property: refresh_global keeps message and state consistent.
    #[test]
    fn test_global_message_matches_state(mut status in any_status()) {
        refresh_global(&mut status);
        let expected = if status.state == StudioState::Ready {
            READY_MESSAGE
        } else {
            RECONCILING_MESSAGE
        };
        prop_assert_eq!(status.message.as_deref(), Some(expected));
        // Idempotent
        prop_assert!(!refresh_global(&mut status));
    }

    /// Property: transition checks are deterministic and agree with apply.
    #[test]
    fn test_transitions_agree_with_table(
        state in any_state(),
        event in any_event(),
        replicas in 0..5i32,
    ) {
        let sm = ModuleStateMachine::new();
        let mut status = ModuleStatus { state, ..Default::default() };
        let result = sm.apply(&mut status, event, TransitionContext::new(replicas), now());
        match result {
            TransitionResult::InvalidTransition { .. } => {
                prop_assert!(!sm.can_transition(state, event));
                prop_assert_eq!(status.state, state);
            }
            TransitionResult::GuardFailed { .. } => {
                prop_assert_eq!(event, ModuleEvent::ReplicasReady);
                prop_assert_eq!(replicas, 0);
                prop_assert_eq!(status.state, state);
            }
            TransitionResult::Success { to, .. } => {
                prop_assert!(sm.can_transition(state, event));
                prop_assert_eq!(status.state, to);
            }
        }
    }

    /// Property: Preexisting never leaves Preexisting.
    #[test]
    fn test_preexisting_is_terminal(event in any_event(), replicas in 0..5i32) {
        let sm = ModuleStateMachine::new();
        let mut status = ModuleStatus { state: ModuleState::Preexisting, ..Default::default() };
        sm.apply(&mut status, event, TransitionContext::new(replicas), now());
        prop_assert_eq!(status.state, ModuleState::Preexisting);
    }

    /// Property: the error flag is set exactly when the module is in Error.
    #[test]
    fn test_error_flag_tracks_state(
        events in prop::collection::vec((any_event(), 0..3i32), 1..20),
    ) {
        let sm = ModuleStateMachine::new();
        let mut status = ModuleStatus::default();
        for (event, replicas) in events {
            sm.apply(&mut status, event, TransitionContext::new(replicas), now());
            prop_assert_eq!(status.error, status.state == ModuleState::Error);
        }
    }

    /// Property: applying the same module observation twice changes
    /// nothing the second time.
    #[test]
    fn test_single_observation_is_idempotent(
        mut status in any_status(),
        module in any_module(),
        event in any_event(),
        replicas in 0..3i32,
        url in prop::option::of(dns_name()),
    ) {
        let mut delta = StatusDelta::single(module, event, TransitionContext::new(replicas));
        delta.api_url = url;

        delta.apply(&mut status, now());
        let settled = status.clone();

        prop_assert!(!delta.apply(&mut status, now()));
        prop_assert_eq!(status, settled);
    }

    /// Property: the status patch always names every module message field.
    #[test]
    fn test_status_patch_clears_every_module(status in any_status()) {
        let patch = status_patch(&status, None).unwrap();
        for key in ["apiModule", "wsModule", "uiModule", "keycloakModule", "databaseModule"] {
            let entry = patch["status"][key].as_object().unwrap();
            prop_assert!(entry.contains_key("message"));
            prop_assert!(entry.contains_key("lastTransitionTime"));
        }
    }

    /// Property: a self-provisioned database is addressed through its service.
    #[test]
    fn test_connection_string_uses_service(name in dns_name(), db in "[a-z]{1,12}") {
        let spec: ApicurioStudioSpec = serde_json::from_value(serde_json::json!({
            "name": name,
            "url": "studio.example.com",
            "database": { "database": db },
        })).unwrap();
        prop_assert_eq!(
            database::connection_string(&spec),
            format!("postgresql://{}-db:5432/{}", name, db)
        );
    }

    /// Property: an external database url is used verbatim.
    #[test]
    fn test_connection_string_external(host in dns_name(), port in 1024u16..65535) {
        let spec: ApicurioStudioSpec = serde_json::from_value(serde_json::json!({
            "name": "demo",
            "url": "studio.example.com",
            "database": { "install": false, "url": format!("{}:{}", host, port) },
        })).unwrap();
        prop_assert_eq!(
            database::connection_string(&spec),
            format!("postgresql://{}:{}/apicuriodb", host, port)
        );
    }
}
