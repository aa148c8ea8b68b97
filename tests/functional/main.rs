// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the ApicurioStudio reconcile pass and Deployment watch.
//!
//! These tests drive the real reconciler and watch handlers against an
//! in-memory cluster WITHOUT requiring a live Kubernetes cluster.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_unexpected_api_deletion_reprovisions_studio_group
//! ```
//!
//! ## Test Categories
//!
//! - **Lifecycle tests**: first pass, readiness, idempotence, external modules
//! - **Scenario tests**: drift repair, conflicting writers, failed passes

#[path = "../common/mod.rs"]
mod common;
mod fake_cluster;
mod lifecycle_tests;
mod scenario_tests;

use std::sync::Arc;

use studio_operator::OperatorConfig;
use studio_operator::controller::context::Context;
use studio_operator::resources::{ClusterCapabilities, Exposure};

pub use fake_cluster::FakeCluster;

pub const NS: &str = "apicurio";

/// Module Deployment names of instance `demo`.
pub const DEMO_DEPLOYMENTS: [&str; 5] = ["demo-auth", "demo-db", "demo-api", "demo-ws", "demo-ui"];

/// A fake cluster and a controller context wired to it.
pub fn harness(exposure: Exposure) -> (Arc<FakeCluster>, Arc<Context>) {
    let cluster = Arc::new(FakeCluster::new());
    let ctx = Arc::new(Context::new(
        cluster.clone(),
        ClusterCapabilities { exposure },
        OperatorConfig::default(),
        None,
    ));
    (cluster, ctx)
}
