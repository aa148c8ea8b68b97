//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler
//! and the deployment watch: the cluster client seam, the capabilities
//! resolved at startup, the per-instance locks and the health state.

use std::sync::Arc;

use crate::config::OperatorConfig;
use crate::controller::client::StudioClient;
use crate::controller::instance_lock::InstanceLocks;
use crate::health::HealthState;
use crate::resources::ClusterCapabilities;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Cluster client
    pub client: Arc<dyn StudioClient>,
    /// Cluster features resolved at startup
    pub capabilities: ClusterCapabilities,
    pub config: OperatorConfig,
    /// Serializes status mutations per instance
    pub locks: InstanceLocks,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Arc<dyn StudioClient>,
        capabilities: ClusterCapabilities,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            capabilities,
            config,
            locks: InstanceLocks::new(),
            health_state,
        }
    }
}
