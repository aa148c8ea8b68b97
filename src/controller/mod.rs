//! Controller module for studio-operator.
//!
//! Contains the reconcile pass, the deployment watch, the module state
//! machine, global status aggregation and status persistence.
//!
//! Two loops mutate instance status:
//! - the ApicurioStudio controller (`reconciler`)
//! - the Deployment watch (`deployment_watch`)
//!
//! Both serialize on the per-instance lock in `instance_lock`.

// Shared modules
pub mod client;
pub mod context;
pub mod error;
pub mod instance_lock;
pub mod status;

// Status model
pub mod aggregator;
pub mod state_machine;

// Loops
pub mod deployment_watch;
pub mod reconciler;
