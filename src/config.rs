//! Operator configuration read from the environment.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `POD_NAME` | Leader election identity | hostname |
//! | `POD_NAMESPACE` | Namespace holding the leader lease | `default` |
//! | `WATCH_NAMESPACE` | Restrict watches to one namespace | cluster-wide |
//! | `STUDIO_EXPOSURE` | Force `route` or `ingress` | API discovery |
//! | `STUDIO_FAILED_PASS_REQUEUE_SECS` | Requeue a failed pass after N seconds | wait for next trigger |
//! | `STUDIO_KUBE_CONNECT_TIMEOUT_SECS` | Kubernetes client connect timeout | 10 |
//! | `STUDIO_KUBE_WRITE_TIMEOUT_SECS` | Kubernetes client write timeout | 30 |
//! | `STUDIO_HEALTH_PORT` | Port for probes and `/metrics` | 8080 |

use std::time::Duration;

use thiserror::Error;

use crate::resources::Exposure;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// What the controller does after a reconcile pass fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailedPassPolicy {
    /// Wait for the next spec change or deployment notification.
    #[default]
    AwaitTrigger,
    /// Retry the pass after a fixed delay.
    Requeue(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    pub pod_name: Option<String>,
    pub pod_namespace: String,
    pub watch_namespace: Option<String>,
    pub exposure_override: Option<Exposure>,
    pub failed_pass_policy: FailedPassPolicy,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: None,
            pod_namespace: "default".to_string(),
            watch_namespace: None,
            exposure_override: None,
            failed_pass_policy: FailedPassPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from a variable lookup. Empty values count as
    /// unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let exposure_override = var("STUDIO_EXPOSURE")
            .map(|value| {
                value.parse::<Exposure>().map_err(|_| ConfigError::InvalidValue {
                    name: "STUDIO_EXPOSURE",
                    value,
                })
            })
            .transpose()?;

        let failed_pass_policy = match parse_secs(&var, "STUDIO_FAILED_PASS_REQUEUE_SECS")? {
            Some(delay) if !delay.is_zero() => FailedPassPolicy::Requeue(delay),
            _ => FailedPassPolicy::AwaitTrigger,
        };

        let health_port = var("STUDIO_HEALTH_PORT")
            .map(|value| {
                value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                    name: "STUDIO_HEALTH_PORT",
                    value,
                })
            })
            .transpose()?
            .unwrap_or(defaults.health_port);

        Ok(Self {
            pod_name: var("POD_NAME"),
            pod_namespace: var("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
            watch_namespace: var("WATCH_NAMESPACE"),
            exposure_override,
            failed_pass_policy,
            connect_timeout: parse_secs(&var, "STUDIO_KUBE_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.connect_timeout),
            write_timeout: parse_secs(&var, "STUDIO_KUBE_WRITE_TIMEOUT_SECS")?
                .unwrap_or(defaults.write_timeout),
            health_port,
        })
    }
}

fn parse_secs(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue { name, value })
        })
        .transpose()
}
