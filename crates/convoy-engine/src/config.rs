//! Engine settings, read from the daemon's `[deployment]`, `[secrets]`
//! and `[[agents]]` sections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Attempts per launch or kill before the step fails.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Tasks replaced at a time during a restart.
    pub upgrade_batch_size: u32,
    /// Terminal deployments kept for `GET /v2/deployments/{id}`.
    pub archive_limit: usize,
    /// Largest instance count a spec may ask for.
    pub max_instances: u32,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            upgrade_batch_size: 1,
            archive_limit: 100,
            max_instances: 1_000,
        }
    }
}

impl DeploymentConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn batch_size(&self) -> u32 {
        self.upgrade_batch_size.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Namespaces whose secrets specs may reference.
    pub accessible_namespaces: Vec<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            accessible_namespaces: vec!["/".to_string()],
        }
    }
}

/// An agent offering resources to the local resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub host: String,
    #[serde(default = "AgentConfig::default_roles")]
    pub roles: Vec<String>,
}

impl AgentConfig {
    fn default_roles() -> Vec<String> {
        vec!["*".to_string()]
    }

    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            roles: Self::default_roles(),
        }
    }
}
