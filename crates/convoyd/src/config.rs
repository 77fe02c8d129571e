//! Daemon configuration, read from an optional TOML file.
//!
//! ```toml
//! [election]
//! lease_ttl_ms = 10000
//! renew_interval_ms = 2000
//!
//! [deployment]
//! max_attempts = 5
//! max_instances = 1000
//!
//! [events]
//! retention = 10000
//!
//! [secrets]
//! accessible_namespaces = ["/", "/prod"]
//!
//! [[agents]]
//! host = "agent-1"
//! roles = ["*", "slave_public"]
//! ```
//!
//! Every section and field may be omitted.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use convoy_election::ElectionConfig;
use convoy_engine::{AgentConfig, DeploymentConfig, SecretsConfig};
use convoy_events::EventsConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub election: ElectionConfig,
    pub deployment: DeploymentConfig,
    pub events: EventsConfig,
    pub secrets: SecretsConfig,
    /// Agents offered to the local resource manager. Empty means a single
    /// `agent-1` accepting every role.
    pub agents: Vec<AgentConfig>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.election.validate()?;
        if self.deployment.max_attempts == 0 {
            anyhow::bail!("deployment.max_attempts must be at least 1");
        }
        if self.deployment.max_instances == 0 {
            anyhow::bail!("deployment.max_instances must be at least 1");
        }
        if let Some(agent) = self.agents.iter().find(|a| a.host.trim().is_empty()) {
            anyhow::bail!("agent with roles {:?} has an empty host", agent.roles);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config.election.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.deployment.upgrade_batch_size, 1);
        assert_eq!(config.deployment.max_instances, 1_000);
        assert_eq!(config.events.keep_alive_secs, 15);
        assert_eq!(config.secrets.accessible_namespaces, vec!["/"]);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn parse_sections() {
        let config = DaemonConfig::from_toml(
            r#"
[election]
lease_ttl_ms = 3000
renew_interval_ms = 500
renew_deadline_ms = 2000

[deployment]
max_attempts = 2
upgrade_batch_size = 3

[secrets]
accessible_namespaces = ["/", "/prod"]

[[agents]]
host = "public-1"
roles = ["slave_public"]

[[agents]]
host = "private-1"
"#,
        )
        .unwrap();
        assert_eq!(config.election.lease_ttl, Duration::from_millis(3000));
        assert_eq!(config.election.poll_interval, Duration::from_secs(1));
        assert_eq!(config.deployment.max_attempts, 2);
        assert_eq!(config.deployment.upgrade_batch_size, 3);
        assert_eq!(config.secrets.accessible_namespaces, vec!["/", "/prod"]);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].roles, vec!["slave_public"]);
        assert_eq!(config.agents[1].roles, vec!["*"]);
    }

    #[test]
    fn rejects_inconsistent_lease_timing() {
        let err = DaemonConfig::from_toml(
            r#"
[election]
lease_ttl_ms = 1000
renew_deadline_ms = 1000
renew_interval_ms = 100
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("renew_deadline"));
    }

    #[test]
    fn rejects_zero_instance_limit() {
        let err = DaemonConfig::from_toml("[deployment]\nmax_instances = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_instances"));
    }

    #[test]
    fn rejects_unknown_sections() {
        assert!(DaemonConfig::from_toml("[raft]\nnode_id = 1\n").is_err());
    }

    #[test]
    fn load_without_path_is_default() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.deployment.max_attempts, 5);
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoy.toml");
        std::fs::write(&path, "[events]\nretention = 50\n").unwrap();
        assert_eq!(DaemonConfig::from_file(&path).unwrap().events.retention, 50);

        let err = DaemonConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
