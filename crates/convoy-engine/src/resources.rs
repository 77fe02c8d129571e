//! Resource manager collaborator.
//!
//! The engine never places tasks itself; it asks a [`ResourceManager`]
//! to launch or kill them and to report what is actually running.
//! [`LocalResourceManager`] is an in-process implementation over a fixed
//! set of agents.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use convoy_state::{RunSpec, TaskRecord, TaskStatus};

use crate::config::AgentConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Worth retrying: agent unreachable, offer timed out.
    #[error("transient resource failure: {0}")]
    Transient(String),

    /// Will fail the same way again: no agent matches, unknown task.
    #[error("resource request rejected: {0}")]
    Rejected(String),
}

impl ResourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Launch one task for `spec` at the spec's current version.
    async fn launch(&self, spec: &RunSpec) -> Result<TaskRecord, ResourceError>;

    /// Kill a task. Killing a task that is already gone succeeds.
    async fn kill(&self, task_id: &str) -> Result<(), ResourceError>;

    /// Every task the manager believes is staging or running.
    async fn running_tasks(&self) -> Result<Vec<TaskRecord>, ResourceError>;
}

/// In-process resource manager with round-robin placement.
pub struct LocalResourceManager {
    agents: Vec<AgentConfig>,
    next_agent: AtomicUsize,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    failing_launches: AtomicU32,
}

impl LocalResourceManager {
    pub fn new(agents: Vec<AgentConfig>) -> Self {
        let agents = if agents.is_empty() {
            vec![AgentConfig::new("agent-1")]
        } else {
            agents
        };
        info!(agents = agents.len(), "local resource manager ready");
        Self {
            agents,
            next_agent: AtomicUsize::new(0),
            tasks: Mutex::new(HashMap::new()),
            failing_launches: AtomicU32::new(0),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` launches fail with a transient error.
    pub fn fail_next_launches(&self, count: u32) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    /// Drop a task without a kill, as if its agent vanished.
    pub fn lose_task(&self, task_id: &str) -> bool {
        self.tasks().remove(task_id).is_some()
    }

    /// Start a task the scheduler does not know about.
    pub fn inject_task(&self, task: TaskRecord) {
        self.tasks().insert(task.id.clone(), task);
    }

    pub fn task_count(&self) -> usize {
        self.tasks().len()
    }

    fn place(&self, spec: &RunSpec) -> Result<&AgentConfig, ResourceError> {
        let accepted = spec.accepted_roles();
        let eligible: Vec<&AgentConfig> = self
            .agents
            .iter()
            .filter(|agent| {
                accepted.is_empty() || agent.roles.iter().any(|role| accepted.contains(role))
            })
            .collect();
        if eligible.is_empty() {
            return Err(ResourceError::Rejected(format!(
                "no agent offers roles [{}] for {}",
                accepted.join(", "),
                spec.id()
            )));
        }
        let idx = self.next_agent.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Ok(eligible[idx])
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    async fn launch(&self, spec: &RunSpec) -> Result<TaskRecord, ResourceError> {
        let failing = self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ResourceError::Transient(format!(
                "offer for {} timed out",
                spec.id()
            )));
        }

        let agent = self.place(spec)?;
        let task = TaskRecord {
            id: format!("{}.{}", spec.id().safe_name(), uuid::Uuid::new_v4()),
            spec_id: spec.id().clone(),
            kind: spec.kind(),
            version: spec.config_version(),
            host: agent.host.clone(),
            status: TaskStatus::TaskRunning,
            started_at: chrono::Utc::now().timestamp_millis().max(0) as u64,
        };
        self.tasks().insert(task.id.clone(), task.clone());
        debug!(task = %task.id, host = %task.host, "task launched");
        Ok(task)
    }

    async fn kill(&self, task_id: &str) -> Result<(), ResourceError> {
        if self.tasks().remove(task_id).is_some() {
            debug!(task = %task_id, "task killed");
        }
        Ok(())
    }

    async fn running_tasks(&self) -> Result<Vec<TaskRecord>, ResourceError> {
        Ok(self.tasks().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: serde_json::Value) -> RunSpec {
        RunSpec::App(serde_json::from_value(json).unwrap())
    }

    #[tokio::test]
    async fn launch_places_round_robin() {
        let rm = LocalResourceManager::new(vec![AgentConfig::new("a1"), AgentConfig::new("a2")]);
        let app = spec(serde_json::json!({ "id": "/group/web", "version": 3 }));

        let first = rm.launch(&app).await.unwrap();
        let second = rm.launch(&app).await.unwrap();
        assert_ne!(first.host, second.host);
        assert!(first.id.starts_with("group_web."));
        assert_eq!(first.version, 3);
        assert_eq!(rm.running_tasks().await.unwrap().len(), 2);

        rm.kill(&first.id).await.unwrap();
        rm.kill(&first.id).await.unwrap();
        assert_eq!(rm.task_count(), 1);
    }

    #[tokio::test]
    async fn accepted_roles_restrict_placement() {
        let rm = LocalResourceManager::new(vec![
            AgentConfig::new("private"),
            AgentConfig {
                host: "public".to_string(),
                roles: vec!["slave_public".to_string()],
            },
        ]);
        let app = spec(serde_json::json!({
            "id": "/edge",
            "acceptedResourceRoles": ["slave_public"]
        }));
        for _ in 0..3 {
            assert_eq!(rm.launch(&app).await.unwrap().host, "public");
        }

        let nowhere = spec(serde_json::json!({
            "id": "/gpu",
            "acceptedResourceRoles": ["gpu"]
        }));
        assert!(matches!(
            rm.launch(&nowhere).await,
            Err(ResourceError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let rm = LocalResourceManager::new(vec![]);
        let app = spec(serde_json::json!({ "id": "/a" }));
        rm.fail_next_launches(1);
        assert!(rm.launch(&app).await.unwrap_err().is_transient());
        assert!(rm.launch(&app).await.is_ok());
    }
}
