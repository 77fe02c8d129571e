//! Point-in-time view of everything the leader owns.

use serde::{Deserialize, Serialize};

use crate::deployment::DeploymentRecord;
use crate::types::{AppSpec, PathId, PodSpec, TaskRecord};

/// A consistent snapshot of desired state, in-flight deployments and tasks,
/// read in a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Value of the store-wide version counter when the snapshot was taken.
    pub version: u64,
    pub apps: Vec<AppSpec>,
    pub pods: Vec<PodSpec>,
    pub deployments: Vec<DeploymentRecord>,
    pub tasks: Vec<TaskRecord>,
}

impl ClusterState {
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.pods.is_empty() && self.deployments.is_empty()
    }

    pub fn app(&self, id: &PathId) -> Option<&AppSpec> {
        self.apps.iter().find(|a| &a.id == id)
    }

    pub fn pod(&self, id: &PathId) -> Option<&PodSpec> {
        self.pods.iter().find(|p| &p.id == id)
    }

    /// Active tasks of one spec.
    pub fn active_tasks<'a>(&'a self, spec_id: &'a PathId) -> impl Iterator<Item = &'a TaskRecord> {
        self.tasks
            .iter()
            .filter(move |t| &t.spec_id == spec_id && t.status.is_active())
    }
}
