//! Deployment records and their steps.
//!
//! A deployment moves `pending → running → {succeeded, failed, cancelled}`.
//! Steps run strictly in order; each step's status is persisted so a new
//! leader can resume from the first step that has not succeeded.

use serde::{Deserialize, Serialize};

use crate::types::{PathId, SpecKind};

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

/// What caused a deployment to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTrigger {
    Create,
    Replace,
    Scale,
    Remove,
    Reconcile,
}

/// An atomic scheduling action. Actions are expressed as targets so that
/// re-running a step after a leader change converges instead of doubling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Launch tasks until `target` are active.
    StartInstances { spec_id: PathId, target: u32 },
    /// Kill tasks until at most `target` are active, oldest versions first.
    StopInstances { spec_id: PathId, target: u32 },
    /// Replace tasks launched for an older config version, a batch at a
    /// time, until at most `outdated` of them remain. The step that brings
    /// `outdated` to zero also settles current tasks at `target`.
    RestartInstances {
        spec_id: PathId,
        target: u32,
        outdated: u32,
    },
}

impl StepAction {
    pub fn spec_id(&self) -> &PathId {
        match self {
            StepAction::StartInstances { spec_id, .. }
            | StepAction::StopInstances { spec_id, .. }
            | StepAction::RestartInstances { spec_id, .. } => spec_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepAction::StartInstances { .. } => "start_instances",
            StepAction::StopInstances { .. } => "stop_instances",
            StepAction::RestartInstances { .. } => "restart_instances",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Dropped because the deployment was cancelled before it started.
    Skipped,
}

/// One step of a deployment with its persisted outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub action: StepAction,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
        }
    }
}

/// One tracked transition of one or more specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    /// Creation order across the whole store; resumption follows it.
    pub sequence: u64,
    pub trigger: DeploymentTrigger,
    pub kind: SpecKind,
    pub affected: Vec<PathId>,
    pub steps: Vec<Step>,
    pub status: DeploymentStatus,
    /// Error attached when the deployment failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Unix timestamp (milliseconds) of creation.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last status change.
    pub updated_at: u64,
}

impl DeploymentRecord {
    /// Index of the first step that has not succeeded, if any.
    pub fn current_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Succeeded)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touches(&self, spec_id: &PathId) -> bool {
        self.affected.iter().any(|id| id == spec_id)
    }

    pub fn actions(&self) -> Vec<StepAction> {
        self.steps.iter().map(|s| s.action.clone()).collect()
    }
}
