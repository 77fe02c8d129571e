//! Aligns persisted state with what the resource manager reports.
//!
//! Runs once when a replica becomes leader, before it serves writes:
//!
//! 1. Tasks the store knows but the resource manager does not are lost.
//! 2. Tasks the resource manager runs but the store does not know are
//!    adopted when their spec still wants instances, killed otherwise.
//! 3. Specs whose active task count or config version disagree with the
//!    spec get a corrective deployment, unless a deployment for them is in
//!    flight. Scaling does not change the config version, so tasks that
//!    survived a scale are current.
//!
//! Step 3 skips specs that already have an in-flight deployment, so a
//! second pass with no external change opens nothing new.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use convoy_state::{PathId, RunSpec, SpecKind, StepAction, TaskRecord, TaskStatus};

use crate::engine::DeploymentEngine;
use crate::plan::restart_steps;
use crate::error::EngineResult;
use crate::retry::RetryError;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub lost: usize,
    pub adopted: usize,
    pub killed: usize,
    /// Corrective deployments opened.
    pub corrective: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    engine: DeploymentEngine,
}

impl Reconciler {
    pub fn new(engine: DeploymentEngine) -> Self {
        Self { engine }
    }

    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let store = self.engine.store();
        let mut report = ReconcileReport::default();

        let observed: HashMap<String, TaskRecord> = self
            .engine
            .resources()
            .running_tasks()
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        let persisted = store.list_tasks()?;
        let known: HashSet<&str> = persisted.iter().map(|t| t.id.as_str()).collect();

        for task in persisted.iter().filter(|t| !observed.contains_key(&t.id)) {
            self.engine.forget_task(task, TaskStatus::TaskLost)?;
            warn!(task = %task.id, spec = %task.spec_id, "task lost");
            report.lost += 1;
        }

        let mut orphans: Vec<&TaskRecord> = observed
            .values()
            .filter(|t| !known.contains(t.id.as_str()))
            .collect();
        orphans.sort_by_key(|t| t.started_at);
        for task in orphans {
            if self.wants_instance(task)? {
                self.engine.record_task(task)?;
                info!(task = %task.id, spec = %task.spec_id, "orphan task adopted");
                report.adopted += 1;
            } else if self.kill_orphan(task).await {
                report.killed += 1;
            }
        }

        report.corrective = self.open_corrective()?;

        if report.is_noop() {
            debug!("reconciliation found nothing to do");
        } else {
            info!(
                lost = report.lost,
                adopted = report.adopted,
                killed = report.killed,
                corrective = report.corrective,
                "reconciliation complete"
            );
        }
        Ok(report)
    }

    fn wants_instance(&self, task: &TaskRecord) -> EngineResult<bool> {
        let store = self.engine.store();
        let Some(spec) = store.get_spec(task.kind, &task.spec_id)? else {
            return Ok(false);
        };
        let active = store
            .tasks_for(&task.spec_id)?
            .iter()
            .filter(|t| t.status.is_active())
            .count();
        Ok(active < spec.instances() as usize)
    }

    async fn kill_orphan(&self, task: &TaskRecord) -> bool {
        let resources = self.engine.resources();
        let never = CancellationToken::new();
        match self.engine.retry().run(&never, || resources.kill(&task.id)).await {
            Ok(()) => {
                info!(task = %task.id, spec = %task.spec_id, "orphan task killed");
                true
            }
            Err(RetryError::Failed { attempts, error }) => {
                warn!(task = %task.id, attempts, %error, "failed to kill orphan task");
                false
            }
            Err(RetryError::Cancelled) => false,
        }
    }

    fn open_corrective(&self) -> EngineResult<usize> {
        let store = self.engine.store();
        let in_flight: HashSet<PathId> = store
            .list_deployments()?
            .into_iter()
            .flat_map(|d| d.affected)
            .collect();

        let mut tasks: BTreeMap<PathId, Vec<TaskRecord>> = BTreeMap::new();
        for task in store.list_tasks()?.into_iter().filter(|t| t.status.is_active()) {
            tasks.entry(task.spec_id.clone()).or_default().push(task);
        }

        let specs: Vec<RunSpec> = store
            .list_apps()?
            .into_iter()
            .map(RunSpec::App)
            .chain(store.list_pods()?.into_iter().map(RunSpec::Pod))
            .collect();

        let batch = self.engine.batch_size();
        let mut plans: Vec<(SpecKind, PathId, Vec<StepAction>)> = Vec::new();
        for spec in &specs {
            let id = spec.id();
            let running = tasks.remove(id).unwrap_or_default();
            if in_flight.contains(id) {
                continue;
            }
            let target = spec.instances();
            let config = spec.config_version();
            let outdated = running.iter().filter(|t| t.version != config).count();
            let actions = if outdated > 0 {
                let outdated = u32::try_from(outdated).unwrap_or(u32::MAX);
                restart_steps(id, target, outdated, batch)
            } else if running.len() < target as usize {
                vec![StepAction::StartInstances {
                    spec_id: id.clone(),
                    target,
                }]
            } else if running.len() > target as usize {
                vec![StepAction::StopInstances {
                    spec_id: id.clone(),
                    target,
                }]
            } else {
                continue;
            };
            plans.push((spec.kind(), id.clone(), actions));
        }

        // Whatever remains belongs to specs that no longer exist.
        for (id, running) in tasks {
            if in_flight.contains(&id) {
                continue;
            }
            let kind = running.first().map_or(SpecKind::App, |t| t.kind);
            plans.push((kind, id.clone(), vec![StepAction::StopInstances { spec_id: id, target: 0 }]));
        }

        if plans.is_empty() {
            return Ok(0);
        }
        let fence = self.engine.fence()?;
        for (kind, id, actions) in plans.iter() {
            self.engine
                .open_corrective(&fence, *kind, id, actions.clone())?;
        }
        Ok(plans.len())
    }
}
