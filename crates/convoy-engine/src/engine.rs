//! Deployment engine.
//!
//! `submit` validates a change, writes the new desired state and its
//! deployment record in one fenced transaction, and hands the record to a
//! driver task. Drivers run steps strictly in order, persisting each
//! step's outcome before the next starts, and are serialized per spec id
//! through [`SpecQueue`].
//!
//! Drivers only run while the engine is resumed. The coordinator suspends
//! the engine when leadership is lost or given up; a new leader resumes
//! every in-flight record from its first unfinished step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convoy_election::Election;
use convoy_state::{
    Clock, DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentTrigger, Event, Fence,
    PathId, RunSpec, SpecKind, StateStore, StateTxn, Step, StepAction, StepStatus, TaskRecord,
    TaskStatus,
};

use crate::config::DeploymentConfig;
use crate::error::{EngineError, EngineResult};
use crate::plan::plan;
use crate::queue::SpecQueue;
use crate::resources::ResourceManager;
use crate::retry::{RetryError, RetryPolicy};
use crate::secrets::SecretStore;
use crate::validation::validate;

const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A requested desired-state change.
#[derive(Debug, Clone)]
pub enum SpecChange {
    /// Create a spec that must not exist yet.
    Create(RunSpec),
    /// Create or replace.
    Put(RunSpec),
    Remove { kind: SpecKind, id: PathId },
}

impl SpecChange {
    pub fn kind(&self) -> SpecKind {
        match self {
            SpecChange::Create(spec) | SpecChange::Put(spec) => spec.kind(),
            SpecChange::Remove { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &PathId {
        match self {
            SpecChange::Create(spec) | SpecChange::Put(spec) => spec.id(),
            SpecChange::Remove { id, .. } => id,
        }
    }
}

/// How a step ended.
enum Outcome {
    Done,
    /// Cancelled or suspended at a safe boundary.
    Interrupted,
    Failed(String),
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Session {
    active: bool,
    generation: u64,
    token: CancellationToken,
    drivers: HashMap<DeploymentId, Driver>,
}

struct Inner {
    store: StateStore,
    election: Arc<Election>,
    resources: Arc<dyn ResourceManager>,
    secrets: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    config: DeploymentConfig,
    retry: RetryPolicy,
    queue: SpecQueue,
    session: Mutex<Session>,
    submit_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct DeploymentEngine {
    inner: Arc<Inner>,
}

impl DeploymentEngine {
    pub fn new(
        store: StateStore,
        election: Arc<Election>,
        resources: Arc<dyn ResourceManager>,
        secrets: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
        config: DeploymentConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config);
        let token = CancellationToken::new();
        token.cancel();
        Self {
            inner: Arc::new(Inner {
                store,
                election,
                resources,
                secrets,
                clock,
                config,
                retry,
                queue: SpecQueue::new(),
                session: Mutex::new(Session {
                    active: false,
                    generation: 0,
                    token,
                    drivers: HashMap::new(),
                }),
                submit_lock: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn resources(&self) -> &Arc<dyn ResourceManager> {
        &self.inner.resources
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn fence(&self) -> EngineResult<Fence> {
        Ok(self.inner.election.fence()?)
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub(crate) fn batch_size(&self) -> u32 {
        self.inner.config.batch_size()
    }

    /// Whether drivers are currently allowed to run.
    pub fn is_active(&self) -> bool {
        self.session().active
    }

    // ── Client operations ─────────────────────────────────────────

    /// Validate and accept a change. Nothing is written when validation
    /// fails or this replica cannot prove leadership.
    pub fn submit(&self, change: SpecChange) -> EngineResult<DeploymentRecord> {
        if let SpecChange::Create(spec) | SpecChange::Put(spec) = &change {
            validate(spec, self.inner.secrets.as_ref(), self.inner.config.max_instances)?;
        }
        let fence = self.fence()?;
        let now = self.now_ms();
        let kind = change.kind();
        let id = change.id().clone();
        let batch = self.batch_size();

        let order = self
            .inner
            .submit_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let record = self
            .inner
            .store
            .write(Some(&fence), |txn| -> EngineResult<DeploymentRecord> {
                let old = txn.get_spec(kind, &id)?;
                let sequence = txn.next_version()?;
                let new = match &change {
                    SpecChange::Create(_) if old.is_some() => {
                        return Err(EngineError::Conflict(format!("{kind} {id} already exists")));
                    }
                    SpecChange::Create(spec) | SpecChange::Put(spec) => {
                        let mut spec = spec.clone();
                        spec.assign_version(sequence, old.as_ref());
                        txn.put_spec(&spec)?;
                        Some(spec)
                    }
                    SpecChange::Remove { .. } => {
                        if !txn.delete_spec(kind, &id)? {
                            return Err(EngineError::NotFound(format!("{kind} {id}")));
                        }
                        txn.append(match kind {
                            SpecKind::App => Event::AppTerminated { app_id: id.clone() },
                            SpecKind::Pod => Event::PodDeleted { pod_id: id.clone() },
                        })?;
                        None
                    }
                };
                let (trigger, actions) = plan(&id, old.as_ref(), new.as_ref(), batch);
                open_record(txn, sequence, trigger, kind, &id, actions, now)
            })?;
        self.inner.queue.enqueue(&record.id, &record.affected);
        drop(order);

        info!(
            deployment = %record.id,
            spec = %id,
            trigger = ?record.trigger,
            steps = record.steps.len(),
            "deployment accepted"
        );
        self.spawn_driver(&record);
        Ok(record)
    }

    /// An in-flight or archived deployment.
    pub fn status(&self, id: &str) -> EngineResult<DeploymentRecord> {
        self.inner
            .store
            .get_deployment(id)?
            .ok_or_else(|| EngineError::NotFound(format!("deployment {id}")))
    }

    /// In-flight deployments by creation order.
    pub fn list(&self) -> EngineResult<Vec<DeploymentRecord>> {
        Ok(self.inner.store.list_deployments()?)
    }

    /// Cancel a deployment. Unstarted steps are skipped; a step that is
    /// executing stops after its current launch or kill.
    pub fn cancel(&self, id: &str) -> EngineResult<DeploymentRecord> {
        let fence = self.fence()?;
        let now = self.now_ms();
        let limit = self.inner.config.archive_limit;
        let result = self
            .inner
            .store
            .write(Some(&fence), |txn| -> EngineResult<DeploymentRecord> {
                let mut record = txn
                    .get_deployment(id)?
                    .ok_or_else(|| EngineError::NotFound(format!("deployment {id}")))?;
                if record.is_terminal() {
                    return Err(EngineError::Conflict(format!(
                        "deployment {id} is already {:?}",
                        record.status
                    )));
                }
                for step in &mut record.steps {
                    match step.status {
                        StepStatus::Pending => step.status = StepStatus::Skipped,
                        StepStatus::Running => {
                            step.status = StepStatus::Skipped;
                            step.error = Some("interrupted by cancellation".to_string());
                        }
                        _ => {}
                    }
                }
                record.status = DeploymentStatus::Cancelled;
                record.updated_at = now;
                txn.archive_deployment(&record, limit)?;
                txn.append(Event::DeploymentCancelled {
                    deployment_id: record.id.clone(),
                })?;
                Ok(record)
            });

        let record = match result {
            Err(EngineError::NotFound(_)) if self.inner.store.get_deployment(id)?.is_some() => {
                return Err(EngineError::Conflict(format!(
                    "deployment {id} has already finished"
                )));
            }
            other => other?,
        };

        let signalled = match self.session().drivers.get(id) {
            Some(driver) => {
                driver.cancel.cancel();
                true
            }
            None => false,
        };
        if !signalled {
            self.inner.queue.release(&record.id, &record.affected);
        }
        info!(deployment = %id, signalled, "deployment cancelled");
        Ok(record)
    }

    /// Wait until deployment `id` reaches a terminal status.
    pub async fn wait_terminal(&self, id: &str) -> EngineResult<DeploymentRecord> {
        let mut commits = self.inner.store.watch_events();
        loop {
            let record = self.status(id)?;
            if record.is_terminal() {
                return Ok(record);
            }
            if commits.changed().await.is_err() {
                return Err(EngineError::NotFound(format!("deployment {id}")));
            }
        }
    }

    // ── Leadership hand-over ──────────────────────────────────────

    /// Start drivers for every in-flight deployment, oldest first.
    pub fn resume(&self) -> EngineResult<usize> {
        {
            let mut session = self.session();
            if !session.active {
                session.active = true;
                session.generation += 1;
                session.token = CancellationToken::new();
            }
        }
        let records = self.inner.store.list_deployments()?;
        for record in &records {
            self.inner.queue.enqueue(&record.id, &record.affected);
        }
        for record in &records {
            self.spawn_driver(record);
        }
        info!(deployments = records.len(), "deployment engine resumed");
        Ok(records.len())
    }

    /// Stop every driver at its next safe boundary and wait for them.
    /// Persisted records are left as they are for the next leader.
    pub async fn suspend_all(&self) {
        let drivers = {
            let mut session = self.session();
            if !session.active && session.drivers.is_empty() {
                return;
            }
            session.active = false;
            session.token.cancel();
            std::mem::take(&mut session.drivers)
        };
        self.inner.queue.clear();

        let count = drivers.len();
        for (id, driver) in drivers {
            match tokio::time::timeout(DRIVER_STOP_TIMEOUT, driver.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(deployment = %id, error = %e, "deployment driver aborted"),
                Err(_) => warn!(deployment = %id, "deployment driver did not stop in time"),
            }
        }
        info!(drivers = count, "deployment engine suspended");
    }

    /// Record and schedule a deployment with explicit actions.
    pub(crate) fn open_corrective(
        &self,
        fence: &Fence,
        kind: SpecKind,
        id: &PathId,
        actions: Vec<StepAction>,
    ) -> EngineResult<DeploymentRecord> {
        let now = self.now_ms();
        let record = self.inner.store.write(Some(fence), |txn| -> EngineResult<DeploymentRecord> {
            let sequence = txn.next_version()?;
            open_record(
                txn,
                sequence,
                DeploymentTrigger::Reconcile,
                kind,
                id,
                actions,
                now,
            )
        })?;
        self.inner.queue.enqueue(&record.id, &record.affected);
        info!(deployment = %record.id, spec = %id, "corrective deployment opened");
        self.spawn_driver(&record);
        Ok(record)
    }

    // ── Drivers ───────────────────────────────────────────────────

    fn spawn_driver(&self, record: &DeploymentRecord) {
        let mut session = self.session();
        if !session.active || session.drivers.contains_key(&record.id) {
            return;
        }
        let cancel = session.token.child_token();
        let generation = session.generation;
        let engine = self.clone();
        let id = record.id.clone();
        let affected = record.affected.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            engine.drive(id, affected, token, generation).await;
        });
        session
            .drivers
            .insert(record.id.clone(), Driver { cancel, handle });
    }

    async fn drive(
        self,
        id: DeploymentId,
        affected: Vec<PathId>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let turn = tokio::select! {
            _ = self.inner.queue.wait_turn(&id, &affected) => true,
            _ = cancel.cancelled() => false,
        };
        if turn {
            debug!(deployment = %id, "deployment driver running");
            match self.run_deployment(&id, &cancel).await {
                Ok(()) => {}
                Err(e) if e.is_leadership_lost() => {
                    warn!(deployment = %id, error = %e, "deployment paused, leadership lost");
                }
                Err(e) => error!(deployment = %id, error = %e, "deployment driver failed"),
            }
        }

        let mut session = self.session();
        if session.generation == generation {
            session.drivers.remove(&id);
            self.inner.queue.release(&id, &affected);
        }
    }

    async fn run_deployment(&self, id: &str, cancel: &CancellationToken) -> EngineResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Some(record) = self.inner.store.get_deployment(id)? else {
                return Ok(());
            };
            if record.is_terminal() {
                return Ok(());
            }

            let Some(index) = record.current_step() else {
                self.transition(id, |record| {
                    record.status = DeploymentStatus::Succeeded;
                    vec![Event::DeploymentSuccess {
                        deployment_id: record.id.clone(),
                    }]
                })?;
                info!(deployment = %id, "deployment succeeded");
                return Ok(());
            };

            let action = record.steps[index].action.clone();
            let started = self.transition(id, |record| {
                record.status = DeploymentStatus::Running;
                let step = &mut record.steps[index];
                step.status = StepStatus::Running;
                step.attempts += 1;
                Vec::new()
            })?;
            if started.is_none() {
                return Ok(());
            }
            debug!(deployment = %id, step = index, action = action.name(), "step started");

            let outcome = match self.execute(record.kind, &action, cancel).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_leadership_lost() => return Err(e),
                Err(e) => Outcome::Failed(e.to_string()),
            };

            match outcome {
                Outcome::Done => {
                    self.transition(id, |record| {
                        let step = &mut record.steps[index];
                        step.status = StepStatus::Succeeded;
                        step.error = None;
                        vec![Event::DeploymentStepSuccess {
                            deployment_id: record.id.clone(),
                            step: index,
                            action: action.clone(),
                        }]
                    })?;
                    debug!(deployment = %id, step = index, "step succeeded");
                }
                Outcome::Interrupted => return Ok(()),
                Outcome::Failed(reason) => {
                    self.transition(id, |record| {
                        let step = &mut record.steps[index];
                        step.status = StepStatus::Failed;
                        step.error = Some(reason.clone());
                        for later in record.steps.iter_mut().skip(index + 1) {
                            later.status = StepStatus::Skipped;
                        }
                        record.status = DeploymentStatus::Failed;
                        record.reason = Some(reason.clone());
                        vec![
                            Event::DeploymentStepFailure {
                                deployment_id: record.id.clone(),
                                step: index,
                                action: action.clone(),
                                reason: reason.clone(),
                            },
                            Event::DeploymentFailed {
                                deployment_id: record.id.clone(),
                                reason: reason.clone(),
                            },
                        ]
                    })?;
                    warn!(deployment = %id, step = index, %reason, "deployment failed");
                    return Ok(());
                }
            }
        }
    }

    /// Apply `f` to the live record under the current fence, archiving it
    /// if `f` made it terminal. Returns `None` when the record is gone or
    /// already terminal.
    fn transition<F>(&self, id: &str, f: F) -> EngineResult<Option<DeploymentRecord>>
    where
        F: FnOnce(&mut DeploymentRecord) -> Vec<Event>,
    {
        let fence = self.fence()?;
        let now = self.now_ms();
        let limit = self.inner.config.archive_limit;
        self.inner.store.write(Some(&fence), |txn| {
            let Some(mut record) = txn.get_deployment(id)? else {
                return Ok(None);
            };
            if record.is_terminal() {
                return Ok(None);
            }
            let events = f(&mut record);
            record.updated_at = now;
            if record.is_terminal() {
                txn.archive_deployment(&record, limit)?;
            } else {
                txn.put_deployment(&record)?;
            }
            for event in events {
                txn.append(event)?;
            }
            Ok(Some(record))
        })
    }

    // ── Steps ─────────────────────────────────────────────────────

    async fn execute(
        &self,
        kind: SpecKind,
        action: &StepAction,
        cancel: &CancellationToken,
    ) -> EngineResult<Outcome> {
        match action {
            StepAction::StartInstances { spec_id, target } => {
                self.start_instances(kind, spec_id, *target, cancel).await
            }
            StepAction::StopInstances { spec_id, target } => {
                self.stop_instances(spec_id, *target, cancel).await
            }
            StepAction::RestartInstances {
                spec_id,
                target,
                outdated,
            } => {
                self.restart_instances(kind, spec_id, *target, *outdated, cancel)
                    .await
            }
        }
    }

    fn active_tasks(&self, spec_id: &PathId) -> EngineResult<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .inner
            .store
            .tasks_for(spec_id)?
            .into_iter()
            .filter(|t| t.status.is_active())
            .collect();
        // Oldest version first, then oldest launch.
        tasks.sort_by_key(|t| (t.version, t.started_at));
        Ok(tasks)
    }

    async fn start_instances(
        &self,
        kind: SpecKind,
        spec_id: &PathId,
        target: u32,
        cancel: &CancellationToken,
    ) -> EngineResult<Outcome> {
        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::Interrupted);
            }
            // A spec removed since planning has nothing left to start.
            let Some(spec) = self.inner.store.get_spec(kind, spec_id)? else {
                return Ok(Outcome::Done);
            };
            if self.active_tasks(spec_id)?.len() >= target as usize {
                return Ok(Outcome::Done);
            }
            match self.launch_task(&spec, cancel).await? {
                Outcome::Done => {}
                other => return Ok(other),
            }
        }
    }

    async fn stop_instances(
        &self,
        spec_id: &PathId,
        target: u32,
        cancel: &CancellationToken,
    ) -> EngineResult<Outcome> {
        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::Interrupted);
            }
            let tasks = self.active_tasks(spec_id)?;
            if tasks.len() <= target as usize {
                return Ok(Outcome::Done);
            }
            match self.kill_task(&tasks[0], cancel).await? {
                Outcome::Done => {}
                other => return Ok(other),
            }
        }
    }

    async fn restart_instances(
        &self,
        kind: SpecKind,
        spec_id: &PathId,
        target: u32,
        outdated: u32,
        cancel: &CancellationToken,
    ) -> EngineResult<Outcome> {
        let batch = self.inner.config.batch_size() as usize;
        let target = target as usize;
        let keep = outdated as usize;
        let last = keep == 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::Interrupted);
            }
            let Some(spec) = self.inner.store.get_spec(kind, spec_id)? else {
                return Ok(Outcome::Done);
            };
            // Always rolls towards the stored config, which may be newer
            // than the one this step was planned for.
            let config = spec.config_version();

            let (current, old): (Vec<TaskRecord>, Vec<TaskRecord>) = self
                .active_tasks(spec_id)?
                .into_iter()
                .partition(|t| t.version == config);
            let missing = target.saturating_sub(current.len());
            let surplus = old.len().saturating_sub(keep);
            let victims: Vec<TaskRecord> = if surplus > 0 {
                old.into_iter().take(surplus.min(batch)).collect()
            } else if last {
                let excess = current.len().saturating_sub(target);
                current.into_iter().take(excess).collect()
            } else {
                Vec::new()
            };
            let launches = if last {
                missing.min(batch)
            } else {
                missing.min(victims.len())
            };
            if launches == 0 && victims.is_empty() {
                return Ok(Outcome::Done);
            }

            for _ in 0..launches {
                match self.launch_task(&spec, cancel).await? {
                    Outcome::Done => {}
                    other => return Ok(other),
                }
            }
            for victim in &victims {
                match self.kill_task(victim, cancel).await? {
                    Outcome::Done => {}
                    other => return Ok(other),
                }
            }
        }
    }

    async fn launch_task(&self, spec: &RunSpec, cancel: &CancellationToken) -> EngineResult<Outcome> {
        let resources = &self.inner.resources;
        match self.inner.retry.run(cancel, || resources.launch(spec)).await {
            Ok(task) => {
                self.record_task(&task)?;
                debug!(task = %task.id, spec = %task.spec_id, host = %task.host, "task started");
                Ok(Outcome::Done)
            }
            Err(RetryError::Cancelled) => Ok(Outcome::Interrupted),
            Err(RetryError::Failed { attempts, error }) => Ok(Outcome::Failed(format!(
                "launch of {} failed after {attempts} attempt(s): {error}",
                spec.id()
            ))),
        }
    }

    async fn kill_task(&self, task: &TaskRecord, cancel: &CancellationToken) -> EngineResult<Outcome> {
        let resources = &self.inner.resources;
        match self.inner.retry.run(cancel, || resources.kill(&task.id)).await {
            Ok(()) => {
                self.forget_task(task, TaskStatus::TaskKilled)?;
                debug!(task = %task.id, spec = %task.spec_id, "task killed");
                Ok(Outcome::Done)
            }
            Err(RetryError::Cancelled) => Ok(Outcome::Interrupted),
            Err(RetryError::Failed { attempts, error }) => Ok(Outcome::Failed(format!(
                "kill of task {} failed after {attempts} attempt(s): {error}",
                task.id
            ))),
        }
    }

    /// Persist a launched or adopted task with its status update.
    pub(crate) fn record_task(&self, task: &TaskRecord) -> EngineResult<()> {
        let fence = self.fence()?;
        self.inner.store.write(Some(&fence), |txn| {
            txn.put_task(task)?;
            txn.append(status_update(task, task.status))?;
            Ok(())
        })
    }

    /// Drop a task record, announcing its final `status`.
    pub(crate) fn forget_task(&self, task: &TaskRecord, status: TaskStatus) -> EngineResult<()> {
        let fence = self.fence()?;
        self.inner.store.write(Some(&fence), |txn| {
            txn.delete_task(&task.spec_id, &task.id)?;
            txn.append(status_update(task, status))?;
            Ok(())
        })
    }
}

fn status_update(task: &TaskRecord, status: TaskStatus) -> Event {
    Event::StatusUpdate {
        task_id: task.id.clone(),
        spec_id: task.spec_id.clone(),
        version: task.version,
        host: task.host.clone(),
        task_status: status,
    }
}

fn open_record(
    txn: &mut StateTxn<'_>,
    sequence: u64,
    trigger: DeploymentTrigger,
    kind: SpecKind,
    id: &PathId,
    actions: Vec<StepAction>,
    now: u64,
) -> EngineResult<DeploymentRecord> {
    let record = DeploymentRecord {
        id: uuid::Uuid::new_v4().to_string(),
        sequence,
        trigger,
        kind,
        affected: vec![id.clone()],
        steps: actions.iter().cloned().map(Step::new).collect(),
        status: DeploymentStatus::Pending,
        reason: None,
        created_at: now,
        updated_at: now,
    };
    txn.put_deployment(&record)?;
    txn.append(Event::DeploymentInfo {
        deployment_id: record.id.clone(),
        affected: record.affected.clone(),
        steps: actions,
        current_step: 0,
    })?;
    Ok(record)
}
