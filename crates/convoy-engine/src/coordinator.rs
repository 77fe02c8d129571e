//! Leader lifecycle.
//!
//! The coordinator follows the election's watch channel. On election it
//! applies a pending restore, announces the new leader, reconciles, and
//! resumes the engine; only then does it open the write gate. On
//! demotion it closes the gate and suspends the engine.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use convoy_backup::{BackupError, BackupService, BackupSummary, BackupUri};
use convoy_election::{Election, ElectionError, LeaderToken, LeadershipState};
use convoy_events::EventPublisher;
use convoy_state::Event;

use crate::engine::DeploymentEngine;
use crate::error::EngineError;
use crate::reconciler::{ReconcileReport, Reconciler};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("replica is not serving as leader")]
    NotServing,

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Election(#[from] ElectionError),
}

pub struct Coordinator {
    election: Arc<Election>,
    engine: DeploymentEngine,
    reconciler: Reconciler,
    backup: BackupService,
    publisher: EventPublisher,
    serving: watch::Sender<bool>,
    transition: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        election: Arc<Election>,
        engine: DeploymentEngine,
        backup: BackupService,
        publisher: EventPublisher,
    ) -> Self {
        let (serving, _) = watch::channel(false);
        Self {
            election,
            reconciler: Reconciler::new(engine.clone()),
            engine,
            backup,
            publisher,
            serving,
            transition: Mutex::new(()),
        }
    }

    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }

    pub fn engine(&self) -> &DeploymentEngine {
        &self.engine
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Whether this replica currently accepts writes.
    pub fn is_serving(&self) -> bool {
        *self.serving.borrow()
    }

    pub fn watch_serving(&self) -> watch::Receiver<bool> {
        self.serving.subscribe()
    }

    /// React to leadership changes until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut leadership = self.election.watch();
        loop {
            let state = leadership.borrow_and_update().clone();
            match state {
                LeadershipState::Leader(token) => self.on_elected(&token).await,
                LeadershipState::Follower => self.on_demoted().await,
            }
            tokio::select! {
                changed = leadership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.on_demoted().await;
        info!(replica = %self.election.replica_id(), "coordinator stopped");
    }

    async fn on_elected(&self, token: &LeaderToken) {
        let _transition = self.transition.lock().await;
        if self.is_serving() {
            return;
        }
        info!(replica = %token.replica_id, epoch = token.epoch, "leadership acquired, preparing to serve");

        if let Err(e) = self.apply_pending_restore().await {
            warn!(error = %e, "pending restore could not be handled");
        }

        match self.election.fence() {
            Ok(fence) => {
                let event = Event::LeadershipChanged {
                    leader: token.replica_id.clone(),
                    epoch: token.epoch,
                };
                if let Err(e) = self.publisher.publish(&fence, event) {
                    warn!(error = %e, "failed to publish leadership change");
                }
            }
            Err(e) => {
                warn!(error = %e, "leadership lost before serving");
                return;
            }
        }

        if let Err(e) = self.reconcile_with_retry().await {
            if e.is_leadership_lost() {
                warn!(error = %e, "leadership lost during reconciliation");
            } else {
                error!(error = %e, "reconciliation failed, giving up leadership");
                if let Err(e) = self.election.abdicate() {
                    warn!(error = %e, "abdication after failed reconciliation failed");
                }
            }
            return;
        }

        if let Err(e) = self.engine.resume() {
            error!(error = %e, "failed to resume deployments, giving up leadership");
            self.engine.suspend_all().await;
            if let Err(e) = self.election.abdicate() {
                warn!(error = %e, "abdication after failed resume failed");
            }
            return;
        }

        if self.election.is_leader() {
            self.serving.send_replace(true);
            info!(replica = %token.replica_id, epoch = token.epoch, "serving as leader");
        } else {
            self.engine.suspend_all().await;
        }
    }

    async fn on_demoted(&self) {
        let _transition = self.transition.lock().await;
        if self.serving.send_replace(false) {
            info!(replica = %self.election.replica_id(), "stopped serving");
        }
        self.engine.suspend_all().await;
    }

    async fn apply_pending_restore(&self) -> Result<(), CoordinatorError> {
        let store = self.engine.store();
        let Some(uri) = store.pending_restore().map_err(EngineError::from)? else {
            return Ok(());
        };

        let fence = self.election.fence()?;
        let backup = self.backup.clone();
        let target = uri.clone();
        match tokio::task::spawn_blocking(move || backup.restore(&fence, &target)).await {
            Ok(Ok(state)) => {
                info!(%uri, apps = state.apps.len(), pods = state.pods.len(), "pending restore applied");
            }
            Ok(Err(e)) => warn!(%uri, error = %e, "restore failed, keeping current state"),
            Err(e) => warn!(%uri, error = %e, "restore task aborted, keeping current state"),
        }

        let fence = self.election.fence()?;
        store
            .write(Some(&fence), |txn| txn.set_pending_restore(None))
            .map_err(EngineError::from)?;
        Ok(())
    }

    async fn reconcile_with_retry(&self) -> Result<ReconcileReport, EngineError> {
        let policy = *self.engine.retry();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.reconciler.reconcile().await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_leadership_lost() || attempt >= policy.max_attempts => return Err(e),
                Err(e) => {
                    let delay = policy.delay(attempt);
                    warn!(attempt, ?delay, error = %e, "reconciliation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Give up leadership, optionally writing a backup first and leaving
    /// a restore for whichever replica is elected next. A failed backup
    /// aborts the abdication and this replica keeps serving.
    pub async fn abdicate(
        &self,
        backup: Option<&str>,
        restore: Option<&str>,
    ) -> Result<Option<BackupSummary>, CoordinatorError> {
        for uri in backup.iter().chain(restore.iter()) {
            BackupUri::parse(uri)?;
        }

        let _transition = self.transition.lock().await;
        if !self.is_serving() {
            return Err(CoordinatorError::NotServing);
        }
        self.serving.send_replace(false);
        self.engine.suspend_all().await;

        let summary = match backup {
            Some(uri) => {
                let service = self.backup.clone();
                let target = uri.to_string();
                let result = tokio::task::spawn_blocking(move || service.backup(&target))
                    .await
                    .unwrap_or_else(|e| Err(BackupError::Io(std::io::Error::other(e.to_string()))));
                match result {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        warn!(%uri, error = %e, "backup failed, abdication aborted");
                        self.reopen().await;
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        if let Some(uri) = restore {
            let marked = self.election.fence().map_err(EngineError::from).and_then(|fence| {
                self.engine
                    .store()
                    .write(Some(&fence), |txn| txn.set_pending_restore(Some(uri)))
                    .map_err(EngineError::from)
            });
            if let Err(e) = marked {
                self.reopen().await;
                return Err(e.into());
            }
        }

        self.election.abdicate()?;
        info!(
            replica = %self.election.replica_id(),
            backup = backup.unwrap_or("-"),
            restore = restore.unwrap_or("-"),
            "abdicated"
        );
        Ok(summary)
    }

    async fn reopen(&self) {
        match self.engine.resume() {
            Ok(_) if self.election.is_leader() => {
                self.serving.send_replace(true);
            }
            Ok(_) => self.engine.suspend_all().await,
            Err(e) => {
                error!(error = %e, "failed to resume after aborted abdication");
                self.engine.suspend_all().await;
            }
        }
    }
}
