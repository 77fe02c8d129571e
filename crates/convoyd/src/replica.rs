//! Assembly of one control-plane replica.
//!
//! A replica owns an election, a coordinator (engine, reconciler, backup,
//! events) and an API router. Replicas that share a store and a resource
//! manager form a cluster: exactly one of them serves writes at a time.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use convoy_backup::BackupService;
use convoy_election::Election;
use convoy_engine::{
    Coordinator, DeploymentEngine, LocalResourceManager, NamespaceSecretStore, ResourceManager,
};
use convoy_events::EventPublisher;
use convoy_state::{Clock, StateStore, SystemClock};

use crate::config::DaemonConfig;

pub struct Replica {
    election: Arc<Election>,
    coordinator: Arc<Coordinator>,
}

impl Replica {
    pub fn new(
        replica_id: &str,
        address: &str,
        store: StateStore,
        resources: Arc<dyn ResourceManager>,
        clock: Arc<dyn Clock>,
        config: &DaemonConfig,
    ) -> anyhow::Result<Self> {
        let election = Arc::new(Election::new(
            replica_id,
            address,
            store.clone(),
            clock.clone(),
            config.election.clone(),
        )?);
        let engine = DeploymentEngine::new(
            store.clone(),
            election.clone(),
            resources,
            Arc::new(NamespaceSecretStore::new(&config.secrets)),
            clock,
            config.deployment.clone(),
        );
        let coordinator = Arc::new(Coordinator::new(
            election.clone(),
            engine,
            BackupService::new(store.clone()),
            EventPublisher::new(store, config.events.clone()),
        ));
        Ok(Self {
            election,
            coordinator,
        })
    }

    /// `count` replicas on one store and one local resource manager,
    /// advertised as `127.0.0.1:<base_port + i>`.
    pub fn cluster(
        count: u16,
        base_port: u16,
        store: StateStore,
        config: &DaemonConfig,
    ) -> anyhow::Result<Vec<Self>> {
        let resources: Arc<dyn ResourceManager> =
            Arc::new(LocalResourceManager::new(config.agents.clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        (0..count)
            .map(|i| {
                let port = base_port
                    .checked_add(i)
                    .ok_or_else(|| anyhow::anyhow!("port range exhausted at replica {}", i + 1))?;
                Self::new(
                    &format!("convoy-{}", i + 1),
                    &format!("127.0.0.1:{port}"),
                    store.clone(),
                    resources.clone(),
                    clock.clone(),
                    config,
                )
            })
            .collect()
    }

    pub fn id(&self) -> &str {
        self.election.replica_id()
    }

    pub fn address(&self) -> &str {
        self.election.address()
    }

    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> Router {
        convoy_api::build_router(self.coordinator.clone())
    }

    /// Start the election, coordinator and event-pruning loops. All three
    /// stop when `shutdown` flips to `true`; a held lease is released.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let election = self.election.clone();
        let coordinator = self.coordinator.clone();
        let pruner = self.coordinator.clone();
        let (a, b, c) = (shutdown.clone(), shutdown.clone(), shutdown.clone());
        vec![
            tokio::spawn(async move { election.run(a).await }),
            tokio::spawn(async move { coordinator.run(b).await }),
            tokio::spawn(async move { pruner.publisher().run_pruner(c).await }),
        ]
    }

    /// Serve the API on `listener` until `shutdown` flips to `true`.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(replica = %self.id(), %addr, "API server starting");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
        info!(replica = %self.id(), "API server stopped");
        Ok(())
    }
}
