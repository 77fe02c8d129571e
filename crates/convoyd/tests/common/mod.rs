//! Shared harness: replicas on one in-memory store, driven through their
//! routers with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

use convoy_election::ElectionConfig;
use convoy_state::StateStore;
use convoyd::{DaemonConfig, Replica};

pub const TIMEOUT: Duration = Duration::from_secs(15);

/// Short leases so failover completes within a test.
pub fn fast_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.election = ElectionConfig {
        lease_ttl: Duration::from_millis(1_500),
        renew_interval: Duration::from_millis(100),
        renew_deadline: Duration::from_millis(900),
        poll_interval: Duration::from_millis(50),
        abdication_cooldown: Duration::from_millis(3_000),
    };
    config.deployment.initial_backoff_ms = 10;
    config.deployment.max_backoff_ms = 50;
    config
}

pub struct Cluster {
    pub store: StateStore,
    pub replicas: Vec<Replica>,
    pub routers: Vec<Router>,
    shutdown: watch::Sender<bool>,
}

impl Cluster {
    pub fn start(count: u16, config: &DaemonConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let replicas = Replica::cluster(count, 18080, store.clone(), config).unwrap();
        let (shutdown, rx) = watch::channel(false);
        for replica in &replicas {
            replica.spawn(&rx);
        }
        let routers = replicas.iter().map(Replica::router).collect();
        Self {
            store,
            replicas,
            routers,
            shutdown,
        }
    }

    /// Index of the replica that serves writes, once one does.
    pub async fn leader(&self) -> usize {
        eventually(|| async {
            self.replicas
                .iter()
                .position(|r| r.coordinator().is_serving())
        })
        .await
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Poll `probe` until it yields a value or [`TIMEOUT`] passes.
pub async fn eventually<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(value) = probe().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Send one request. Non-JSON bodies come back as a JSON string.
pub async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let resp = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, json)
}

/// Wait for a deployment to reach a terminal status and return its record.
pub async fn finished(router: &Router, deployment_id: &str) -> Value {
    let uri = format!("/v2/deployments/{deployment_id}");
    eventually(|| async {
        let (status, body) = send(router, "GET", &uri, None).await;
        let record = &body["data"];
        let done = status == StatusCode::OK
            && matches!(record["status"].as_str(), Some("succeeded" | "failed" | "cancelled"));
        done.then(|| record.clone())
    })
    .await
}
