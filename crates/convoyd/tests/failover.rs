//! Several replicas on one store: write gate, abdication with backup and
//! restore, and task continuity across the leader change.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{Cluster, eventually, fast_config, finished, send};

fn file_uri(dir: &tempfile::TempDir, name: &str) -> String {
    url::Url::from_file_path(dir.path().join(name))
        .unwrap()
        .to_string()
}

fn query_escape(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[tokio::test]
async fn followers_refuse_writes_and_name_the_leader() {
    let cluster = Cluster::start(3, &fast_config());
    let leader = cluster.leader().await;
    let follower = (leader + 1) % 3;
    let leader_address = cluster.replicas[leader].address().to_string();

    let (status, body) = send(
        &cluster.routers[follower],
        "POST",
        "/v2/apps",
        Some(json!({ "id": "/x", "cmd": "true" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["data"]["leader"], leader_address.as_str());

    let (status, _) = send(&cluster.routers[follower], "GET", "/ping", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = send(&cluster.routers[follower], "DELETE", "/v2/leader", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Reads work anywhere.
    let (status, body) = send(&cluster.routers[follower], "GET", "/v2/leader", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["leader"], leader_address.as_str());
    let serving = cluster
        .replicas
        .iter()
        .filter(|r| r.coordinator().is_serving())
        .count();
    assert_eq!(serving, 1);
}

#[tokio::test]
async fn abdication_with_backup_and_restore_keeps_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let uri = file_uri(&dir, "backup.tar.gz");
    let cluster = Cluster::start(2, &fast_config());
    let old = cluster.leader().await;
    let old_router = &cluster.routers[old];

    let app = json!({ "id": "/sleep", "cmd": "sleep 1000", "instances": 2 });
    let (status, body) = send(old_router, "POST", "/v2/apps", Some(app)).await;
    assert_eq!(status, StatusCode::CREATED);
    finished(old_router, body["data"]["deploymentId"].as_str().unwrap()).await;
    let (_, before) = send(old_router, "GET", "/v2/apps/sleep", None).await;
    let mut tasks_before: Vec<String> = before["data"]["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap().to_string())
        .collect();
    tasks_before.sort();
    assert_eq!(tasks_before.len(), 2);

    let escaped = query_escape(&uri);
    let (status, body) = send(
        old_router,
        "DELETE",
        &format!("/v2/leader?backup={escaped}&restore={escaped}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["data"]["backup"]["entries"].as_u64().unwrap() > 0);

    let new = cluster.leader().await;
    assert_ne!(new, old);
    let (status, _) = send(old_router, "GET", "/ping", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let new_router = &cluster.routers[new];
    let (status, _) = send(new_router, "GET", "/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(cluster.store.pending_restore().unwrap().is_none());

    let (status, after) = send(new_router, "GET", "/v2/apps/sleep", None).await;
    assert_eq!(status, StatusCode::OK);
    let mut tasks_after: Vec<String> = after["data"]["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap().to_string())
        .collect();
    tasks_after.sort();
    assert_eq!(tasks_after, tasks_before);
    assert_eq!(after["data"]["version"], before["data"]["version"]);

    // The new leader accepts and completes further changes.
    let scaled = json!({ "cmd": "sleep 1000", "instances": 3 });
    let (status, body) = send(new_router, "PUT", "/v2/apps/sleep", Some(scaled)).await;
    assert_eq!(status, StatusCode::OK);
    let record = finished(new_router, body["data"]["deploymentId"].as_str().unwrap()).await;
    assert_eq!(record["status"], "succeeded");

    let summary = convoy_backup::archive::verify(&convoy_backup::BackupUri::parse(&uri).unwrap())
        .unwrap();
    assert_eq!(summary.manifest.apps, 1);
}

#[tokio::test]
async fn failed_backup_keeps_the_leader_serving() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("occupied"), b"file").unwrap();
    let blocked = query_escape(&file_uri(&dir, "occupied/backup.tar"));
    let cluster = Cluster::start(2, &fast_config());
    let leader = cluster.leader().await;
    let router = &cluster.routers[leader];

    let (status, _) = send(router, "DELETE", &format!("/v2/leader?backup={blocked}"), None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _) = send(router, "GET", "/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        router,
        "POST",
        "/v2/apps",
        Some(json!({ "id": "/still-here", "cmd": "true" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn leadership_change_is_announced() {
    let cluster = Cluster::start(2, &fast_config());
    let old = cluster.leader().await;
    let (status, _) = send(&cluster.routers[old], "DELETE", "/v2/leader", None).await;
    assert_eq!(status, StatusCode::OK);
    let new = cluster.leader().await;
    assert_ne!(new, old);

    let new_id = cluster.replicas[new].id().to_string();
    eventually(|| async {
        let events = cluster.store.events_after(0, 100).unwrap();
        events
            .iter()
            .any(|e| {
                e.event.event_type() == "leadership_changed_event"
                    && serde_json::to_value(&e.event).unwrap()["leader"] == new_id.as_str()
            })
            .then_some(())
    })
    .await;
}
