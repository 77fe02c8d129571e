//! `GET /v2/events` ordering, filtering and resume.

mod common;

use axum::body::{Body, BodyDataStream};
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{Cluster, TIMEOUT, fast_config, finished, send};

struct Frame {
    event: String,
    id: Option<u64>,
    data: Value,
}

struct SseReader {
    body: BodyDataStream,
    buf: String,
}

impl SseReader {
    async fn open(router: &Router, uri: &str, last_event_id: Option<u64>) -> Self {
        let mut req = Request::builder().uri(uri);
        if let Some(id) = last_event_id {
            req = req.header("last-event-id", id.to_string());
        }
        let resp = router
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        Self {
            body: resp.into_body().into_data_stream(),
            buf: String::new(),
        }
    }

    /// Next frame that names an event; keep-alive comments are skipped.
    async fn next(&mut self) -> Frame {
        loop {
            if let Some(end) = self.buf.find("\n\n") {
                let raw: String = self.buf.drain(..end + 2).collect();
                let mut event = None;
                let mut id = None;
                let mut data = String::new();
                for line in raw.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        event = Some(v.trim().to_string());
                    } else if let Some(v) = line.strip_prefix("id:") {
                        id = v.trim().parse().ok();
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data.push_str(v.trim_start());
                    }
                }
                if let Some(event) = event {
                    return Frame {
                        event,
                        id,
                        data: serde_json::from_str(&data).unwrap(),
                    };
                }
                continue;
            }
            let chunk = tokio::time::timeout(TIMEOUT, self.body.next())
                .await
                .expect("no event in time")
                .expect("stream ended")
                .unwrap();
            self.buf.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Frames up to and including the terminal event of `deployment`.
    async fn until_finished(&mut self, deployment: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next().await;
            let done = frame.data["deploymentId"] == deployment
                && matches!(
                    frame.event.as_str(),
                    "deployment_success" | "deployment_failed" | "deployment_cancelled"
                );
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

fn app(id: &str) -> Value {
    json!({ "id": id, "cmd": "sleep 1000", "instances": 2 })
}

#[tokio::test]
async fn subscriber_sees_attach_then_deployment_in_order() {
    let cluster = Cluster::start(1, &fast_config());
    cluster.leader().await;
    let router = &cluster.routers[0];

    let mut stream = SseReader::open(router, "/v2/events", None).await;
    let attached = stream.next().await;
    assert_eq!(attached.event, "event_stream_attached");
    assert_eq!(attached.id, None);
    assert_eq!(attached.data["remoteAddress"], "unknown");

    let (_, body) = send(router, "POST", "/v2/apps", Some(app("/ordered"))).await;
    let deployment = body["data"]["deploymentId"].as_str().unwrap().to_string();

    let frames = stream.until_finished(&deployment).await;
    let ours: Vec<&str> = frames
        .iter()
        .filter(|f| f.data["deploymentId"] == deployment.as_str())
        .map(|f| f.event.as_str())
        .collect();
    assert_eq!(ours.first(), Some(&"deployment_info"));
    assert_eq!(ours.last(), Some(&"deployment_success"));
    assert!(
        ours[1..ours.len() - 1]
            .iter()
            .all(|e| *e == "deployment_step_success"),
        "{ours:?}"
    );

    let ids: Vec<u64> = frames.iter().filter_map(|f| f.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
    let launches = frames
        .iter()
        .filter(|f| f.event == "status_update_event" && f.data["taskStatus"] == "TASK_RUNNING")
        .count();
    assert_eq!(launches, 2);
}

#[tokio::test]
async fn filter_and_resume() {
    let cluster = Cluster::start(1, &fast_config());
    cluster.leader().await;
    let router = &cluster.routers[0];

    let mut filtered = SseReader::open(
        router,
        "/v2/events?event_type=deployment_info,app_terminated_event",
        None,
    )
    .await;
    assert_eq!(filtered.next().await.event, "event_stream_attached");

    let (_, body) = send(router, "POST", "/v2/apps", Some(app("/filtered"))).await;
    let created = body["data"]["deploymentId"].as_str().unwrap().to_string();
    finished(router, &created).await;
    let (_, body) = send(router, "DELETE", "/v2/apps/filtered", None).await;
    let removed = body["data"]["deploymentId"].as_str().unwrap().to_string();
    finished(router, &removed).await;

    let info = filtered.next().await;
    assert_eq!(info.event, "deployment_info");
    assert_eq!(info.data["deploymentId"], created.as_str());
    let terminated = filtered.next().await;
    assert_eq!(terminated.event, "app_terminated_event");
    assert_eq!(terminated.data["appId"], "/filtered");
    let info = filtered.next().await;
    assert_eq!(info.event, "deployment_info");
    assert_eq!(info.data["deploymentId"], removed.as_str());

    // Last-Event-ID names the last event already seen.
    let resume_from = info.id.unwrap() - 1;
    let mut resumed = SseReader::open(router, "/v2/events", Some(resume_from)).await;
    assert_eq!(resumed.next().await.event, "event_stream_attached");
    let first = resumed.next().await;
    assert_eq!(first.id, Some(resume_from + 1));
    assert_eq!(first.event, "deployment_info");
}
