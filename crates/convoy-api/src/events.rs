//! `GET /v2/events`: the event log as server-sent events.
//!
//! Each SSE frame carries the event type as `event`, the log sequence as
//! `id` (omitted for the synthesized `event_stream_attached`) and the JSON
//! event as `data`. Clients resume with `Last-Event-ID` and filter with
//! `event_type=a,b` (repeated parameters are accepted too).

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{Extensions, HeaderMap};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use tracing::{info, warn};

use convoy_events::SubscribeOptions;
use convoy_state::EventRecord;

use crate::ApiState;

const LAST_EVENT_ID: &str = "last-event-id";
const FORWARDED_FOR: &str = "x-forwarded-for";

/// GET /v2/events
pub async fn stream_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    extensions: Extensions,
    RawQuery(query): RawQuery,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let options = SubscribeOptions {
        after: last_event_id(&headers),
        event_types: event_types(query.as_deref()),
        remote_address: remote_address(&headers, &extensions),
    };
    info!(
        remote = %options.remote_address,
        after = ?options.after,
        types = ?options.event_types,
        "event stream attached"
    );

    let publisher = state.coordinator.publisher();
    let interval = publisher.config().keep_alive();
    let stream = publisher
        .subscribe(options)
        .map(|record| Ok::<_, Infallible>(to_sse(&record)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(interval))
}

fn to_sse(record: &EventRecord) -> SseEvent {
    let mut event = SseEvent::default().event(record.event.event_type());
    if record.seq > 0 {
        event = event.id(record.seq.to_string());
    }
    match serde_json::to_string(record) {
        Ok(data) => event.data(data),
        Err(e) => {
            warn!(seq = record.seq, error = %e, "failed to encode event");
            event.comment("unencodable event")
        }
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn event_types(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "event_type")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// First hop of `X-Forwarded-For`, else the peer address when the server
/// was started with connect info.
fn remote_address(headers: &HeaderMap, extensions: &Extensions) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(addr) = forwarded {
        return addr.to_string();
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
