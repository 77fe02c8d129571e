//! convoy-api: REST API for a convoy replica.
//!
//! Every replica serves the full router. Reads answer from the shared
//! store on any replica; mutations are accepted only while this replica is
//! the serving leader and answer 503 with the leader's address otherwise.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/ping` | `pong` on the serving leader, 503 elsewhere |
//! | GET | `/v2/info` | Replica id, leader, election and serving flags |
//! | GET | `/v2/apps` | List apps |
//! | POST | `/v2/apps` | Create an app |
//! | GET | `/v2/apps/{id}` | App with its tasks and in-flight deployments |
//! | PUT | `/v2/apps/{id}` | Create or replace an app |
//! | DELETE | `/v2/apps/{id}` | Remove an app |
//! | GET, POST | `/v2/pods` | Same as apps, for pods |
//! | GET, PUT, DELETE | `/v2/pods/{id}` | Same as apps, for pods |
//! | GET | `/v2/deployments` | In-flight deployments |
//! | GET | `/v2/deployments/{id}` | One deployment, in flight or archived |
//! | DELETE | `/v2/deployments/{id}` | Cancel a deployment |
//! | GET | `/v2/leader` | Current leader |
//! | DELETE | `/v2/leader` | Abdicate, with optional `backup` and `restore` |
//! | GET | `/v2/events` | Server-sent event stream |

pub mod events;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use convoy_engine::Coordinator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
}

impl ApiState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

/// Build the complete API router for one replica.
pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    let state = ApiState::new(coordinator);

    let v2 = Router::new()
        .route("/info", get(handlers::get_info))
        .route("/apps", get(handlers::list_apps).post(handlers::create_app))
        .route(
            "/apps/{*id}",
            get(handlers::get_app)
                .put(handlers::put_app)
                .delete(handlers::delete_app),
        )
        .route("/pods", get(handlers::list_pods).post(handlers::create_pod))
        .route(
            "/pods/{*id}",
            get(handlers::get_pod)
                .put(handlers::put_pod)
                .delete(handlers::delete_pod),
        )
        .route("/deployments", get(handlers::list_deployments))
        .route(
            "/deployments/{id}",
            get(handlers::get_deployment).delete(handlers::cancel_deployment),
        )
        .route(
            "/leader",
            get(handlers::get_leader).delete(handlers::abdicate),
        )
        .route("/events", get(events::stream_events));

    Router::new()
        .route("/ping", get(handlers::ping))
        .nest("/v2", v2)
        .with_state(state)
}
