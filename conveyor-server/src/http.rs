//! HTTP surface: the task-queue POST endpoints and the read-only RPCs the
//! status UI consumes.
//!
//! Task endpoints require the queue-origin header and answer 500 on
//! infrastructure failure so the queue redelivers; `callback` instead
//! enforces the target stage's access class and turns poison pills into
//! 200 once the queue's retry budget is spent.

use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use conveyor_core::engine::{CallbackAuth, CallbackOutcome, CallbackRequest, Engine};
use conveyor_core::queue::Task;

/// Set by the task queue on every POST it makes.
pub const TASK_ORIGIN_HEADER: &str = "x-conveyor-taskname";
/// Delivery count, set by the task queue; drives poison-pill handling.
pub const TASK_RETRY_COUNT_HEADER: &str = "x-conveyor-taskretrycount";
/// Set by the fronting proxy when the request passed admin auth.
pub const ADMIN_HEADER: &str = "x-conveyor-admin";

/// Callbacks redelivered more than this many times return 200 to drop.
const MAX_CALLBACK_RETRIES: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub base_path: String,
}

pub fn router(engine: Arc<Engine>, base_path: &str) -> Router {
    let state = AppState {
        engine,
        base_path: base_path.to_string(),
    };
    Router::new()
        .route(&format!("{base_path}/run"), post(task_endpoint))
        .route(&format!("{base_path}/output"), post(task_endpoint))
        .route(&format!("{base_path}/finalized"), post(task_endpoint))
        .route(&format!("{base_path}/fanout"), post(task_endpoint))
        .route(&format!("{base_path}/fanout_abort"), post(task_endpoint))
        .route(&format!("{base_path}/abort"), post(task_endpoint))
        .route(&format!("{base_path}/cleanup"), post(task_endpoint))
        .route(&format!("{base_path}/callback"), post(callback_endpoint))
        .route(&format!("{base_path}/rpc/tree"), get(tree_endpoint))
        .route(&format!("{base_path}/rpc/list"), get(list_endpoint))
        .route(
            &format!("{base_path}/rpc/class_paths"),
            get(class_paths_endpoint),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Generic task endpoint: rebuild the task from the form body and hand it
/// to the engine's dispatcher.
async fn task_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::OriginalUri(uri): axum::extract::OriginalUri,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    if !headers.contains_key(TASK_ORIGIN_HEADER) {
        tracing::warn!(path = %uri.path(), "task POST without queue-origin header");
        return StatusCode::FORBIDDEN.into_response();
    }

    let task = Task {
        name: None,
        path: uri.path().to_string(),
        params,
        eta: None,
    };
    match state.engine.dispatch_task(&task).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(path = %uri.path(), error = %format!("{err:#}"), "task handler failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn callback_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    let retry_count = headers
        .get(TASK_RETRY_COUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let auth = CallbackAuth {
        from_task_queue: headers.contains_key(TASK_ORIGIN_HEADER),
        is_admin: headers.contains_key(ADMIN_HEADER),
    };

    let Some(pipeline_id) = params
        .iter()
        .find(|(k, _)| k == "pipeline_id")
        .and_then(|(_, v)| Uuid::parse_str(v).ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing or bad pipeline_id").into_response();
    };
    let user_params: Vec<(String, String)> = params
        .into_iter()
        .filter(|(k, _)| k != "pipeline_id")
        .collect();

    let result = state
        .engine
        .handle_callback(CallbackRequest {
            pipeline_id,
            params: user_params,
            auth,
        })
        .await;

    match result {
        Ok(CallbackOutcome::Dispatched) | Ok(CallbackOutcome::Ignored) => {
            StatusCode::OK.into_response()
        }
        Ok(CallbackOutcome::Forbidden) => StatusCode::FORBIDDEN.into_response(),
        Ok(CallbackOutcome::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Ok(CallbackOutcome::NotSupported) => {
            (StatusCode::BAD_REQUEST, "stage does not accept callbacks").into_response()
        }
        Err(err) if retry_count >= MAX_CALLBACK_RETRIES => {
            tracing::error!(
                pipeline_id = %pipeline_id,
                retry_count,
                error = %format!("{err:#}"),
                "poison callback dropped"
            );
            StatusCode::OK.into_response()
        }
        Err(err) => {
            tracing::error!(pipeline_id = %pipeline_id, error = %format!("{err:#}"), "callback failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn tree_endpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(root_id) = params
        .get("root_pipeline_id")
        .and_then(|raw| Uuid::parse_str(raw).ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing or bad root_pipeline_id").into_response();
    };
    match state.engine.get_status_tree(root_id).await {
        Ok(tree) => Json(tree).into_response(),
        Err(err) => (StatusCode::NOT_FOUND, format!("{err:#}")).into_response(),
    }
}

async fn list_endpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let count = params.get("count").and_then(|raw| raw.parse().ok());
    match state
        .engine
        .get_root_list(
            params.get("class_path").map(String::as_str),
            params.get("cursor").map(String::as_str),
            count,
        )
        .await
    {
        Ok(list) => Json(list).into_response(),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "root list query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn class_paths_endpoint(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "classPaths": state.engine.get_pipeline_names() })).into_response()
}
