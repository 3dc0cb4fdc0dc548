use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use uuid::Uuid;

use conveyor_core::blob::MemoryBlobStore;
use conveyor_core::engine::Engine;
use conveyor_core::queue::MemoryTaskQueue;
use conveyor_core::stage::StageRegistry;
use conveyor_core::store_memory::MemoryStore;
use conveyor_server::http::{router, TASK_ORIGIN_HEADER};

const BASE: &str = "/_ah/pipeline";

fn test_app() -> axum::Router {
    let engine = Arc::new(Engine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryTaskQueue::new()),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(StageRegistry::new()),
    ));
    router(engine, BASE)
}

fn form_post(path: &str, body: &str, with_origin: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/x-www-form-urlencoded");
    if with_origin {
        builder = builder.header(TASK_ORIGIN_HEADER, "task-1");
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_task_endpoints_require_origin_header() {
    let app = test_app();
    let request = form_post(
        &format!("{BASE}/run"),
        &format!("pipeline_key={}", Uuid::now_v7()),
        false,
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_task_for_missing_record_is_dropped_with_200() {
    let app = test_app();
    // A run task racing cleanup must be swallowed, not retried forever.
    let request = form_post(
        &format!("{BASE}/run"),
        &format!("pipeline_key={}", Uuid::now_v7()),
        true,
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_task_body_is_a_server_error() {
    let app = test_app();
    let request = form_post(&format!("{BASE}/run"), "pipeline_key=not-a-uuid", true);
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_callback_for_unknown_pipeline_is_not_found() {
    let app = test_app();
    let request = form_post(
        &format!("{BASE}/callback"),
        &format!("pipeline_id={}&k=v", Uuid::now_v7()),
        true,
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_class_paths_rpc_answers() {
    let app = test_app();
    let request = Request::builder()
        .method("GET")
        .uri(format!("{BASE}/rpc/class_paths"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_tree_rpc_rejects_missing_root() {
    let app = test_app();
    let request = Request::builder()
        .method("GET")
        .uri(format!("{BASE}/rpc/tree?root_pipeline_id={}", Uuid::now_v7()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
