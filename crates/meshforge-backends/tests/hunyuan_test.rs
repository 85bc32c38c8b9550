//! Integration tests for the Hunyuan3D backend against a mocked queue API.

use meshforge_abstraction::{ErrorKind, GenerationBackend, NoopProgress, ParamMap};
use meshforge_backends::{BackendRegistry, BackendSettings, Hunyuan3dBackend, Hunyuan3dSettings};
use mockito::Matcher;
use serde_json::json;

const APP: &str = "/fal-ai/hunyuan3d/v2";

fn backend(server: &mockito::Server) -> Hunyuan3dBackend {
    let settings = Hunyuan3dSettings {
        base_url: server.url(),
        poll_interval_ms: 10,
        ..Hunyuan3dSettings::default()
    };
    Hunyuan3dBackend::with_api_key(settings, "fal-key".to_string())
}

#[tokio::test]
async fn test_queue_flow_returns_mesh() {
    let mut server = mockito::Server::new_async().await;

    let enqueue = server
        .mock("POST", APP)
        .match_header("authorization", "Key fal-key")
        .match_body(Matcher::PartialJson(json!({
            "input_image_url": "https://img.example/lamp.png",
            "octree_resolution": 256,
            "face_limit": 40000
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"request_id": "r-1"}"#)
        .create_async()
        .await;

    let status = server
        .mock("GET", Matcher::Regex(format!("^{}/requests/r-1/status", APP)))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "COMPLETED", "logs": []}"#)
        .create_async()
        .await;

    let result = server
        .mock("GET", format!("{}/requests/r-1", APP).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model_mesh": {"url": "https://cdn.example/r-1.glb", "file_size": 2048},
                "thumbnail": {"url": "https://cdn.example/r-1.png"}
            }"#,
        )
        .create_async()
        .await;

    let backend = backend(&server);
    let request = backend
        .build_request("https://img.example/lamp.png", &ParamMap::new())
        .unwrap();

    let raw = backend.submit(&request, &NoopProgress).await.unwrap();
    let output = backend.interpret_result(&raw).unwrap();

    assert_eq!(output.download_url, "https://cdn.example/r-1.glb");
    assert_eq!(output.size_bytes, Some(2048));
    assert_eq!(output.preview_url.as_deref(), Some("https://cdn.example/r-1.png"));

    enqueue.assert_async().await;
    status.assert_async().await;
    result.assert_async().await;
}

#[tokio::test]
async fn test_completed_with_error_is_server_error() {
    let mut server = mockito::Server::new_async().await;
    let _enqueue = server
        .mock("POST", APP)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"request_id": "r-2"}"#)
        .create_async()
        .await;
    let _status = server
        .mock("GET", Matcher::Regex(format!("^{}/requests/r-2/status", APP)))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "COMPLETED", "error": "image has no foreground"}"#)
        .create_async()
        .await;

    let backend = backend(&server);
    let request = backend.build_request("https://img.example/a.png", &ParamMap::new()).unwrap();
    let err = backend.submit(&request, &NoopProgress).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Server);
}

#[tokio::test]
async fn test_forbidden_is_auth_error() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", APP)
        .with_status(403)
        .with_body(r#"{"detail": "Forbidden"}"#)
        .create_async()
        .await;

    let backend = backend(&server);
    let request = backend.build_request("https://img.example/a.png", &ParamMap::new()).unwrap();
    let err = backend.submit(&request, &NoopProgress).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn test_gateway_timeout_is_timeout() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", APP)
        .with_status(504)
        .with_body("gateway timeout")
        .create_async()
        .await;

    let backend = backend(&server);
    let request = backend.build_request("https://img.example/a.png", &ParamMap::new()).unwrap();
    let err = backend.submit(&request, &NoopProgress).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_unknown_status_is_malformed() {
    let mut server = mockito::Server::new_async().await;
    let _enqueue = server
        .mock("POST", APP)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"request_id": "r-3"}"#)
        .create_async()
        .await;
    let _status = server
        .mock("GET", Matcher::Regex(format!("^{}/requests/r-3/status", APP)))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"state": "done"}"#)
        .create_async()
        .await;

    let backend = backend(&server);
    let request = backend.build_request("https://img.example/a.png", &ParamMap::new()).unwrap();
    let err = backend.submit(&request, &NoopProgress).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    assert_eq!(err.diagnostic(), Some("object{state: string}"));
}

#[test]
fn test_registry_exposes_hunyuan_schema() {
    let registry = BackendRegistry::from_settings(&BackendSettings::default());
    let backend = registry.resolve("hunyuan3d").unwrap();
    let face_limit = backend.param_schema().get("faceLimit").unwrap();
    assert_eq!(face_limit.default, json!(40000));
    assert_eq!(backend.display_meta().estimated_seconds, 180);
}
