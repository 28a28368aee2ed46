//! Routing, status codes and response shapes of the HTTP layer.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use noir_pipeline::engine::ScriptedRunner;
use noir_pipeline::server::router;
use serde_json::Value;
use tempfile::tempdir;
use tower::ServiceExt;

use common::*;

const BOUNDARY: &str = "noir-pipeline-test-boundary";

fn multipart(field: &str, bytes: &[u8]) -> Body {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"project.zip\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

fn upload(uri: &str, field: &str, bytes: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(multipart(field, bytes))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn health_check() {
    let tmp = tempdir().unwrap();
    let app = router(service(config(tmp.path()), ScriptedRunner::noir_toolchain()));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"Noir backend is running");
}

#[tokio::test]
async fn missing_upload_is_bad_request() {
    let tmp = tempdir().unwrap();
    let app = router(service(config(tmp.path()), ScriptedRunner::noir_toolchain()));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/compile")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "success": false, "error": "No file provided" })
    );

    // A form without the `file` field is treated the same way.
    let response = app
        .oneshot(upload("/compile", "other", b"x"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn compile_returns_inline_json() {
    let tmp = tempdir().unwrap();
    let app = router(service(config(tmp.path()), ScriptedRunner::noir_toolchain()));

    let response = app
        .oneshot(upload("/compile?requestId=http-1", "file", &project_zip()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["requestId"], "http-1");
    assert_eq!(json["proverToml"], PROVER_TOML);
    assert!(json["compiledJson"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn proof_endpoint_encodes_binaries() {
    let tmp = tempdir().unwrap();
    let app = router(service(config(tmp.path()), ScriptedRunner::noir_toolchain()));

    let response = app
        .oneshot(upload("/generate-proof?requestId=p", "file", &project_zip()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["vk"], "3q2+7w==");
    assert!(json["verifier"].as_str().is_some_and(|s| s.contains("HonkVerifier")));
}

#[tokio::test]
async fn verifier_endpoint_returns_zip_attachment() {
    let tmp = tempdir().unwrap();
    let app = router(service(config(tmp.path()), ScriptedRunner::noir_toolchain()));

    let response = app
        .oneshot(upload(
            "/generate-proof-with-verifier?requestId=z&includeStarknetVerifier=true",
            "file",
            &project_zip(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=verifier_z.zip"
    );
    let names = zip_names(&body_bytes(response).await);
    assert!(names.contains(&"verifier/cairo/lib.cairo".to_string()), "{names:?}");
}

#[tokio::test]
async fn profiling_endpoint_uses_default_profilers() {
    let tmp = tempdir().unwrap();
    let app = router(service(config(tmp.path()), ScriptedRunner::noir_toolchain()));

    let response = app
        .oneshot(upload("/compile-with-profiling?requestId=prof", "file", &project_zip()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=profile_prof.zip"
    );
    let names = zip_names(&body_bytes(response).await);
    assert!(names.contains(&"circuit/main.json".to_string()));
    assert!(names.contains(&"Prover.toml".to_string()));
    assert!(names.contains(&"profiler/opcodes/main_opcodes.svg".to_string()));
    assert!(names.contains(&"profiler/gates/main_gates.svg".to_string()));
}

#[tokio::test]
async fn error_statuses() {
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.max_upload_bytes = 512;
    let runner = ScriptedRunner::noir_toolchain().failing("nargo compile", 1);
    let app = router(service(cfg, runner));

    let too_big = vec![b'P'; 4096];
    let response = app
        .clone()
        .oneshot(upload("/compile", "file", &too_big))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["success"], false);

    let response = app
        .clone()
        .oneshot(upload("/compile?requestId=a%2Fb", "file", b"PK"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(upload("/compile-with-profiling?profilers=flame", "file", b"PK"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let small = zip_of(&[("Nargo.toml", MANIFEST)]);
    let response = app
        .oneshot(upload("/compile?requestId=boom", "file", &small))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert!(
        json["error"]
            .as_str()
            .is_some_and(|e| e.starts_with("[nargo] Failed with code 1"))
    );
    assert!(!tmp.path().join("boom").exists());
}

#[tokio::test]
async fn malformed_query_uses_error_envelope() {
    let tmp = tempdir().unwrap();
    let app = router(service(config(tmp.path()), ScriptedRunner::noir_toolchain()));

    let response = app
        .oneshot(upload("/compile?requestId=a&requestId=b", "file", &project_zip()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().is_some_and(|e| !e.is_empty()), "{json}");
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}
