use std::sync::Arc;
use std::time::Duration;

use chunkline_api::app::{self, services::AppServices};
use chunkline_api::config::AppConfig;
use chunkline_api::default_handlers;
use chunkline_infra::OrchestratorConfig;
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over in-memory services, bound to an ephemeral port.
        let services = Arc::new(AppServices::in_memory(
            default_handlers(),
            OrchestratorConfig::default(),
        ));
        let app = app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start(
    client: &reqwest::Client,
    srv: &TestServer,
    body: serde_json::Value,
) -> reqwest::Response {
    client
        .post(format!("{}/batch", srv.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn resume(client: &reqwest::Client, srv: &TestServer, key: &str) -> reqwest::Response {
    client
        .put(format!("{}/batch/{}", srv.base_url, key))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = reqwest::get(format!("{}/handlers", srv.base_url)).await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["backend"], "in_memory");
    assert_eq!(body["handlers"], json!(["range"]));
}

#[tokio::test]
async fn batch_lifecycle_start_resume_finish() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = start(
        &client,
        &srv,
        json!({
            "key": "reindex",
            "config": {
                "handler_name": "range",
                "chunk_size": 10,
                "query_arguments": { "count": "25" }
            }
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let started: serde_json::Value = res.json().await.unwrap();
    assert_eq!(started["state"], "running");
    assert_eq!(started["processed_count"], 0);
    assert_eq!(started["item_type"], "u64");

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        let res = resume(&client, &srv, "reindex").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        outcomes.push(body["outcome"].as_str().unwrap().to_string());
    }
    assert_eq!(outcomes, ["advanced", "advanced", "advanced", "finished"]);

    let res = resume(&client, &srv, "reindex").await;
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "already_finished");

    let res = client
        .get(format!("{}/batch/reindex", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["state"], "finished");
    assert_eq!(status["processed_count"], 25);
    assert_eq!(status["cursor"], 24);
}

#[tokio::test]
async fn queue_worker_finishes_a_started_batch() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let config = AppConfig::default();
    let mut worker_config = config.clone();
    worker_config.sweep_interval = Duration::from_secs(3600);
    let workers = srv.services.spawn_workers(&worker_config);

    let res = start(
        &client,
        &srv,
        json!({
            "key": "background",
            "config": {
                "handler_name": "range",
                "chunk_size": 50,
                "base_delay": 0,
                "query_arguments": { "count": "120" }
            }
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let mut finished = false;
    for _ in 0..200 {
        let status: serde_json::Value = client
            .get(format!("{}/batch/background", srv.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["state"] == "finished" {
            assert_eq!(status["processed_count"], 120);
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    workers.shutdown().await;
    assert!(finished, "batch did not finish in the background");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/batch/nothing-here", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = resume(&client, &srv, "nothing-here").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .delete(format!("{}/batch/nothing-here", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = start(
        &client,
        &srv,
        json!({ "key": "x", "config": { "handler_name": "nope" } }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_handler");

    let res = start(&client, &srv, json!({ "key": "   ", "config": { "handler_name": "range" } })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_key");

    let res = start(&client, &srv, json!({ "key": "fresh" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = start(
        &client,
        &srv,
        json!({
            "key": "millennia",
            "config": { "handler_name": "range", "deadline": 1_000_000_000_000_000u64 }
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn cancelled_batch_is_gone_on_resume() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = start(
        &client,
        &srv,
        json!({
            "key": "doomed",
            "config": { "handler_name": "range", "chunk_size": 5 }
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let res = resume(&client, &srv, "doomed").await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .delete(format!("{}/batch/doomed", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cancelled: serde_json::Value = res.json().await.unwrap();
    assert_eq!(cancelled["processed_count"], 5);
    assert!(cancelled["cancelled_at"].is_string());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let res = resume(&client, &srv, "doomed").await;
    assert_eq!(res.status(), StatusCode::GONE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "expired");

    let status: serde_json::Value = client
        .get(format!("{}/batch/doomed", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "cancelled");
    assert_eq!(status["processed_count"], 5);
}

#[tokio::test]
async fn sweep_and_clean_endpoints_report_counts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for key in ["a", "b"] {
        let res = start(
            &client,
            &srv,
            json!({ "key": key, "config": { "handler_name": "range" } }),
        )
        .await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }

    let res = client
        .post(format!("{}/batch/all/check", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["scanned"], 2);
    assert_eq!(report["resumes_scheduled"], 2);
    assert_eq!(report["cleanups_scheduled"], 0);

    let res = client
        .delete(format!("{}/batch/all/clean", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["deleted"], 0);
}
