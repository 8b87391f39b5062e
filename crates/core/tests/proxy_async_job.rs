//! Async job through the proxy: upload, dispatch, poll until completed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use toolbench_core::config::AppConfig;
use toolbench_core::decode::{Artifact, DecodeOptions};
use toolbench_core::job::JobStatus;
use toolbench_core::proxy_client::ProxyClient;
use toolbench_core::server::{app_router, AppState};
use toolbench_core::session::{InputFile, JobSession, RunRequest};
use toolbench_core::tool::ToolKind;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Default)]
struct Upstream {
    addr: Arc<Mutex<Option<SocketAddr>>>,
    status_calls: Arc<AtomicUsize>,
    submitted: Arc<Mutex<Vec<Value>>>,
    uploaded: Arc<Mutex<Vec<(String, usize)>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

impl Upstream {
    fn base(&self) -> String {
        let addr = self.addr.lock().unwrap().expect("upstream address");
        format!("http://{addr}")
    }
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

async fn resources(State(up): State<Upstream>, Json(body): Json<Value>) -> Json<Value> {
    let name = body["file_name"].as_str().unwrap_or("missing").to_string();
    let base = up.base();
    Json(json!({"data": {
        "upload_url": format!("{base}/blob/{name}?X-Goog-Signature=abc"),
        "file_url": format!("{base}/blob/{name}?X-Goog-Expires=900"),
    }}))
}

async fn blob(State(up): State<Upstream>, Path(name): Path<String>, body: Bytes) {
    up.uploaded.lock().unwrap().push((name, body.len()));
}

async fn run(State(up): State<Upstream>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    up.auth.lock().unwrap().push(auth);
    up.submitted.lock().unwrap().push(body);
    Json(json!({"id": "job-1", "status": "IN_QUEUE"}))
}

async fn status(State(up): State<Upstream>, Path(id): Path<String>) -> Json<Value> {
    let call = up.status_calls.fetch_add(1, Ordering::SeqCst);
    if call < 2 {
        Json(json!({"id": id, "status": "IN_QUEUE"}))
    } else {
        Json(json!({
            "id": id,
            "status": "COMPLETED",
            "output": {"output_url": "https://x/y.jpg?sig=abc"}
        }))
    }
}

/// Mock compute + resource + storage upstream, then the real proxy in front.
async fn start_stack() -> (Upstream, ProxyClient) {
    let upstream = Upstream::default();
    let upstream_app = Router::new()
        .route("/resources", post(resources))
        .route("/blob/{name}", put(blob))
        .route("/v2/wall/run", post(run))
        .route("/v2/wall/status/{id}", get(status))
        .with_state(upstream.clone());
    let upstream_addr = spawn(upstream_app).await;
    *upstream.addr.lock().unwrap() = Some(upstream_addr);

    let mut config = AppConfig::default();
    config.upstream.runpod_api_key = Some("rp-test-key".to_string());
    config.upstream.resource_api_url = Some(format!("http://{upstream_addr}/resources"));
    config.upstream.endpoints.wall_painting = Some(format!("http://{upstream_addr}/v2/wall"));
    let state = AppState::new(config, PathBuf::from("public/examples")).unwrap();
    let proxy_addr = spawn(app_router(state)).await;

    let client = ProxyClient::new(&format!("http://{proxy_addr}"), Duration::from_secs(10)).unwrap();
    (upstream, client)
}

#[tokio::test]
async fn wall_painting_job_completes_through_proxy() {
    let (upstream, proxy) = start_stack().await;
    let proxy = Arc::new(proxy.with_upload_tool(ToolKind::WallPainting));
    let mut session = JobSession::new(proxy.clone(), proxy, POLL_INTERVAL).unwrap();

    let request = RunRequest::new(
        ToolKind::WallPainting,
        vec![InputFile::new("room.png", "image/png", b"fake-png".to_vec())],
    );
    let job = tokio::time::timeout(Duration::from_secs(10), session.run(request))
        .await
        .expect("job should finish")
        .expect("job should complete");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.id.as_deref(), Some("job-1"));
    assert_eq!(
        job.result,
        Some(Artifact::Url {
            url: "https://x/y.jpg".to_string()
        })
    );
    assert_eq!(upstream.status_calls.load(Ordering::SeqCst), 3);
    assert!(!session.is_polling());

    let uploaded = upstream.uploaded.lock().unwrap().clone();
    assert_eq!(uploaded.len(), 1);
    assert!(uploaded[0].0.starts_with("input_") && uploaded[0].0.ends_with(".png"));
    assert_eq!(uploaded[0].1, b"fake-png".len());

    let submitted = upstream.submitted.lock().unwrap().clone();
    let input = &submitted[0]["input"];
    let img_url = input["img_url"].as_str().unwrap();
    assert!(img_url.contains("/blob/input_") && !img_url.contains('?'));
    assert!(input["output_signed_url"]
        .as_str()
        .unwrap()
        .contains("/blob/output_"));
    assert_eq!(input["color"], "#ffffff");

    assert_eq!(upstream.auth.lock().unwrap().as_slice(), ["Bearer rp-test-key"]);
}

#[tokio::test]
async fn existing_job_can_be_watched_by_id() {
    let (upstream, proxy) = start_stack().await;
    let proxy = Arc::new(proxy);
    let mut session = JobSession::new(proxy.clone(), proxy, POLL_INTERVAL).unwrap();

    let job = tokio::time::timeout(
        Duration::from_secs(10),
        session.watch(ToolKind::WallPainting, "job-1", DecodeOptions::default()),
    )
    .await
    .expect("watch should finish")
    .expect("job should complete");

    assert_eq!(job.result.and_then(|a| a.url().map(str::to_string)).as_deref(), Some("https://x/y.jpg"));
    assert_eq!(upstream.status_calls.load(Ordering::SeqCst), 3);
    assert!(session.status_message().to_string().contains("Job job-1 Completed!"));
}
