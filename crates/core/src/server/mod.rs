use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::dispatch::ComputeBackend;
use crate::envelope::Action;
use crate::error::ToolError;
use crate::examples_catalog::{list_examples, ExampleCatalog, ExamplesError};
use crate::livekit::{TokenIssuer, TokenRequest, TokenResponse};
use crate::tool::{catalog, ToolDescriptor, ToolKind};
use crate::upload::UploadBackend;
use crate::upstream::{ResourceClient, RunpodClient};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    compute: Arc<dyn ComputeBackend>,
    uploads: Arc<dyn UploadBackend>,
    examples_dir: PathBuf,
}

impl AppState {
    /// State backed by the real compute and resource services.
    pub fn new(config: AppConfig, examples_dir: PathBuf) -> crate::error::Result<Self> {
        let compute = Arc::new(RunpodClient::new(config.upstream.clone())?);
        let uploads = Arc::new(ResourceClient::new(&config.upstream)?);
        Ok(Self::with_backends(config, compute, uploads, examples_dir))
    }

    pub fn with_backends(
        config: AppConfig,
        compute: Arc<dyn ComputeBackend>,
        uploads: Arc<dyn UploadBackend>,
        examples_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                compute,
                uploads,
                examples_dir,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn examples_dir(&self) -> &StdPath {
        &self.inner.examples_dir
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub fn app_router(state: AppState) -> Router {
    let examples = ServeDir::new(state.examples_dir());

    let mut api = Router::new()
        .route("/api/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/list-examples", get(get_examples))
        .route("/api/livekit-token", post(livekit_token));

    for tool in ToolKind::ALL {
        api = api.route(
            &format!("/api/{}", tool.slug()),
            post(move |state: State<AppState>, body: Bytes| tool_action(state, tool, body)),
        );
    }

    api.route("/api/{*path}", any(api_route_not_found))
        .nest_service("/examples", examples)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn list_tools() -> Json<Vec<ToolDescriptor>> {
    Json(catalog())
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

/// One route per tool; the envelope's `action` selects the operation.
async fn tool_action(
    State(state): State<AppState>,
    tool: ToolKind,
    body: Bytes,
) -> Result<Response, AppError> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("request body must be JSON: {err}")))?;
    let action = Action::from_envelope(tool, &body).inspect_err(|err| {
        warn!(%tool, error = %err, "Rejected tool request");
    })?;
    info!(%tool, action = action.name(), "Handling tool action");

    let result = match action {
        Action::GetSignedUrl {
            file_name,
            file_type,
        } => state
            .inner
            .uploads
            .signed_url(&file_name, &file_type)
            .await
            .map(|slot| Json(slot).into_response()),
        Action::Run { mode, payload } => {
            let mode = mode.unwrap_or_else(|| tool.default_mode());
            state
                .inner
                .compute
                .submit(tool, mode, &payload)
                .await
                .map(|body| Json(body).into_response())
        }
        Action::Status { job_id } => state
            .inner
            .compute
            .status(tool, &job_id)
            .await
            .map(|body| Json(body).into_response()),
    };

    result.map_err(|err| {
        error!(%tool, error = %err, "Tool action failed");
        AppError::from(err)
    })
}

async fn get_examples(State(state): State<AppState>) -> Result<Json<ExampleCatalog>, AppError> {
    let catalog = list_examples(state.examples_dir()).await.inspect_err(|err| {
        error!(error = %err, dir = %state.examples_dir().display(), "Error listing example files");
    })?;
    Ok(Json(catalog))
}

async fn livekit_token(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TokenResponse>, AppError> {
    let issuer = TokenIssuer::new(&state.config().livekit)?;
    let request: TokenRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TokenRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::BadRequest(format!("request body must be JSON: {err}")))?
    };
    Ok(Json(issuer.issue(&request)?))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Upstream { status: StatusCode, message: String },
    Internal { message: String, details: Option<String> },
}

impl AppError {
    fn internal(message: impl Into<String>) -> Self {
        AppError::Internal {
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Upstream { status, message } => (status, message, None),
            AppError::Internal { message, details } => {
                (StatusCode::INTERNAL_SERVER_ERROR, message, details)
            }
        };

        let body = Json(ErrorResponse { error, details });
        (status, body).into_response()
    }
}

impl From<ToolError> for AppError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidRequest(msg) => AppError::BadRequest(msg),
            ToolError::Upstream { status, message } => AppError::Upstream {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            },
            ToolError::Network(details) => AppError::Internal {
                message: "Internal Server Error".to_string(),
                details: Some(details),
            },
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<ExamplesError> for AppError {
    fn from(err: ExamplesError) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tempfile::tempdir;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::config::LivekitConfig;
    use crate::job::JobMode;
    use crate::upload::UploadSlot;

    #[derive(Default)]
    struct RecordingCompute {
        calls: Mutex<Vec<String>>,
        fail_with: Option<ToolError>,
    }

    #[async_trait]
    impl ComputeBackend for RecordingCompute {
        async fn submit(
            &self,
            tool: ToolKind,
            mode: JobMode,
            payload: &Value,
        ) -> crate::error::Result<Value> {
            self.calls
                .lock()
                .expect("lock")
                .push(format!("{tool}{}", mode.endpoint_suffix()));
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            Ok(json!({"id": "job-1", "status": "IN_QUEUE", "echo": payload}))
        }

        async fn status(&self, tool: ToolKind, job_id: &str) -> crate::error::Result<Value> {
            self.calls
                .lock()
                .expect("lock")
                .push(format!("{tool}/status/{job_id}"));
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            Ok(json!({"id": job_id, "status": "COMPLETED", "output": {"output_url": "https://x/y.jpg"}}))
        }
    }

    struct StaticUploads;

    #[async_trait]
    impl UploadBackend for StaticUploads {
        async fn signed_url(
            &self,
            file_name: &str,
            _mime_type: &str,
        ) -> crate::error::Result<UploadSlot> {
            Ok(UploadSlot {
                signed_url: format!("https://store/{file_name}?sig=1"),
                file_url: format!("https://store/{file_name}"),
            })
        }
    }

    fn test_state(compute: Arc<RecordingCompute>, examples_dir: PathBuf) -> AppState {
        AppState::with_backends(
            AppConfig::default(),
            compute,
            Arc::new(StaticUploads),
            examples_dir,
        )
    }

    fn test_router() -> (Router, Arc<RecordingCompute>) {
        let compute = Arc::new(RecordingCompute::default());
        let router = app_router(test_state(Arc::clone(&compute), std::env::temp_dir()));
        (router, compute)
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (mut app, _) = test_router();
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_tools_lists_catalog() {
        let (mut app, _) = test_router();
        let req = Request::builder()
            .uri("/api/tools")
            .body(Body::empty())
            .unwrap();

        let body = body_json(send_request(&mut app, req).await).await;
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|entry| entry["id"].as_str())
            .collect();
        assert_eq!(ids.len(), 6);
        assert!(ids.contains(&"magic-paint"));
        assert!(ids.contains(&"livekit-agent"));
    }

    #[tokio::test]
    async fn test_unknown_api_path_is_404() {
        let (mut app, _) = test_router();
        let req = post_json("/api/does-not-exist", json!({}));

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(resp).await["error"],
            "api endpoint not found: /api/does-not-exist"
        );
    }

    #[tokio::test]
    async fn test_invalid_action_is_400() {
        let (mut app, compute) = test_router();
        let req = post_json("/api/magic-paint", json!({"action": "delete"}));

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Invalid action: delete");
        assert!(compute.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_job_id_traversal_is_400_without_upstream_call() {
        let (mut app, compute) = test_router();
        let req = post_json(
            "/api/magic-paint",
            json!({"action": "runpod_status", "jobId": "../../other-endpoint/purge-queue?x=1"}),
        );

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp)
            .await["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid job ID"));
        assert!(compute.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_json_body_is_400() {
        let (mut app, _) = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/magic-paint")
            .body(Body::from("not json"))
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_signed_url_returns_camel_case_slot() {
        let (mut app, _) = test_router();
        let req = post_json(
            "/api/magic-paint",
            json!({"action": "getSignedUrl", "fileName": "input_1.jpg", "fileType": "image/jpeg"}),
        );

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["signedUrl"], "https://store/input_1.jpg?sig=1");
        assert_eq!(body["fileUrl"], "https://store/input_1.jpg");
    }

    #[tokio::test]
    async fn test_run_uses_tool_default_mode_when_endpoint_missing() {
        let (mut app, compute) = test_router();
        let req = post_json(
            "/api/clothes-swapper",
            json!({"payload": {"input": {"human_img": "aGk="}}}),
        );

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["echo"]["input"]["human_img"], "aGk=");

        let req = post_json(
            "/api/magic-paint",
            json!({"action": "runpod", "endpoint": "/run", "payload": {"input": {}}}),
        );
        send_request(&mut app, req).await;
        let req = post_json(
            "/api/magic-paint",
            json!({"action": "runpod_status", "endpoint": "/status/job-1"}),
        );
        let resp = send_request(&mut app, req).await;
        assert_eq!(body_json(resp).await["status"], "COMPLETED");

        assert_eq!(
            compute.calls.lock().unwrap().as_slice(),
            [
                "clothes-swapper/runsync",
                "magic-paint/run",
                "magic-paint/status/job-1"
            ]
        );
    }

    #[tokio::test]
    async fn test_upstream_status_is_relayed() {
        let compute = Arc::new(RecordingCompute {
            fail_with: Some(ToolError::upstream(404, "Runpod API Error: job not found")),
            ..Default::default()
        });
        let mut app = app_router(test_state(compute, std::env::temp_dir()));
        let req = post_json(
            "/api/pbr-map-generator",
            json!({"action": "runpod_status", "jobId": "nope"}),
        );

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "Runpod API Error: job not found");
    }

    #[tokio::test]
    async fn test_network_failure_reports_details() {
        let compute = Arc::new(RecordingCompute {
            fail_with: Some(ToolError::Network("connection refused".to_string())),
            ..Default::default()
        });
        let mut app = app_router(test_state(compute, std::env::temp_dir()));
        let req = post_json(
            "/api/image-composition",
            json!({"action": "runpod", "payload": {"input": {}}}),
        );

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Internal Server Error");
        assert_eq!(body["details"], "connection refused");
    }

    #[tokio::test]
    async fn test_missing_upstream_configuration_is_500_without_network() {
        let state = AppState::new(AppConfig::default(), std::env::temp_dir()).unwrap();
        let mut app = app_router(state);

        let req = post_json(
            "/api/magic-paint",
            json!({"action": "getSignedUrl", "fileName": "input_1.jpg", "fileType": "image/jpeg"}),
        );
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(resp).await["error"],
            "Resource API URL is not configured on the server."
        );

        let req = post_json(
            "/api/wall-painting-v2",
            json!({"action": "runpod_run", "data_from_frontend": {"img_url": "https://a/b.jpg"}}),
        );
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(resp).await["error"],
            "Wall Painting v2 endpoint is not configured on the server."
        );
    }

    #[tokio::test]
    async fn test_livekit_token_requires_credentials() {
        let (mut app, _) = test_router();
        let resp = send_request(&mut app, post_json("/api/livekit-token", json!({}))).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(resp).await["error"],
            "LiveKit server environment variables are not set up correctly"
        );
    }

    #[tokio::test]
    async fn test_livekit_token_issues_identity_and_token() {
        let mut config = AppConfig::default();
        config.livekit = LivekitConfig {
            api_key: Some("APIkey".to_string()),
            api_secret: Some("secret".to_string()),
            ws_url: None,
        };
        let state = AppState::with_backends(
            config,
            Arc::new(RecordingCompute::default()),
            Arc::new(StaticUploads),
            std::env::temp_dir(),
        );
        let mut app = app_router(state);

        let req = post_json("/api/livekit-token", json!({"participantId": "u-7"}));
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["identity"], "u-7");
        assert_eq!(body["accessToken"].as_str().unwrap().split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_list_examples_and_static_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("human")).unwrap();
        std::fs::create_dir_all(dir.path().join("garment")).unwrap();
        std::fs::write(dir.path().join("human/model_a.png"), b"png").unwrap();
        std::fs::write(dir.path().join("garment/blue_dress.jpg"), b"jpg").unwrap();

        let compute = Arc::new(RecordingCompute::default());
        let mut app = app_router(test_state(compute, dir.path().to_path_buf()));

        let req = Request::builder()
            .uri("/api/list-examples")
            .body(Body::empty())
            .unwrap();
        let body = body_json(send_request(&mut app, req).await).await;
        assert_eq!(body["humanExamples"][0]["path"], "/examples/human/model_a.png");
        assert_eq!(body["garmentExamples"][0]["description"], "blue dress");

        let req = Request::builder()
            .uri("/examples/garment/blue_dress.jpg")
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"jpg");
    }

    #[tokio::test]
    async fn test_list_examples_missing_directory_is_500() {
        let dir = tempdir().unwrap();
        let compute = Arc::new(RecordingCompute::default());
        let mut app = app_router(test_state(compute, dir.path().join("absent")));

        let req = Request::builder()
            .uri("/api/list-examples")
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let message = body_json(resp).await["error"].as_str().unwrap().to_string();
        assert!(message.contains("absent"));
    }
}
