//! HTTP server implementation using Axum.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::OrchestratorError;
use crate::orchestrator::{Execution, ExecutionResult};
use crate::registry::SessionView;
use crate::relay::{StreamEvent, StreamRelay};
use crate::state::AppState;

const SESSION_EXPIRED: &str = "Session expired. Please start a new session.";

// Request/Response types
#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct SessionInfo {
    id: String,
    cwd: String,
    age_secs: u64,
    idle_secs: u64,
}

impl SessionInfo {
    fn from_view(view: SessionView, now: Instant) -> Self {
        Self {
            age_secs: now.duration_since(view.created_at).as_secs(),
            idle_secs: now.duration_since(view.last_activity_at).as_secs(),
            id: view.id,
            cwd: view.working_directory,
        }
    }
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
struct ExecResponse {
    output: String,
    error: String,
    exit_code: Option<i32>,
    timed_out: bool,
    cwd: String,
}

impl From<Execution> for ExecResponse {
    fn from(execution: Execution) -> Self {
        let (output, error, exit_code) = match execution.result {
            ExecutionResult::Output(out) => (out.stdout, out.stderr, out.exit_code),
            ExecutionResult::Navigated => (String::new(), String::new(), Some(0)),
            ExecutionResult::NavigationFailed { message } => (String::new(), message, Some(1)),
        };
        Self {
            output,
            error,
            exit_code,
            timed_out: false,
            cwd: execution.working_directory,
        }
    }
}

#[derive(Deserialize)]
struct CompleteRequest {
    partial: String,
}

#[derive(Serialize)]
struct CompleteResponse {
    candidates: Vec<String>,
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Serialize, Deserialize)]
struct FileBody {
    path: String,
    /// Base64-encoded file content.
    content: String,
}

/// Error rendered as `{"error": ...}` with a status matching its kind.
#[derive(Debug)]
enum ApiError {
    Orchestrator(OrchestratorError),
    BadRequest(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::Orchestrator(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Orchestrator(err) => match err {
                OrchestratorError::SessionNotFound(_) => (StatusCode::NOT_FOUND, SESSION_EXPIRED.to_string()),
                OrchestratorError::InvalidRequest(message) => (StatusCode::BAD_REQUEST, message),
                OrchestratorError::AtCapacity(_) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
                OrchestratorError::Timeout { limit, .. } => (StatusCode::GATEWAY_TIMEOUT, timeout_message(limit)),
                OrchestratorError::Runtime(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            },
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn timeout_message(limit: std::time::Duration) -> String {
    format!("Timeout: Execution exceeded {} seconds.", limit.as_secs())
}

fn require_command(command: &str) -> Result<(), ApiError> {
    if command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }
    Ok(())
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Build the application router.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/exec", post(exec))
        .route("/sessions/:id/detach", post(detach))
        .route("/sessions/:id/stream", get(stream))
        .route("/sessions/:id/complete", post(complete))
        .route("/sessions/:id/files", get(read_file).put(write_file))
        .layer(cors_layer(config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until Ctrl-C.
pub async fn run_server(config: &ServerConfig, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, router(state, config))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(State(state): State<AppState>) -> Result<Json<CreateSessionResponse>, ApiError> {
    let session = state.orchestrator.create_session().await?;
    Ok(Json(CreateSessionResponse { session_id: session.id }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let now = Instant::now();
    let list = state
        .orchestrator
        .sessions()
        .into_iter()
        .map(|view| SessionInfo::from_view(view, now))
        .collect();
    Json(list)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let view = state.orchestrator.session(&id)?;
    Ok(Json(SessionInfo::from_view(view, Instant::now())))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.terminate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    require_command(&req.command)?;
    match state.orchestrator.execute(&id, &req.command).await {
        Ok(execution) => Ok(Json(execution.into())),
        Err(OrchestratorError::Timeout { limit, output }) => {
            let cwd = state.orchestrator.session(&id)?.working_directory;
            let error = match output.stderr.trim_end() {
                "" => timeout_message(limit),
                stderr => format!("{stderr}\n{}", timeout_message(limit)),
            };
            Ok(Json(ExecResponse {
                output: output.stdout,
                error,
                exit_code: None,
                timed_out: true,
                cwd,
            }))
        }
        Err(e) => Err(e.into()),
    }
}

async fn detach(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<StatusCode, ApiError> {
    require_command(&req.command)?;
    state.orchestrator.execute_detached(&id, &req.command)?;
    Ok(StatusCode::ACCEPTED)
}

fn sse_event(event: StreamEvent) -> Event {
    let (name, payload) = match event {
        StreamEvent::Data { stream, text } => {
            let name = match stream {
                crate::runtime::OutputStream::Stdout => "stdout",
                crate::runtime::OutputStream::Stderr => "stderr",
            };
            (name, json!({ "data": text }))
        }
        StreamEvent::Closed { exit_code } => ("close", json!({ "exit_code": exit_code })),
    };
    Event::default().event(name).data(payload.to_string())
}

async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(req): Query<CommandRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require_command(&req.command)?;
    let process = state.orchestrator.open_stream(&id, &req.command).await?;
    let events = StreamRelay::new(id, process).map(|event| Ok(sse_event(event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let candidates = state.orchestrator.complete(&id, &req.partial).await?;
    Ok(Json(CompleteResponse { candidates }))
}

async fn write_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FileBody>,
) -> Result<StatusCode, ApiError> {
    let content = BASE64
        .decode(req.content.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("content is not valid base64: {e}")))?;
    state
        .orchestrator
        .write_file(&id, &req.path, &content)
        .await?
        .map_err(ApiError::BadRequest)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(req): Query<PathQuery>,
) -> Result<Json<FileBody>, ApiError> {
    let content = state
        .orchestrator
        .read_file(&id, &req.path)
        .await?
        .map_err(ApiError::BadRequest)?;
    Ok(Json(FileBody {
        path: req.path,
        content: BASE64.encode(content),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, SessionConfig};
    use crate::orchestrator::Orchestrator;
    use crate::runtime::{CommandOutput, EnvironmentSpec, HostRuntime};
    use serde_json::Value;
    use std::sync::Arc;

    struct TestServer {
        base: String,
        client: reqwest::Client,
        _root: tempfile::TempDir,
    }

    impl TestServer {
        async fn start(timeout_secs: u64) -> Self {
            let root = tempfile::tempdir().unwrap();
            let sessions = SessionConfig {
                max_sessions: 4,
                command_timeout_secs: timeout_secs,
                ..SessionConfig::default()
            };
            let runtime = Arc::new(HostRuntime::new(root.path(), 64 * 1024));
            let spec = EnvironmentSpec::from_config(&RuntimeConfig::default());
            let orchestrator = Arc::new(Orchestrator::new(runtime, spec, &sessions));
            let config = ServerConfig {
                allowed_origins: vec!["*".to_string()],
                ..ServerConfig::default()
            };
            let app = router(AppState::new(orchestrator), &config);

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, app).await });
            Self {
                base: format!("http://{addr}"),
                client: reqwest::Client::new(),
                _root: root,
            }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        async fn session(&self) -> String {
            let body: Value = self
                .client
                .post(self.url("/sessions"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            body["session_id"].as_str().unwrap().to_string()
        }

        async fn exec(&self, id: &str, command: &str) -> (StatusCode, Value) {
            let response = self
                .client
                .post(self.url(&format!("/sessions/{id}/exec")))
                .json(&json!({ "command": command }))
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
            (status, response.json().await.unwrap())
        }
    }

    #[test]
    fn navigation_failure_reports_exit_status_one() {
        let execution = Execution {
            working_directory: "/home".to_string(),
            result: ExecutionResult::NavigationFailed {
                message: "cd: nope: No such file or directory".to_string(),
            },
        };
        assert_eq!(
            ExecResponse::from(execution),
            ExecResponse {
                output: String::new(),
                error: "cd: nope: No such file or directory".to_string(),
                exit_code: Some(1),
                timed_out: false,
                cwd: "/home".to_string(),
            }
        );
    }

    #[test]
    fn errors_map_to_statuses() {
        let status = |err: OrchestratorError| ApiError::from(err).into_response().status();
        assert_eq!(status(OrchestratorError::SessionNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(OrchestratorError::AtCapacity(2)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(OrchestratorError::InvalidRequest("big".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(OrchestratorError::Timeout {
                limit: std::time::Duration::from_secs(5),
                output: CommandOutput::default(),
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn health_check() {
        let server = TestServer::start(5).await;
        let body = reqwest::get(server.url("/health")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn exec_keeps_directory_between_requests() {
        let server = TestServer::start(5).await;
        let id = server.session().await;

        let (status, body) = server.exec(&id, "mkdir -p tmp && echo made").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "made\n");
        assert_eq!(body["exit_code"], 0);

        let (_, body) = server.exec(&id, "cd tmp").await;
        assert_eq!(body["exit_code"], 0);
        assert!(body["cwd"].as_str().unwrap().ends_with("/tmp"));

        let (_, body) = server.exec(&id, "pwd").await;
        assert_eq!(body["output"].as_str().unwrap().trim(), body["cwd"].as_str().unwrap());

        let (_, body) = server.exec(&id, "cd missing").await;
        assert_eq!(body["exit_code"], 1);
        assert!(!body["error"].as_str().unwrap().is_empty());
        assert!(body["cwd"].as_str().unwrap().ends_with("/tmp"));
    }

    #[tokio::test]
    async fn exec_reports_timeout_with_partial_output() {
        let server = TestServer::start(1).await;
        let id = server.session().await;
        let (status, body) = server.exec(&id, "echo started; sleep 30").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["timed_out"], true);
        assert_eq!(body["output"], "started\n");
        assert_eq!(body["error"], "Timeout: Execution exceeded 1 seconds.");

        let (_, body) = server.exec(&id, "echo partial; echo warming up >&2; sleep 30").await;
        assert_eq!(body["timed_out"], true);
        assert_eq!(body["output"], "partial\n");
        assert_eq!(body["error"], "warming up\nTimeout: Execution exceeded 1 seconds.");
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let server = TestServer::start(5).await;
        let id = server.session().await;
        let (status, _) = server.exec(&id, "   ").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deleted_session_reads_as_expired() {
        let server = TestServer::start(5).await;
        let id = server.session().await;

        let listed: Value = reqwest::get(server.url("/sessions")).await.unwrap().json().await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let response = server
            .client
            .delete(server.url(&format!("/sessions/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 204);

        let (status, body) = server.exec(&id, "ls").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], SESSION_EXPIRED);

        let response = server
            .client
            .delete(server.url(&format!("/sessions/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn stream_delivers_frames_then_close() {
        let server = TestServer::start(5).await;
        let id = server.session().await;
        let response = server
            .client
            .get(server.url(&format!("/sessions/{id}/stream")))
            .query(&[("command", "for i in 0 1 2; do echo Frame $i; done")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.text().await.unwrap();

        let frames: String = body
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter_map(|data| serde_json::from_str::<Value>(data).ok())
            .filter_map(|value| value["data"].as_str().map(String::from))
            .collect();
        assert_eq!(frames, "Frame 0\nFrame 1\nFrame 2\n");
        assert_eq!(body.matches("event: close").count(), 1);
        assert!(body.contains(r#"{"exit_code":0}"#));
    }

    #[tokio::test]
    async fn detach_returns_immediately() {
        let server = TestServer::start(5).await;
        let id = server.session().await;
        let started = std::time::Instant::now();
        let response = server
            .client
            .post(server.url(&format!("/sessions/{id}/detach")))
            .json(&json!({ "command": "sleep 3" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 202);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn files_and_completion() {
        let server = TestServer::start(5).await;
        let id = server.session().await;
        let response = server
            .client
            .put(server.url(&format!("/sessions/{id}/files")))
            .json(&json!({ "path": "notes.txt", "content": BASE64.encode("hello\n") }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 204);

        let body: Value = server
            .client
            .get(server.url(&format!("/sessions/{id}/files")))
            .query(&[("path", "notes.txt")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(BASE64.decode(body["content"].as_str().unwrap()).unwrap(), b"hello\n");

        let body: Value = server
            .client
            .post(server.url(&format!("/sessions/{id}/complete")))
            .json(&json!({ "partial": "no" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["candidates"], json!(["notes.txt"]));
    }
}
