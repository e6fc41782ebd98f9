//! HTTP and WebSocket API

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use flowscout_common::{AnalysisParams, Error};

use crate::error::{HintError, JobError};
use crate::orchestrator::Orchestrator;

/// Error body returned by every failing handler
#[derive(Debug)]
pub enum ApiError {
    Job(JobError),
    Hint(HintError),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        ApiError::Job(e)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Job(JobError::Common(e))
    }
}

impl From<HintError> for ApiError {
    fn from(e: HintError) -> Self {
        ApiError::Hint(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Job(JobError::Common(Error::NotFound { .. })) => StatusCode::NOT_FOUND,
            ApiError::Job(JobError::Common(Error::InvalidConfig(_))) => StatusCode::BAD_REQUEST,
            ApiError::Job(JobError::Common(Error::InvalidStateTransition { .. }))
            | ApiError::Job(JobError::NoCheckpoint(_)) => StatusCode::CONFLICT,
            ApiError::Job(JobError::ShutdownAbort) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Job(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Hint(HintError::TooSoon { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Hint(HintError::Closed) => StatusCode::CONFLICT,
            ApiError::Hint(HintError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Job(e) => e.to_string(),
            ApiError::Hint(e) => e.to_string(),
        };
        if status.is_server_error() {
            error!("API error: {}", message);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct HintRequest {
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunPlanRequest {
    #[serde(default)]
    pub flows_only: bool,
}

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/jobs/:id/live", get(live_job_handler))
        .route("/api/jobs/:id/flows", get(list_flows_handler))
        .route("/api/jobs/:id/steps", get(list_steps_handler))
        .route("/api/jobs/:id/events", get(events_handler))
        .route("/api/jobs/:id/resume", post(resume_handler))
        .route("/api/jobs/:id/hint", post(hint_handler))
        .route("/api/analyses", post(submit_analysis_handler))
        .route("/api/analyses/batch", post(submit_batch_handler))
        .route("/api/test-plans/:id", get(get_test_plan_handler))
        .route("/api/test-plans/:id/run", post(run_test_plan_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn health_handler(State(orch): State<Orchestrator>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "flowscoutd",
        "version": env!("CARGO_PKG_VERSION"),
        "running_jobs": orch.running().len(),
    }))
}

// ============================================================================
// Jobs
// ============================================================================

async fn list_jobs_handler(State(orch): State<Orchestrator>) -> ApiResult<impl IntoResponse> {
    Ok(Json(orch.state().list_jobs()?))
}

async fn get_job_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(orch.state().get_job(&id)?))
}

async fn live_job_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    orch.live(&id)
        .map(Json)
        .ok_or_else(|| ApiError::from(Error::not_found("running_job", id)))
}

async fn list_flows_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let state = orch.state();
    state.get_job(&id)?;
    let flows: Vec<_> = state
        .list_flows(&id)?
        .into_iter()
        .map(|(name, content)| {
            let path = state.flow_path(&id, &name);
            json!({ "name": name, "path": path, "content": content })
        })
        .collect();
    Ok(Json(flows))
}

async fn list_steps_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    orch.state().get_job(&id)?;
    Ok(Json(orch.state().list_steps(&id)?))
}

async fn resume_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = orch.resume(&id)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn hint_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
    Json(req): Json<HintRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(Error::InvalidConfig("hint message is empty".to_string()).into());
    }
    orch.state().get_job(&id)?;
    orch.send_hint(&id, message).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": id, "delivered": true }))))
}

// ============================================================================
// Submission
// ============================================================================

async fn submit_analysis_handler(
    State(orch): State<Orchestrator>,
    Json(params): Json<AnalysisParams>,
) -> ApiResult<impl IntoResponse> {
    let job = orch.submit_analysis(params)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn submit_batch_handler(
    State(orch): State<Orchestrator>,
    Json(params): Json<AnalysisParams>,
) -> ApiResult<impl IntoResponse> {
    let job = orch.submit_batch(params)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_test_plan_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(orch.state().get_test_plan(&id)?))
}

async fn run_test_plan_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
    Json(req): Json<RunPlanRequest>,
) -> ApiResult<impl IntoResponse> {
    let job = orch.submit_test_run(&id, req.flows_only)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

// ============================================================================
// Live events
// ============================================================================

async fn events_handler(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    orch.state().get_job(&id)?;
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = stream_job_events(socket, orch, id).await {
            debug!("Event stream closed: {}", e);
        }
    }))
}

/// Send a snapshot of the job, then its live events until it finishes or
/// the client goes away.
///
/// The subscription is taken before the snapshot is read so no event
/// between the two is lost.
async fn stream_job_events(mut socket: WebSocket, orch: Orchestrator, job_id: String) -> anyhow::Result<()> {
    let mut rx = orch.subscribe();
    let job = orch.state().get_job(&job_id)?;
    let finished = job.status.state.is_terminal() && orch.live(&job_id).is_none();
    let snapshot = json!({
        "type": "snapshot",
        "job": job,
        "live": orch.live(&job_id),
    });
    socket.send(Message::Text(snapshot.to_string())).await?;
    if finished {
        socket.close().await?;
        return Ok(());
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) if message.job_id == job_id => {
                    let terminal = message.event.is_terminal();
                    socket.send(Message::Text(serde_json::to_string(&message)?)).await?;
                    if terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event stream for {} skipped {} message(s)", job_id, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return Ok(()),
                Some(Ok(_)) => {}
            },
        }
    }
    socket.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::orchestrator::BrowserFactory;
    use crate::state::StateManager;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use flowscout_common::testing::{FakeBrowser, ScriptedModel};
    use flowscout_common::{Browser, Database};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct FakeLauncher;

    #[async_trait]
    impl BrowserFactory for FakeLauncher {
        async fn launch(&self) -> flowscout_common::Result<Arc<dyn Browser>> {
            Ok(Arc::new(FakeBrowser::default()))
        }
    }

    fn app(dir: &TempDir) -> (Router, Orchestrator) {
        let mut config = DaemonConfig::default();
        config.store_path = dir.path().join("store");
        config.scout.binary = dir.path().join("missing-scout").to_string_lossy().to_string();
        let state = StateManager::with_database(Database::open_memory().unwrap(), config.flows_dir());
        let orch = Orchestrator::new(config, state, Arc::new(FakeLauncher), Arc::new(ScriptedModel::new()));
        (router(orch.clone()), orch)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir);
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_and_fetch_job() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir);
        let (status, job) = call(
            &app,
            "POST",
            "/api/analyses",
            Some(json!({"url": "https://app.test"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = job["meta"]["id"].as_str().unwrap().to_string();

        let (status, fetched) = call(&app, "GET", &format!("/api/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["meta"]["id"], id.as_str());

        let (status, jobs) = call(&app, "GET", "/api/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs.as_array().unwrap().len(), 1);

        let (status, flows) = call(&app, "GET", &format!("/api/jobs/{}/flows", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(flows.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir);

        let (status, body) = call(&app, "POST", "/api/analyses", Some(json!({"url": "ftp://x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("http"));

        let (status, _) = call(
            &app,
            "POST",
            "/api/analyses/batch",
            Some(json!({"url": "https://app.test"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/jobs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/jobs/nope/live", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/api/jobs/nope/resume", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/test-plans/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/api/test-plans/nope/run", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resume_and_hint_conflicts() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir);
        let (_, job) = call(&app, "POST", "/api/analyses", Some(json!({"url": "https://app.test"}))).await;
        let id = job["meta"]["id"].as_str().unwrap().to_string();

        // Whatever state the job is in, it has no checkpoint
        let (status, _) = call(&app, "POST", &format!("/api/jobs/{}/resume", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/jobs/{}/hint", id),
            Some(json!({"message": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/api/jobs/nope/hint",
            Some(json!({"message": "try the menu"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::from(JobError::NoCheckpoint("j".into())), StatusCode::CONFLICT),
            (ApiError::from(JobError::ShutdownAbort), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::from(JobError::Panic("x".into())), StatusCode::INTERNAL_SERVER_ERROR),
            (ApiError::from(HintError::Closed), StatusCode::CONFLICT),
            (
                ApiError::from(HintError::TooSoon {
                    interval_ms: 1000,
                    retry_after_ms: 200,
                }),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ApiError::from(Error::InvalidStateTransition {
                    from: "running".into(),
                    to: "resuming".into(),
                }),
                StatusCode::CONFLICT,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected);
        }
    }
}
