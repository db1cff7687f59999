//! HTTP surface for webhook intake and synchronous analysis.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/analyze` | Parse + classify + analyze a raw log body synchronously; no persistence |
//! | `POST` | `/webhook` | Terminal-state run event: upsert repository + run, enqueue a job |
//! | `GET`  | `/stats` | Embedding coverage and queue counts |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "log body is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the dashboard frontend
//! calls these endpoints cross-origin.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::analyzer;
use crate::config::Config;
use crate::models::{DetectedError, LogStep, Repository, RunStatus};
use crate::pipeline;
use crate::queue::{self, LogProcessingJob, LOG_PROCESSING};
use crate::store;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    config: Arc<Config>,
}

/// Start the HTTP server on `[server].bind`; runs until terminated.
pub async fn run_server(pool: SqlitePool, config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/analyze", post(handle_analyze))
        .route("/webhook", post(handle_webhook))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("triage server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ POST /analyze ============

/// Synchronous analysis response; persistence is short-circuited.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    detected_errors: Vec<DetectedError>,
    steps: Vec<LogStep>,
    root_cause: String,
    failure_stage: String,
    suggested_fix: String,
    failure_type: String,
    priority: i64,
    confidence: f64,
    used_llm: bool,
}

async fn handle_analyze(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<AnalyzeResponse>, AppError> {
    if body.trim().is_empty() {
        return Err(bad_request("log body is empty"));
    }

    // Ephemeral run id: parsed chunks never touch the chunks table.
    let run_id = Uuid::new_v4().to_string();
    let parsed = pipeline::parse_log(&state.config, &run_id, &body)
        .map_err(|e| bad_request(e.to_string()))?;

    let verdict =
        analyzer::analyze(&state.pool, &state.config, &parsed.chunks, &parsed.errors).await;

    Ok(Json(AnalyzeResponse {
        detected_errors: parsed.errors,
        steps: parsed.steps,
        root_cause: verdict.narrative.root_cause,
        failure_stage: verdict.narrative.failure_stage,
        suggested_fix: verdict.narrative.suggested_fix,
        failure_type: verdict.failure_type,
        priority: verdict.priority,
        confidence: verdict.confidence,
        used_llm: verdict.used_llm,
    }))
}

// ============ POST /webhook ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEvent {
    repository: WebhookRepository,
    workflow_run: WebhookRun,
    #[serde(default)]
    installation_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRepository {
    id: i64,
    owner: String,
    name: String,
    #[serde(default)]
    private: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRun {
    id: i64,
    name: String,
    /// Terminal conclusion: `success`, `failure`, `cancelled`, ...
    /// Absent while the run is still in progress.
    conclusion: Option<String>,
    #[serde(default)]
    trigger: Option<String>,
    #[serde(default)]
    commit_sha: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    accepted: bool,
    job_id: Option<String>,
}

async fn handle_webhook(
    State(state): State<AppState>,
    Json(event): Json<WebhookEvent>,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let Some(status) = event
        .workflow_run
        .conclusion
        .as_deref()
        .and_then(RunStatus::parse)
    else {
        // Not terminal yet (or an unknown conclusion): acknowledged, ignored.
        return Ok((
            StatusCode::OK,
            Json(WebhookResponse {
                accepted: false,
                job_id: None,
            }),
        ));
    };

    let repo = Repository {
        id: Uuid::new_v4().to_string(),
        provider_id: event.repository.id,
        owner: event.repository.owner.clone(),
        name: event.repository.name.clone(),
        private: event.repository.private,
        user_id: None,
    };
    let repo_id = store::upsert_repository(&state.pool, &repo)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let mut run = store::new_run(
        event.workflow_run.id,
        &repo_id,
        &event.workflow_run.name,
        status,
        chrono::Utc::now().timestamp(),
    );
    run.trigger = event.workflow_run.trigger.clone();
    run.commit_sha = event.workflow_run.commit_sha.clone();
    run.branch = event.workflow_run.branch.clone();
    run.actor = event.workflow_run.actor.clone();
    run.provider_url = event.workflow_run.url.clone();
    store::upsert_run(&state.pool, &run)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let payload = LogProcessingJob {
        repo_full_name: repo.full_name(),
        run_id: event.workflow_run.id,
        installation_id: event.installation_id,
    };
    let payload_json = serde_json::to_string(&payload).map_err(|e| internal(e.to_string()))?;

    let job_id = queue::enqueue(
        &state.pool,
        LOG_PROCESSING,
        LOG_PROCESSING,
        &payload_json,
        chrono::Utc::now().timestamp(),
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            accepted: true,
            job_id: Some(job_id),
        }),
    ))
}

// ============ GET /stats ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    embeddings: crate::models::EmbeddingStats,
    jobs: Vec<JobCount>,
}

#[derive(Serialize)]
struct JobCount {
    status: String,
    count: i64,
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let embeddings = store::embedding_stats(&state.pool)
        .await
        .map_err(|e| internal(e.to_string()))?;
    let jobs = queue::counts(&state.pool, LOG_PROCESSING)
        .await
        .map_err(|e| internal(e.to_string()))?
        .into_iter()
        .map(|(status, count)| JobCount { status, count })
        .collect();

    Ok(Json(StatsResponse { embeddings, jobs }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
