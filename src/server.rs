//! HTTP adapter over the pipeline.
//!
//! A thin JSON API: one pipeline run per `POST /query`, answered with the
//! run's terminal event. A client that disconnects mid-run drops the run
//! future, which cancels it.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Run the pipeline, return the terminal event |
//! | `GET`  | `/schema` | The loaded schema descriptor |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Request errors use one body shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! A run that fails is *not* an HTTP error: it is a `200` carrying
//! `{"status": "error", "error": "..."}`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::pipeline::{Pipeline, TerminalEvent};
use crate::schema::SchemaDescriptor;

type AppState = Arc<Pipeline>;

/// Build the router for `pipeline`.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/schema", get(handle_schema))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(pipeline)
}

/// Bind `bind_addr` and serve until Ctrl-C.
pub async fn run_server(pipeline: Arc<Pipeline>, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    println!("Query server listening on http://{}", listener.local_addr()?);

    serve(listener, pipeline, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Serve on an already-bound listener until `shutdown` completes.
pub async fn serve<F>(listener: TcpListener, pipeline: Arc<Pipeline>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("query server stopped");
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

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Serialize)]
struct QueryResponse {
    #[serde(flatten)]
    event: TerminalEvent,
    run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
}

async fn handle_query(
    State(pipeline): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let report = pipeline.run(&req.query).await;
    Ok(Json(QueryResponse {
        event: report.event(),
        run_id: report.run_id.to_string(),
        conversation_id: req.conversation_id,
    }))
}

// ============ GET /schema, GET /health ============

async fn handle_schema(State(pipeline): State<AppState>) -> Json<SchemaDescriptor> {
    Json(pipeline.schema().clone())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
