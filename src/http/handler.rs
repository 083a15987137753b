//! Main axum router and the listing/metrics handlers.
//!
//! Routes:
//! - `GET /health`                                      - Liveness probe
//! - `GET /audio/{owner}/{repo}/{branch}/{*file_path}`  - Cached audio file
//! - `GET /list-audio/{owner}/{repo}/{branch}[/{*path}]` - Audio files in a directory
//! - `GET /metrics`                                     - Prometheus metrics

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::AppState;
use crate::content::{RepoCoordinate, ResolveError};
use crate::metrics::Endpoint;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::health::health_handler))
        .route(
            "/audio/{owner}/{repo}/{branch}/{*file_path}",
            get(super::audio::handle_audio),
        )
        // An empty file path still answers with the `/audio` error contract.
        .route(
            "/audio/{owner}/{repo}/{branch}",
            get(super::audio::handle_audio_without_file),
        )
        .route(
            "/audio/{owner}/{repo}/{branch}/",
            get(super::audio::handle_audio_without_file),
        )
        // Root listings: with and without the trailing slash.
        .route("/list-audio/{owner}/{repo}/{branch}", get(handle_list_root))
        .route("/list-audio/{owner}/{repo}/{branch}/", get(handle_list_root))
        .route("/list-audio/{owner}/{repo}/{branch}/{*path}", get(handle_list))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioListResponse {
    pub audio_files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /list-audio/{owner}/{repo}/{branch}/{*path}`
async fn handle_list(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, branch, path)): Path<(String, String, String, String)>,
) -> Result<Json<AudioListResponse>, AppError> {
    list_audio(&state, RepoCoordinate::new(owner, repo, branch, path)).await
}

/// `GET /list-audio/{owner}/{repo}/{branch}`: the repository root.
async fn handle_list_root(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, branch)): Path<(String, String, String)>,
) -> Result<Json<AudioListResponse>, AppError> {
    list_audio(&state, RepoCoordinate::new(owner, repo, branch, "")).await
}

#[instrument(skip(state), fields(%coord))]
async fn list_audio(
    state: &AppState,
    coord: RepoCoordinate,
) -> Result<Json<AudioListResponse>, AppError> {
    let result = state.content.list_audio(&coord).await;
    state.metrics.metrics.record_upstream(
        Endpoint::Contents,
        !matches!(result, Err(ResolveError::NotFound(_))),
    );

    let audio_files = result?;
    info!(count = audio_files.len(), "listed audio files");
    Ok(Json(AudioListResponse { audio_files }))
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps to a status code and a
/// `{"error": message}` JSON body.
#[derive(Debug)]
pub enum AppError {
    /// The listing target is not a directory.
    BadRequest(String),
    /// The remote lookup failed.
    NotFound(String),
    /// Anything else: fetch, cache, or encoding failures.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => {
                warn!(error = %msg, "bad request");
                (StatusCode::BAD_REQUEST, msg)
            }
            AppError::NotFound(msg) => {
                warn!(error = %msg, "not found");
                (StatusCode::NOT_FOUND, msg)
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidPath(msg) => AppError::BadRequest(msg),
            ResolveError::NotFound(msg) => AppError::NotFound(msg),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_errors_map_to_listing_statuses() {
        let bad = AppError::from(ResolveError::InvalidPath("Path is not a directory".into()));
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let missing = AppError::from(ResolveError::NotFound("404".into()));
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn internal_error_is_500_json() {
        let resp = AppError::Internal(anyhow::anyhow!("disk full")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
