//! Audio file proxy handler.
//!
//! Serves `/audio/{owner}/{repo}/{branch}/{*file_path}` from the local cache,
//! filling it from the raw-content host on a miss.  The cache key is the base
//! name of `file_path`; fills are single-flighted per key so concurrent
//! misses for one file make one upstream call.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

use super::handler::AppError;
use crate::AppState;
use crate::content::RepoCoordinate;
use crate::metrics::Endpoint;

#[derive(Debug, Default, Deserialize)]
pub struct AudioQuery {
    /// Re-download even when a blob with this name is already cached.
    #[serde(default)]
    pub refresh: bool,
}

/// Handle an audio request.
///
/// 1. Derive the cache key from the base name of `file_path`.
/// 2. Under the key lock, fetch and store the file unless it is cached.
/// 3. Stream the cached file back to the client.
///
/// Every failure is reported as a 500 with a JSON `error` body.
#[instrument(skip(state, query), fields(%owner, %repo, %branch, %file_path))]
pub async fn handle_audio(
    State(state): State<Arc<AppState>>,
    AxumPath((owner, repo, branch, file_path)): AxumPath<(String, String, String, String)>,
    Query(query): Query<AudioQuery>,
) -> Result<Response, AppError> {
    let coord = RepoCoordinate::new(owner, repo, branch, file_path);
    let file_name = coord
        .base_name()
        .ok_or_else(|| anyhow!("no file name in path {:?}", coord.path))?
        .to_string();
    let local_path = state
        .cache
        .path_for(&file_name)
        .context("cannot cache this file name")?;

    ensure_cached(&state, &coord, &file_name, query.refresh).await?;
    serve_local_file(&local_path).await
}

/// `GET /audio/{owner}/{repo}/{branch}[/]`: there is no file to serve.
pub async fn handle_audio_without_file(
    AxumPath((owner, repo, branch)): AxumPath<(String, String, String)>,
) -> AppError {
    AppError::Internal(anyhow!("no file name in path for {owner}/{repo}@{branch}"))
}

/// Make sure `file_name` is present in the cache, fetching `coord` if not.
async fn ensure_cached(
    state: &AppState,
    coord: &RepoCoordinate,
    file_name: &str,
    refresh: bool,
) -> anyhow::Result<()> {
    let _fill = state.fills.lock(file_name).await;
    let metrics = &state.metrics.metrics;

    if !refresh && state.cache.has(file_name).await {
        debug!(%file_name, "audio cache hit");
        metrics.cache_hits.inc();
        return Ok(());
    }

    info!(%file_name, refresh, "audio cache miss, fetching from upstream");
    metrics.cache_misses.inc();

    let fetched = state.content.fetch_audio(coord).await;
    metrics.record_upstream(Endpoint::Raw, fetched.is_ok());
    let data = fetched?;

    state.cache.write(file_name, &data).await?;
    metrics.cache_bytes_written.inc_by(data.len() as u64);
    Ok(())
}

/// Stream a cached audio file from local disk.
async fn serve_local_file(path: &Path) -> Result<Response, AppError> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open cached audio: {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("stat cached audio: {}", path.display()))?
        .len();

    let body = Body::from_stream(ReaderStream::new(file));
    let content_type = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(content_type_for_name)
        .unwrap_or("application/octet-stream");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        body,
    )
        .into_response())
}

/// Map an audio file name to an appropriate Content-Type.
fn content_type_for_name(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_mapping() {
        assert_eq!(content_type_for_name("a.mp3"), "audio/mpeg");
        assert_eq!(content_type_for_name("B.WAV"), "audio/wav");
        assert_eq!(content_type_for_name("c.ogg"), "audio/ogg");
        assert_eq!(content_type_for_name("d.Flac"), "audio/flac");
        assert_eq!(content_type_for_name("e.m4a"), "audio/mp4");
        assert_eq!(content_type_for_name("notes.txt"), "application/octet-stream");
        assert_eq!(content_type_for_name("README"), "application/octet-stream");
    }

    #[test]
    fn refresh_defaults_to_false() {
        let q: AudioQuery = serde_json::from_str("{}").unwrap();
        assert!(!q.refresh);
    }
}
