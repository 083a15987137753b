//! GitHub implementation of [`ContentSource`].
//!
//! Listings go through the REST contents API
//! (`{api}/repos/{owner}/{repo}/contents/{path}?ref={branch}`), downloads
//! through the raw-content host (`{raw}/{owner}/{repo}/{branch}/{path}`).
//! Both roots come from configuration so a GitHub Enterprise instance or a
//! local mock can stand in for github.com.

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::Url;
use reqwest::header::ACCEPT;
use tracing::{debug, instrument, warn};

use super::{ContentSource, RepoCoordinate, ResolveError, filter_audio_listing};
use crate::config::UpstreamConfig;

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

// ---------------------------------------------------------------------------
// Backend struct
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitHubContent {
    http_client: reqwest::Client,
    api_url: Url,
    raw_url: Url,
}

impl GitHubContent {
    pub fn new(config: &UpstreamConfig, http_client: reqwest::Client) -> Result<Self> {
        Ok(Self {
            http_client,
            api_url: parse_base(&config.api_url).context("invalid upstream API url")?,
            raw_url: parse_base(&config.raw_url).context("invalid upstream raw-content url")?,
        })
    }

    /// `{api}/repos/{owner}/{repo}/contents/{path}?ref={branch}`
    pub fn listing_url(&self, coord: &RepoCoordinate) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["repos", coord.owner.as_str(), coord.repo.as_str(), "contents"])
                .extend(coord.relative_path().split('/'));
        }
        url.query_pairs_mut().append_pair("ref", &coord.branch);
        url
    }

    /// `{raw}/{owner}/{repo}/{branch}/{path}`
    pub fn raw_url(&self, coord: &RepoCoordinate) -> Url {
        let mut url = self.raw_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend([coord.owner.as_str(), coord.repo.as_str()])
                .extend(coord.branch.split('/'))
                .extend(coord.relative_path().split('/'));
        }
        url
    }
}

/// Parse a base URL and make sure path segments can be appended to it.
fn parse_base(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("cannot parse {raw:?}"))?;
    anyhow::ensure!(!url.cannot_be_a_base(), "{raw:?} cannot be used as a base url");
    Ok(url)
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ContentSource for GitHubContent {
    #[instrument(skip(self), fields(%coord))]
    async fn list_audio(&self, coord: &RepoCoordinate) -> Result<Vec<String>, ResolveError> {
        let url = self.listing_url(coord);
        debug!(%url, "listing remote directory");

        let resp = self
            .http_client
            .get(url)
            .header(ACCEPT, GITHUB_ACCEPT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(error = %e, "contents API request failed");
                ResolveError::NotFound(e.to_string())
            })?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ResolveError::NotFound(format!("unreadable contents API response: {e}")))?;

        filter_audio_listing(&body)
            .ok_or_else(|| ResolveError::InvalidPath("Path is not a directory".to_string()))
    }

    #[instrument(skip(self), fields(%coord))]
    async fn fetch_audio(&self, coord: &RepoCoordinate) -> Result<Bytes, ResolveError> {
        let url = self.raw_url(coord);
        debug!(%url, "fetching raw content");

        let resp = self
            .http_client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(error = %e, "raw content request failed");
                ResolveError::NotFound(format!("Audio file not found: {e}"))
            })?;

        resp.bytes()
            .await
            .map_err(|e| ResolveError::NotFound(format!("Audio file not found: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
