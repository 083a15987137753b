//! Typed client for the proxy's own HTTP API.
//!
//! Used by the CLI front-end: it talks only to the local proxy, never to
//! GitHub directly.  Path segments are percent-encoded individually so names
//! containing spaces, `#` or `?` survive the round trip.

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use reqwest::Url;
use tracing::debug;

use crate::content::RepoCoordinate;
use crate::http::{AudioListResponse, ErrorBody};

#[derive(Debug, Clone)]
pub struct ProxyClient {
    http_client: reqwest::Client,
    base_url: Url,
}

impl ProxyClient {
    /// `base_url` is the proxy root, e.g. `http://127.0.0.1:8000`.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid proxy base URL {base_url:?}"))?;
        if base_url.cannot_be_a_base() {
            bail!("proxy base URL {base_url} cannot carry a path");
        }
        let http_client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("failed to build proxy client")?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// `GET /list-audio/{owner}/{repo}/{branch}/{path}`
    pub async fn list_audio(&self, coord: &RepoCoordinate) -> Result<Vec<String>> {
        let url = self.route_url("list-audio", coord)?;
        debug!(%url, "listing audio via proxy");
        let resp = self
            .http_client
            .get(url)
            .send()
            .await
            .context("proxy request failed")?;
        let resp = check_status(resp).await?;
        let body: AudioListResponse = resp
            .json()
            .await
            .context("unreadable listing from proxy")?;
        Ok(body.audio_files)
    }

    /// `GET /audio/{owner}/{repo}/{branch}/{path}`, optionally forcing the
    /// proxy to re-download its cached copy.
    pub async fn fetch_audio(&self, coord: &RepoCoordinate, refresh: bool) -> Result<Bytes> {
        let mut url = self.route_url("audio", coord)?;
        if refresh {
            url.query_pairs_mut().append_pair("refresh", "true");
        }
        debug!(%url, "fetching audio via proxy");
        let resp = self
            .http_client
            .get(url)
            .send()
            .await
            .context("proxy request failed")?;
        let resp = check_status(resp).await?;
        resp.bytes().await.context("truncated audio body from proxy")
    }

    fn route_url(&self, route: &str, coord: &RepoCoordinate) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow!("proxy base URL cannot carry a path"))?;
            segments
                .pop_if_empty()
                .extend([
                    route,
                    coord.owner.as_str(),
                    coord.repo.as_str(),
                    coord.branch.as_str(),
                ]);
            let path = coord.relative_path();
            if path.is_empty() {
                // Root listing; the trailing slash form is routed too.
                segments.push("");
            } else {
                segments.extend(path.split('/'));
            }
        }
        Ok(url)
    }
}

/// Turn a non-2xx proxy response into an error carrying its `error` field.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => "no error detail".to_string(),
    };
    bail!("proxy returned {status}: {message}")
}
