//! Local caching proxy for audio files stored in GitHub repositories.
//!
//! The [`server::ServerManager`] reserves a loopback port, runs the axum
//! proxy on a background task, and answers "is it up" with a live probe.
//! The proxy lists audio files through the GitHub contents API and serves
//! raw files through a flat on-disk cache keyed by base file name.

pub mod cache;
pub mod client;
pub mod config;
pub mod content;
pub mod health;
pub mod http;
pub mod metrics;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{CacheStore, KeyLocks};
use crate::config::Config;
use crate::content::{ContentSource, GitHubContent};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: CacheStore,
    /// Serializes cache fills per file name.
    pub fills: KeyLocks,
    /// Remote repository host (GitHub in production).
    pub content: Arc<dyn ContentSource>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    /// Build the production state: a reqwest client carrying the configured
    /// User-Agent and a GitHub content backend.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(&config.upstream.user_agent)
            .build()
            .context("failed to build reqwest client")?;
        let content = GitHubContent::new(&config.upstream, http_client)?;
        Ok(Self::with_source(config, Arc::new(content)))
    }

    /// Build state around an arbitrary [`ContentSource`].
    pub fn with_source(config: Arc<Config>, content: Arc<dyn ContentSource>) -> Self {
        Self {
            cache: CacheStore::new(&config.cache),
            fills: KeyLocks::new(),
            content,
            metrics: MetricsRegistry::new(),
            config,
        }
    }
}
