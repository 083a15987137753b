use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Runtime configuration.  Every field has a default, so an empty document
/// (or no file at all) yields a usable config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
}

// ---------------------------------------------------------------------------
// Embedded server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Loopback address the proxy binds and the manager probes.
    pub host: String,
    /// First port tried when looking for a free listener.
    #[serde(alias = "startPort")]
    pub start_port: u16,
    /// Number of consecutive ports probed, starting at `start_port`.
    pub port_search_span: u16,
    /// Maximum time (seconds) to wait for `/health` after a launch.
    #[serde(alias = "readinessTimeoutSeconds")]
    pub readiness_timeout_secs: u64,
    /// Delay (milliseconds) between readiness probes.
    pub poll_interval_ms: u64,
    /// Timeout (milliseconds) of a single liveness probe.
    pub probe_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            start_port: 8000,
            port_search_span: 50,
            readiness_timeout_secs: 5,
            poll_interval_ms: 100,
            probe_timeout_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Upstream (GitHub)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Root of the REST API used for directory listings.
    pub api_url: String,
    /// Root of the raw-content host used for file downloads.
    pub raw_url: String,
    /// Sent on every upstream request; GitHub rejects anonymous agents.
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            raw_url: "https://raw.githubusercontent.com".to_string(),
            user_agent: "audiocache/0.1".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Local cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one file per cached base name.
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("audio_cache"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a YAML config document.
pub fn parse_config(contents: &str) -> Result<Config> {
    // serde_yaml rejects an empty document; treat it as "all defaults".
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    let server = &config.server;
    anyhow::ensure!(
        server.port_search_span >= 1,
        "port_search_span must be at least 1"
    );
    anyhow::ensure!(
        u32::from(server.start_port) + u32::from(server.port_search_span) - 1 <= u32::from(u16::MAX),
        "port range {}..{} exceeds 65535",
        server.start_port,
        u32::from(server.start_port) + u32::from(server.port_search_span) - 1
    );
    anyhow::ensure!(
        server.readiness_timeout_secs >= 1,
        "readiness_timeout_secs must be at least 1"
    );
    anyhow::ensure!(server.poll_interval_ms >= 1, "poll_interval_ms must be at least 1");
    anyhow::ensure!(server.probe_timeout_ms >= 1, "probe_timeout_ms must be at least 1");
    reqwest::Url::parse(&config.upstream.api_url)
        .with_context(|| format!("invalid upstream.api_url: {}", config.upstream.api_url))?;
    reqwest::Url::parse(&config.upstream.raw_url)
        .with_context(|| format!("invalid upstream.raw_url: {}", config.upstream.raw_url))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.start_port, 8000);
        assert_eq!(config.server.port_search_span, 50);
        assert_eq!(config.server.readiness_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache.dir, PathBuf::from("audio_cache"));
        assert_eq!(config.upstream.api_url, "https://api.github.com");
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let yaml = "server:\n  start_port: 9100\ncache:\n  dir: /tmp/audio\n";
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.server.start_port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.cache.dir, PathBuf::from("/tmp/audio"));
        assert_eq!(config.upstream.raw_url, "https://raw.githubusercontent.com");
    }

    #[test]
    fn camel_case_option_names_are_accepted() {
        let yaml = "server:\n  startPort: 8100\n  readinessTimeoutSeconds: 2\n";
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.server.start_port, 8100);
        assert_eq!(config.server.readiness_timeout_secs, 2);
    }

    #[test]
    fn rejects_range_past_last_port() {
        let yaml = "server:\n  start_port: 65500\n  port_search_span: 50\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_zero_span() {
        let yaml = "server:\n  port_search_span: 0\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_bad_upstream_url() {
        let yaml = "upstream:\n  api_url: not a url\n";
        assert!(parse_config(yaml).is_err());
    }
}
