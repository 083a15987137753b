//! Remote content resolution.
//!
//! Provides the [`ContentSource`] trait that encapsulates every call to the
//! remote repository host: directory listings and raw file downloads.  The
//! proxy routes dispatch through this trait so that no host-specific URL
//! construction or response parsing leaks outside this module.

pub mod github;

use bytes::Bytes;
use thiserror::Error;

pub use github::GitHubContent;

/// File extensions (lower-case) recognised as audio.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".mp3", ".wav", ".ogg", ".flac", ".m4a"];

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

/// A location inside a remote repository tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCoordinate {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Directory (for listings) or file path (for downloads).  A leading `/`
    /// is ignored.
    pub path: String,
}

impl RepoCoordinate {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
            path: path.into(),
        }
    }

    /// `path` with any leading slashes removed.
    pub fn relative_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    /// Final component of `path`, used as the cache key.  `None` when the
    /// path is empty or ends in a separator.
    pub fn base_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

impl std::fmt::Display for RepoCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}:/{}",
            self.owner,
            self.repo,
            self.branch,
            self.relative_path()
        )
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The remote call failed or returned an error status.
    #[error("{0}")]
    NotFound(String),
    /// The listing target exists but is not a directory.
    #[error("{0}")]
    InvalidPath(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the remote repository host.
#[async_trait::async_trait]
pub trait ContentSource: Send + Sync {
    /// Names of the audio files directly inside `coord.path`, in the order
    /// the remote returned them.
    async fn list_audio(&self, coord: &RepoCoordinate) -> Result<Vec<String>, ResolveError>;

    /// Raw bytes of the file at `coord.path`.  Single attempt, no retry.
    async fn fetch_audio(&self, coord: &RepoCoordinate) -> Result<Bytes, ResolveError>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Case-insensitive check against [`SUPPORTED_EXTENSIONS`].
pub fn is_supported_audio(name: &str) -> bool {
    let lower = name.to_lowercase();
    SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Select audio file names from a contents-API listing body.
///
/// Returns `None` when the body is not an array, which is how the API
/// answers for a path that is a file rather than a directory.
pub fn filter_audio_listing(body: &serde_json::Value) -> Option<Vec<String>> {
    let entries = body.as_array()?;
    Some(
        entries
            .iter()
            .filter(|entry| entry.get("type").and_then(|t| t.as_str()) == Some("file"))
            .filter_map(|entry| entry.get("name").and_then(|n| n.as_str()))
            .filter(|name| is_supported_audio(name))
            .map(str::to_string)
            .collect(),
    )
}
