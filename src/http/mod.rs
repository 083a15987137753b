//! HTTP layer of the audio proxy.
//!
//! This module provides the axum router that lists audio files in a remote
//! directory and serves individual files through the local cache.

pub mod audio;
pub mod handler;

pub use handler::{AppError, AudioListResponse, ErrorBody, create_router};
