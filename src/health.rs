use std::time::Duration;

use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::trace;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /health` handler.  Pure liveness: answering at all means the
/// listener and router are up.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Ok,
    })
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// `true` iff `GET {base_url}/health` answers 200 within `timeout`.
pub async fn probe(client: &reqwest::Client, base_url: &str, timeout: Duration) -> bool {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    match client.get(&url).timeout(timeout).send().await {
        Ok(resp) => {
            trace!(%url, status = %resp.status(), "health probe answered");
            resp.status() == reqwest::StatusCode::OK
        }
        Err(e) => {
            trace!(%url, error = %e, "health probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_status_ok() {
        let body = serde_json::to_value(HealthResponse {
            status: HealthStatus::Ok,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn probe_of_closed_port_is_false() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = reqwest::Client::new();
        assert!(!probe(&client, &format!("http://127.0.0.1:{port}"), Duration::from_millis(500)).await);
    }
}
