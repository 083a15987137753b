//! Lifecycle of the embedded proxy server.
//!
//! [`ServerManager`] reserves a loopback port, runs the axum router on a
//! background tokio task, and polls `/health` until the proxy answers or the
//! readiness deadline passes.  "Is it up" is always a live probe, never a
//! cached flag, so callers can detect a dead proxy and relaunch it lazily.
//!
//! State machine: `Unstarted -> Starting -> Ready`, `Ready -> Starting` when
//! a probe fails and the caller relaunches, and `Stopped` after
//! [`ServerManager::shutdown`].

pub mod port;

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::AppState;
use crate::config::ServerConfig;
use crate::health;
use crate::http::create_router;

pub use port::{PortReservation, find_available_port};

/// How long [`ServerManager::stop`] waits for in-flight requests to drain
/// before aborting the server task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors and state snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no available port found in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u32 },
    #[error("proxy on port {port} did not answer /health within {timeout:?}")]
    Unreachable { port: u16, timeout: Duration },
    #[error("server manager has been shut down")]
    ShutDown,
    #[error("failed to adopt listener: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerState {
    /// Port of the most recent launch, if any.
    pub port: Option<u16>,
    /// Result of the most recent readiness or liveness probe.
    pub running: bool,
}

#[derive(Default)]
struct Inner {
    state: ServerState,
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

// ---------------------------------------------------------------------------
// ServerManager
// ---------------------------------------------------------------------------

/// Owns the proxy task.  Create one per process and pass it by reference.
pub struct ServerManager {
    app: AppState,
    host: IpAddr,
    config: ServerConfig,
    probe_client: reqwest::Client,
    /// Root token; every launch runs under a child of it.
    shutdown: CancellationToken,
    /// Serializes launches so concurrent callers cannot start two listeners.
    launch: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl ServerManager {
    pub fn new(app: AppState) -> anyhow::Result<Self> {
        let config = app.config.server.clone();
        let host: IpAddr = config
            .host
            .parse()
            .with_context(|| format!("server.host must be an IP address, got {:?}", config.host))?;
        // Probes target loopback; never route them through an environment proxy.
        let probe_client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("failed to build health probe client")?;
        Ok(Self::with_probe_client(app, host, probe_client))
    }

    fn with_probe_client(app: AppState, host: IpAddr, probe_client: reqwest::Client) -> Self {
        let config = app.config.server.clone();
        Self {
            app,
            host,
            config,
            probe_client,
            shutdown: CancellationToken::new(),
            launch: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner().state
    }

    pub fn port(&self) -> Option<u16> {
        self.inner().state.port
    }

    /// `http://{host}:{port}` of the current launch.
    pub fn base_url(&self) -> Option<String> {
        self.port()
            .map(|port| format!("http://{}", SocketAddr::new(self.host, port)))
    }

    /// Launch the proxy unless the previous launch's task is still alive.
    ///
    /// Returns the port once `/health` answers.  A proxy that never answers
    /// yields [`ServerError::Unreachable`] and stays presumed down; the task
    /// is left in place and the caller may retry, which waits on the same
    /// task again instead of launching a second one.
    #[instrument(skip(self))]
    pub async fn start_server(&self) -> Result<u16, ServerError> {
        let _launch = self.launch.lock().await;
        if let Some(port) = self.live_port() {
            if self.inner().state.running {
                debug!(port, "proxy task still alive, not relaunching");
                return Ok(port);
            }
            debug!(port, "proxy task alive but not ready, waiting again");
            return self.await_ready(port).await;
        }
        self.launch_locked().await
    }

    /// Live probe of the current launch.  `false` if nothing was launched.
    pub async fn is_server_running(&self) -> bool {
        let Some(base_url) = self.base_url() else {
            return false;
        };
        let up = health::probe(&self.probe_client, &base_url, self.config.probe_timeout()).await;
        self.inner().state.running = up;
        up
    }

    /// Return the port of a responsive proxy, relaunching it if the probe
    /// fails.  A task that is alive but unresponsive is stopped first.
    #[instrument(skip(self))]
    pub async fn ensure_running(&self) -> Result<u16, ServerError> {
        let _launch = self.launch.lock().await;
        if let Some(port) = self.port() {
            if self.is_server_running().await {
                return Ok(port);
            }
            warn!(port, "proxy presumed down, relaunching");
        }
        self.stop_task().await;
        self.launch_locked().await
    }

    /// Stop the current launch.  The manager can launch again afterwards.
    pub async fn stop(&self) {
        let _launch = self.launch.lock().await;
        self.stop_task().await;
    }

    /// Stop the proxy for good; later launches fail with
    /// [`ServerError::ShutDown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop().await;
        info!("server manager shut down");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Port of the current launch if its task has not exited.
    fn live_port(&self) -> Option<u16> {
        let inner = self.inner();
        match &inner.task {
            Some(task) if !task.is_finished() => inner.state.port,
            _ => None,
        }
    }

    /// Reserve a port, spawn the proxy, and wait for readiness.  Caller
    /// holds the launch lock.
    async fn launch_locked(&self) -> Result<u16, ServerError> {
        if self.shutdown.is_cancelled() {
            return Err(ServerError::ShutDown);
        }

        let reservation =
            find_available_port(self.host, self.config.start_port, self.config.port_search_span)?;
        let port = reservation.port;
        reservation.listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(reservation.listener)?;

        let cancel = self.shutdown.child_token();
        let router = create_router(Arc::new(self.app.clone()));
        let task = tokio::spawn(run_proxy(listener, router, cancel.clone()));

        {
            let mut inner = self.inner();
            inner.state = ServerState {
                port: Some(port),
                running: false,
            };
            inner.task = Some(task);
            inner.cancel = Some(cancel);
        }
        info!(port, "proxy launched, waiting for readiness");
        self.await_ready(port).await
    }

    /// Wait for readiness and record the outcome in the state snapshot.
    async fn await_ready(&self, port: u16) -> Result<u16, ServerError> {
        if self.wait_until_ready(port).await {
            self.inner().state.running = true;
            info!(port, base_url = ?self.base_url(), "proxy ready");
            Ok(port)
        } else {
            let timeout = self.config.readiness_timeout();
            warn!(port, ?timeout, "proxy did not become ready");
            self.inner().state.running = false;
            Err(ServerError::Unreachable { port, timeout })
        }
    }

    /// Poll `/health` until it answers or the readiness deadline passes.
    async fn wait_until_ready(&self, port: u16) -> bool {
        let base_url = format!("http://{}", SocketAddr::new(self.host, port));
        let deadline = Instant::now() + self.config.readiness_timeout();
        let poll_interval = self.config.poll_interval();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let probe_timeout = self.config.probe_timeout().min(remaining);
            if health::probe(&self.probe_client, &base_url, probe_timeout).await {
                return true;
            }
            if self.live_port().is_none() {
                warn!(port, "proxy task exited before becoming ready");
                return false;
            }
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    /// Cancel the current task and wait for it to drain.
    async fn stop_task(&self) {
        let (task, cancel) = {
            let mut inner = self.inner();
            inner.state.running = false;
            (inner.task.take(), inner.cancel.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                warn!(?DRAIN_TIMEOUT, "proxy did not drain in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve `router` on `listener` until `cancel` fires.
async fn run_proxy(listener: tokio::net::TcpListener, router: Router, cancel: CancellationToken) {
    let addr = listener.local_addr().ok();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;
    match result {
        Ok(()) => info!(?addr, "proxy stopped"),
        Err(e) => error!(?addr, error = %e, "proxy server failed"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::config::Config;

    /// A config whose port search starts at an OS-chosen free port.
    fn test_config(cache_dir: &std::path::Path) -> Config {
        let start = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut config = Config::default();
        config.server.start_port = start.min(u16::MAX - 50);
        config.server.readiness_timeout_secs = 5;
        config.server.poll_interval_ms = 20;
        config.cache.dir = cache_dir.to_path_buf();
        config
    }

    fn manager(config: Config) -> ServerManager {
        let app = AppState::new(Arc::new(config)).unwrap();
        ServerManager::new(app).unwrap()
    }

    #[tokio::test]
    async fn not_running_before_first_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(test_config(tmp.path()));
        assert!(!mgr.is_server_running().await);
        assert_eq!(mgr.state(), ServerState::default());
        assert_eq!(mgr.base_url(), None);
    }

    #[tokio::test]
    async fn start_then_probe_reports_running() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(test_config(tmp.path()));

        let port = mgr.start_server().await.unwrap();
        assert!(mgr.is_server_running().await);
        assert_eq!(
            mgr.state(),
            ServerState {
                port: Some(port),
                running: true
            }
        );

        let body: serde_json::Value = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .get(format!("{}/health", mgr.base_url().unwrap()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({"status": "ok"}));

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(test_config(tmp.path()));

        let first = mgr.start_server().await.unwrap();
        let second = mgr.start_server().await.unwrap();
        assert_eq!(first, second);

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(test_config(tmp.path())));

        let (a, b) = tokio::join!(mgr.start_server(), mgr.start_server());
        assert_eq!(a.unwrap(), b.unwrap());

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_makes_probe_fail_and_blocks_relaunch() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(test_config(tmp.path()));

        mgr.start_server().await.unwrap();
        mgr.shutdown().await;

        assert!(!mgr.is_server_running().await);
        assert!(!mgr.state().running);
        assert!(matches!(mgr.start_server().await, Err(ServerError::ShutDown)));
    }

    #[tokio::test]
    async fn ensure_running_relaunches_a_stopped_proxy() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(test_config(tmp.path()));

        mgr.start_server().await.unwrap();
        mgr.stop().await;
        assert!(!mgr.is_server_running().await);

        let port = mgr.ensure_running().await.unwrap();
        assert!(mgr.is_server_running().await);
        assert_eq!(mgr.port(), Some(port));

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn occupied_range_is_resource_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(tmp.path());
        config.server.start_port = blocker.local_addr().unwrap().port();
        config.server.port_search_span = 1;
        let mgr = manager(config);

        let err = mgr.start_server().await.unwrap_err();
        assert!(matches!(err, ServerError::ResourceExhausted { .. }), "{err}");
        assert_eq!(mgr.port(), None);
        assert!(!mgr.is_server_running().await);
    }

    /// A manager whose health checks go through a dead HTTP proxy, so the
    /// launched server is alive but never observed answering.
    fn unanswered_manager(config: Config) -> ServerManager {
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe_client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://127.0.0.1:{dead_port}")).unwrap())
            .build()
            .unwrap();
        let app = AppState::new(Arc::new(config)).unwrap();
        ServerManager::with_probe_client(app, IpAddr::from([127, 0, 0, 1]), probe_client)
    }

    #[tokio::test]
    async fn launch_that_never_answers_is_unreachable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.server.readiness_timeout_secs = 1;
        config.server.probe_timeout_ms = 100;
        let mgr = unanswered_manager(config);

        let err = mgr.start_server().await.unwrap_err();
        let port = match err {
            ServerError::Unreachable { port, timeout } => {
                assert_eq!(timeout, Duration::from_secs(1));
                port
            }
            other => panic!("expected Unreachable, got {other:?}"),
        };
        assert_eq!(mgr.port(), Some(port));
        assert!(!mgr.state().running);
        assert!(!mgr.is_server_running().await);

        // Not fatal: a retry waits on the same launch and reports it again.
        let again = mgr.start_server().await.unwrap_err();
        assert!(
            matches!(again, ServerError::Unreachable { port: p, .. } if p == port),
            "{again}"
        );
        assert_eq!(mgr.port(), Some(port));
        assert!(!mgr.state().running);

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_hostname_in_host_field() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.server.host = "localhost".to_string();
        let app = AppState::new(Arc::new(config)).unwrap();
        assert!(ServerManager::new(app).is_err());
    }
}
