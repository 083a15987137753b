use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use audiocache::AppState;
use audiocache::client::ProxyClient;
use audiocache::config::{self, Config};
use audiocache::content::RepoCoordinate;
use audiocache::server::ServerManager;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "audiocache", about = "Local caching proxy for GitHub-hosted audio")]
struct Cli {
    /// Path to a YAML configuration file.  Defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First port to try (overrides `server.start_port`).
    #[arg(long)]
    port: Option<u16>,

    /// Cache directory (overrides `cache.dir`).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy until interrupted.
    Serve,
    /// List audio files in a repository directory.
    List {
        owner: String,
        repo: String,
        branch: String,
        /// Directory inside the repository; the root when omitted.
        #[arg(default_value = "")]
        path: String,
    },
    /// Download one audio file through the proxy cache.
    Download {
        owner: String,
        repo: String,
        branch: String,
        file_path: String,
        /// Output file; defaults to the base name of `file_path`.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Re-download even if the proxy already cached the file.
        #[arg(long)]
        refresh: bool,
    },
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.server.start_port = port;
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache.dir = dir.clone();
    }
    config::validate_config(&config)?;
    Ok(config)
}

/// Logs go to stderr so `list` output on stdout stays pipeable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn serve(manager: &ServerManager) -> Result<()> {
    let port = manager.start_server().await?;
    tracing::info!(port, base_url = ?manager.base_url(), "audio proxy serving");
    shutdown_signal().await;
    Ok(())
}

async fn connect(manager: &ServerManager) -> Result<ProxyClient> {
    manager.ensure_running().await?;
    let base_url = manager
        .base_url()
        .context("proxy reported ready without a port")?;
    ProxyClient::new(&base_url)
}

async fn list(manager: &ServerManager, coord: RepoCoordinate) -> Result<()> {
    let client = connect(manager).await?;
    for name in client.list_audio(&coord).await? {
        println!("{name}");
    }
    Ok(())
}

async fn download(
    manager: &ServerManager,
    coord: RepoCoordinate,
    output: Option<PathBuf>,
    refresh: bool,
) -> Result<()> {
    let output = match output {
        Some(path) => path,
        None => PathBuf::from(
            coord
                .base_name()
                .with_context(|| format!("no file name in {:?}", coord.path))?,
        ),
    };
    let client = connect(manager).await?;
    let data = client.fetch_audio(&coord, refresh).await?;
    tokio::fs::write(&output, &data)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;
    tracing::info!(path = %output.display(), bytes = data.len(), "audio saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Arc::new(build_config(&cli)?);
    tracing::info!(
        config_path = ?cli.config,
        cache_dir = %config.cache.dir.display(),
        start_port = config.server.start_port,
        "starting audiocache"
    );

    let state = AppState::new(Arc::clone(&config))?;
    let manager = ServerManager::new(state)?;

    let result = match cli.command {
        Command::Serve => serve(&manager).await,
        Command::List {
            owner,
            repo,
            branch,
            path,
        } => list(&manager, RepoCoordinate::new(owner, repo, branch, path)).await,
        Command::Download {
            owner,
            repo,
            branch,
            file_path,
            output,
            refresh,
        } => {
            let coord = RepoCoordinate::new(owner, repo, branch, file_path);
            download(&manager, coord, output, refresh).await
        }
    };

    manager.shutdown().await;
    result
}
