//! ptyrelay - browser terminal to PTY relay
//!
//! Exposes a WebSocket endpoint that gives each connected browser terminal
//! its own shell. Intended to sit behind a private network (loopback or a
//! tailnet); there is no TLS of its own.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as ClapParser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ptyrelay::{
    admission::Admission,
    api,
    config::{self, ConfigError, FileConfig, Overrides, Settings},
    shutdown::ShutdownCoordinator,
};

/// How long live sessions get to close after Ctrl+C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// ptyrelay - browser terminal to PTY relay
#[derive(ClapParser, Debug)]
#[command(name = "ptyrelay", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server [default: 127.0.0.1:3000]
    #[arg(long)]
    bind: Option<String>,

    /// Shared secret clients must send before using the shell
    #[arg(long, env = "PTYRELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Generate a random token when none is configured
    #[arg(long)]
    generate_token: bool,

    /// Shell to spawn (overrides $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Maximum number of concurrent sessions [default: 3]
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-IP limit on WebSocket upgrade requests, per second
    #[arg(long)]
    rate_limit: Option<u32>,
}

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn generate_token() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ptyrelay=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_settings(cli: Cli) -> Result<Settings, ServeError> {
    let file = match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => {
            let loaded = FileConfig::load(&path)?;
            if loaded.is_some() {
                tracing::info!(path = %path.display(), "loaded config file");
            } else if cli.config.is_some() {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
            }
            loaded
        }
        None => None,
    };

    let overrides = Overrides {
        bind: cli.bind,
        token: cli.token,
        shell: cli.shell,
        max_sessions: cli.max_sessions,
        rate_limit: cli.rate_limit,
    };
    let mut settings = Settings::resolve(overrides, file)?;

    if settings.token.is_none() && cli.generate_token {
        let token = generate_token();
        eprintln!("ptyrelay: access token: {}", token);
        settings.token = Some(token);
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<(), ServeError> {
    let cli = Cli::parse();
    init_tracing();

    let settings = load_settings(cli)?;
    run_server(settings).await
}

/// Serve until Ctrl+C, then close every live session before stopping.
async fn run_server(settings: Settings) -> Result<(), ServeError> {
    tracing::info!("ptyrelay starting");

    match &settings.token {
        Some(_) => tracing::info!("auth token configured"),
        None if !settings.bind.ip().is_loopback() => tracing::warn!(
            addr = %settings.bind,
            "no auth token configured on a non-loopback address"
        ),
        None => {}
    }

    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        admission: Admission::new(settings.max_sessions),
        session_config: Arc::new(settings.session_config()),
        shutdown: shutdown.clone(),
    };
    let app = api::router(
        state,
        api::RouterConfig {
            rate_limit: settings.rate_limit,
        },
    );

    let listener = tokio::net::TcpListener::bind(settings.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        max_sessions = settings.max_sessions,
        "HTTP/WS server listening"
    );

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("received Ctrl+C");

            // Signal WebSocket handlers to send close frames
            shutdown.shutdown();
            if !shutdown.wait_for_all_closed(SHUTDOWN_GRACE).await {
                tracing::warn!(
                    remaining = shutdown.active_connections(),
                    "sessions still open after grace period"
                );
            }
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await?;

    tracing::info!("ptyrelay exiting");
    Ok(())
}
