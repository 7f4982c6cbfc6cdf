use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use userlimit::config::{LogFormat, LoggingConfig, UserLimitConfig};
use userlimit::http::{AppState, HttpServer, TokenVerifier};

#[derive(Parser, Debug)]
#[command(name = "userlimit")]
#[command(about = "User-aware rate limiting for the bookmarks API", version)]
struct Cli {
    /// Configuration file (YAML); environment variables prefixed
    /// USERLIMIT__ override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        /// Listen address, overriding server.http_addr
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Sign a bearer token with the configured secret
    Token {
        /// Value of the userId claim
        #[arg(long)]
        user_id: String,

        /// Lifetime in seconds; the token never expires when omitted
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = UserLimitConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve { addr: None }) {
        Command::Serve { addr } => serve(config, addr).await,
        Command::Token { user_id, ttl_secs } => {
            let secret = config
                .auth
                .jwt_secret
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("auth.jwt_secret is not configured"))?;
            let token = TokenVerifier::new(secret.as_bytes())
                .issue(&user_id, ttl_secs.map(Duration::from_secs))?;
            println!("{}", token);
            Ok(())
        }
    }
}

async fn serve(config: UserLimitConfig, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    init_tracing(&config.logging);

    info!("Starting userlimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let addr = addr.unwrap_or(config.server.http_addr);
    info!(
        http_addr = %addr,
        window_ms = config.rate_limiting.limits.window_ms,
        max = config.rate_limiting.limits.max,
        "Configuration loaded"
    );

    let state = AppState::from_config(&config)?;
    HttpServer::new(addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("userlimit stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
