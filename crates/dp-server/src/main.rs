use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dp_core::services::platform::Platform;
use dp_server::config;
use dp_server::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "dp-server", version, about = "Deploy Git repositories to remote Docker hosts")]
struct Cli {
    /// Path to the YAML config (defaults to ./dp-server.yaml if present).
    #[arg(long, env = "DP_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    let _guard = setup_logging(cli.debug, config.log_dir.as_deref())?;

    let secret = config.jwt_secret()?.to_string();
    let default_host = config.default_host.as_ref().map(|h| h.target());
    if default_host.is_none() {
        info!("no default docker host configured; deployments need an active host record");
    }
    let platform = Arc::new(
        Platform::connect(&config.state_file, default_host, config.platform.clone())
            .await
            .wrap_err("failed to initialise platform")?,
    );

    let app = dp_server::router(AppState::new(Arc::clone(&platform), &secret));
    let listener = TcpListener::bind(&config.listen)
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.listen))?;
    info!(listen = %config.listen, "dp-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("waiting for in-flight builds");
    platform.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

/// Log to stdout, or to a daily-rolling file under `log_dir`. Returns the
/// guard that must be held alive for the duration of the program.
fn setup_logging(
    debug: bool,
    log_dir: Option<&Path>,
) -> color_eyre::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let Some(dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };
    std::fs::create_dir_all(dir).wrap_err_with(|| format!("failed to create {}", dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(dir, "dp-server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}
