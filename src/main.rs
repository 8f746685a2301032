use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::http::HttpServer;
use turnstile::ratelimit::{LimiterRegistry, SystemClock};
use turnstile::store::build_store;

/// Fixed-window rate limiting gate.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.storage.backend,
        failure_policy = ?config.storage.failure_policy,
        admin_routes = config.server.enable_admin_routes,
        "Configuration loaded"
    );

    let store = build_store(&config.storage);
    let registry = Arc::new(LimiterRegistry::from_rules(
        &config.limits.rules,
        store,
        Arc::new(SystemClock),
        config.storage.failure_policy,
        config.storage.sweep_every,
    )?);
    info!(operations = ?registry.operations(), "Rate limiters initialized");

    let purged = registry.sweep().await;
    info!(purged = purged, "Startup sweep of stale counters complete");

    if let Some(path) = args.config.clone() {
        if config.limits.reload_interval_secs > 0 {
            spawn_reloader(
                path,
                Duration::from_secs(config.limits.reload_interval_secs),
                registry.clone(),
            );
        }
    }

    let server = HttpServer::new(
        config.server.listen_addr,
        registry,
        config.server.trust_forwarded_headers,
        config.server.enable_admin_routes,
    );
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Periodically re-read the rule table from the configuration file.
fn spawn_reloader(path: PathBuf, interval: Duration, registry: Arc<LimiterRegistry>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            reload(&path, &registry);
        }
    });
}

fn reload(path: &Path, registry: &LimiterRegistry) {
    let result = TurnstileConfig::load(Some(path))
        .and_then(|config| registry.reload(&config.limits.rules));

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Rule reload failed, keeping previous rules");
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
