//! Firewatch Server - Main entry point.
//!
//! This binary starts the Firewatch confirmation server with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background session cleanup
//!
//! # Configuration
//!
//! See [`firewatch_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (no auth)
//! FIREWATCH_UNSAFE_NO_AUTH=true \
//! FIREWATCH_VAPID_PRIVATE_KEY="base64url-scalar" \
//! cargo run --bin firewatch-server
//!
//! # Production mode
//! FIREWATCH_ALARM_KEYS="A1:base64pubkey" \
//! FIREWATCH_VAPID_PRIVATE_KEY="base64url-scalar" \
//! FIREWATCH_VAPID_SUBJECT="mailto:ops@example.com" \
//! FIREWATCH_DIRECTORY_FILE=/etc/firewatch/directory.json \
//! PORT=8080 \
//! cargo run --release --bin firewatch-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use firewatch_server::config::Config;
use firewatch_server::directory::{Directory, MemoryDirectory};
use firewatch_server::push::WebPushDispatcher;
use firewatch_server::routes::{create_router, AppState};

/// Cleanup interval for expired sessions (60 seconds).
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  FIREWATCH_VAPID_PRIVATE_KEY    - Raw P-256 scalar, base64url");
            eprintln!("  FIREWATCH_ALARM_KEYS           - Format: serial1:pubkey1,serial2:pubkey2");
            eprintln!("                                   (not needed with auth disabled)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                           - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                       - Log level filter (default: info)");
            eprintln!("  FIREWATCH_VAPID_PUBLIC_KEY     - Checked against the private key");
            eprintln!("  FIREWATCH_VAPID_SUBJECT        - VAPID contact URI");
            eprintln!("  FIREWATCH_CONFIRM_TIMEOUT_SECS - Wait for an answer (default: 15)");
            eprintln!("  FIREWATCH_SESSION_TTL_SECS     - Login lifetime (default: 3600)");
            eprintln!("  FIREWATCH_DIRECTORY_FILE       - JSON seed for users, alarms and devices");
            eprintln!("  FIREWATCH_UNSAFE_NO_AUTH       - Disable auth (dev only, set to 'true')");
            return ExitCode::from(1);
        }
    };

    let auth_mode = if config.unsafe_no_auth {
        "disabled (UNSAFE)"
    } else {
        "enabled"
    };
    info!(
        port = config.port,
        auth_mode = auth_mode,
        alarm_key_count = config.alarm_keys.len(),
        confirm_timeout_secs = config.confirm_timeout.as_secs(),
        "Firewatch server starting"
    );

    let directory: Arc<dyn Directory> = match &config.directory_file {
        Some(path) => match MemoryDirectory::from_seed_file(path) {
            Ok(directory) => {
                info!(path = %path.display(), "Directory loaded");
                Arc::new(directory)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), path = %path.display(), "Failed to load directory");
                return ExitCode::from(1);
            }
        },
        None => {
            info!("No directory file configured, starting with an empty directory");
            Arc::new(MemoryDirectory::new())
        }
    };

    let dispatcher = match WebPushDispatcher::new(&config.vapid_private_key, &config.vapid_subject)
    {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(err) => {
            error!(error = %err, "Failed to create push dispatcher");
            return ExitCode::from(1);
        }
    };

    let port = config.port;
    let state = AppState::new(config, directory, dispatcher);

    let cleanup_handle = state.sessions.spawn_cleanup_task(SESSION_CLEANUP_INTERVAL);
    info!(
        interval_secs = SESSION_CLEANUP_INTERVAL.as_secs(),
        "Session cleanup task started"
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(
                error = %err,
                address = %bind_addr,
                "Failed to bind to address"
            );
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    cleanup_handle.abort();
    info!("Session cleanup task stopped");

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output for production use with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
///
/// Waiting alarms see their connection closed; their pending entries are
/// released when the request futures are dropped.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
