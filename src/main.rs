//! iLy server binary.
//!
//! Usage:
//!   cargo run --bin ily_server -- --bind 0.0.0.0:3000
//!   ily-cli generate "a landing page for a bakery"

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use ily_server::config::Config;
use ily_server::rest::create_router;
use ily_server::state::AppState;
use ily_server::telemetry;

#[derive(Parser)]
#[command(name = "ily_server", version, about = "AI website builder backend")]
struct Args {
    /// Listen address (overrides ILY_BIND_ADDR).
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory for the feedback store (overrides ILY_DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for rolling log files (overrides ILY_LOG_DIR).
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = args.log_dir {
        config.log_dir = dir;
    }

    let _log_guard = telemetry::init(&config.log_dir);

    let addr: SocketAddr = config.bind_addr.parse()?;
    info!(%addr, app_url = %config.app_url, production = config.is_production, "iLy server starting");

    let state = AppState::from_config(config)?;
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{addr} (Swagger UI at /swagger-ui)");

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        return Err(e.into());
    }

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => error!(error = %e, "Failed to install Ctrl+C handler"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
