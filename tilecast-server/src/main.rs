//! Tilecast runtime server.
//!
//! Wires configuration, tracing and the core context together and serves
//! the axum router until SIGTERM/SIGINT, then drains gracefully.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tilecast::app::{bootstrap, CoreConfig};
use tilecast::engine::TileEngine;
use tilecast::http::{build_router, AppState};
use tilecast::jobs::{CampaignStore, InMemoryCampaignStore, JobEngine, JobEngineConfig};

#[derive(Parser, Debug)]
#[command(name = "tilecast-server", version, about = "Satellite imagery tile server")]
struct CliArgs {
    /// Listen port; overrides the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,

    /// Validate configuration and exit.
    #[arg(long, default_value_t = false)]
    check_config: bool,
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = CliArgs::parse();
    let mut config = CoreConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    init_tracing(config.log_json);

    if cli.check_config {
        info!(port = config.port, "configuration valid");
        return std::process::ExitCode::SUCCESS;
    }

    let port = config.port;
    let job_pool_size = config.job_pool_size;
    let ctx = match bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            return std::process::ExitCode::FAILURE;
        }
    };

    let engine = TileEngine::new(ctx);
    let campaigns: Arc<dyn CampaignStore> = Arc::new(InMemoryCampaignStore::new());
    let jobs = JobEngine::new(
        Arc::clone(&engine),
        Arc::clone(&campaigns),
        JobEngineConfig {
            pool_size: job_pool_size,
            ..JobEngineConfig::default()
        },
    );
    let job_handles = jobs.start();

    let state = AppState::new(Arc::clone(&engine), Arc::clone(&jobs), campaigns);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "bind failed");
            return std::process::ExitCode::FAILURE;
        }
    };
    info!(addr = %addr, "tilecast-server listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received, draining");
        })
        .await;

    jobs.stop();
    for handle in job_handles {
        handle.abort();
    }

    match serve_result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            std::process::ExitCode::FAILURE
        }
    }
}
