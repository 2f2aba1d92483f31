use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::RwLock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gateway::auth::AuthGate;
use gateway::config::{CliArgs, GatewayConfig, load_config_from_path};
use gateway::host_link::HostLink;
use gateway::state::AppState;
use gateway::{config, http};

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = CliArgs::parse();

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let config = Arc::new(RwLock::new(config));

    let auth = match AuthGate::load_or_create(Arc::clone(&config)) {
        Ok(a) => a,
        Err(e) => {
            error!(%e, "failed to load or create the api key");
            return ExitCode::FAILURE;
        }
    };

    let (state, outbound_rx) = AppState::new(config, auth);

    let host_link = HostLink::new(
        args.socket_file.clone(),
        state.registry.clone(),
        state.server_state.clone(),
        state.multiplexer.clone(),
        state.event_router.clone(),
        state.config.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = host_link.run(outbound_rx).await {
            error!(%e, "host link terminated");
        }
    });

    state.subscriptions.spawn_tiers();

    let temperature = state.temperature.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            temperature.tick().await;
        }
    });

    let router = http::build_router(state);

    let bind_addr = format!("{}:{}", args.address, args.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%e, addr = %bind_addr, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %bind_addr, socket = %args.socket_file.display(), "gateway listening");

    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    match result {
        Ok(()) => {
            info!("gateway shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%e, "server error");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &CliArgs) -> Result<GatewayConfig, config::ConfigError> {
    match &args.config_file {
        Some(path) => load_config_from_path(path),
        None => Ok(GatewayConfig::default()),
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
