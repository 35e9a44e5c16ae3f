//! Gateway server
//!
//! Routes inference requests to worker nodes with consistent hashing.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use infermesh::{build_gateway_router, GatewayConfig, GatewayState, Router};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "Inference gateway server")]
struct Args {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Worker endpoints
    #[arg(long, num_args = 1..)]
    workers: Vec<String>,

    /// Path to a TOML configuration file
    #[arg(long, env = "INFERMESH_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Configuration problems are reported on stderr; the tracing
    // subscriber is not installed until the logging config is known.
    let mut config = match &args.config {
        Some(path) => match GatewayConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => GatewayConfig::load(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if !args.workers.is_empty() {
        config.workers = args.workers.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    config.logging.init_tracing();

    info!("Starting infermesh gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Workers: {}", config.workers.len());
    for (i, worker) in config.workers.iter().enumerate() {
        info!("  {}. {}", i + 1, worker);
    }
    info!("Routing: consistent hashing (150 virtual nodes per worker)");

    let router = Arc::new(Router::new(
        config.workers.clone(),
        config.forward_timeout(),
    ));
    router.probe_workers().await;

    let state = GatewayState { router };

    let mut app = build_gateway_router(state);
    if config.enable_cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    app = app.layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let socket_addr: SocketAddr = match addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid socket address '{}': {}", addr, e);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&socket_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind to {}: {}", socket_addr, e);
            std::process::exit(1);
        }
    };

    info!("Gateway listening on http://{}", socket_addr);
    info!("  POST http://{}/infer - Route an inference request", socket_addr);
    info!("  GET  http://{}/stats - Routing statistics", socket_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    info!("Gateway shut down gracefully");
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("failed to install signal handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
