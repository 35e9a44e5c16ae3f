//! Worker node server
//!
//! Hosts the compute engine behind a batch coalescer and serves the
//! `/infer` and `/health` endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use infermesh::{
    batch_compute, build_worker_router, BatchCoalescer, InferenceEngine, WorkerConfig, WorkerState,
};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "worker", about = "Inference worker node")]
struct Args {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Stable worker identity (default: worker_<port>)
    #[arg(long)]
    node_id: Option<String>,

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
        Some(path) => match WorkerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => WorkerConfig::load(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(node_id) = args.node_id {
        config.node_id = Some(node_id);
    }
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    config.logging.init_tracing();

    let node_id = config.node_id();
    // Shard the synthetic model weights across a small number of variants,
    // keyed by port, so co-located workers are distinguishable in output.
    let shard_id = u64::from(config.port) % 3;

    info!("Starting infermesh worker v{}", env!("CARGO_PKG_VERSION"));
    info!("Node: {}", node_id);
    info!("Max batch size: {}", config.batch.max_batch_size);
    info!("Batch timeout: {}ms", config.batch.timeout_ms);

    let engine = Arc::new(InferenceEngine::new(config.model_name.clone(), shard_id));
    let model = engine.model_info();
    info!(
        "Model: {} (shard {}, {:.1} MB weights)",
        model.model_name, model.shard_id, model.weights_size_mb
    );

    let compute = batch_compute(engine, node_id.clone());
    let coalescer = Arc::new(BatchCoalescer::new(
        config.batch.to_coalescer_config(),
        compute,
    ));
    coalescer.start();

    let active_requests = Arc::new(AtomicUsize::new(0));
    let state = WorkerState {
        node_id: node_id.clone(),
        coalescer: coalescer.clone(),
        active_requests: active_requests.clone(),
        total_requests: Arc::new(AtomicU64::new(0)),
    };

    let mut app = build_worker_router(state);
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

    info!("Worker listening on http://{}", socket_addr);
    info!("  POST http://{}/infer  - Run inference", socket_addr);
    info!("  GET  http://{}/health - Health and batch metrics", socket_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(active_requests))
        .await
    {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    info!("Draining batch coalescer...");
    coalescer.stop().await;
    info!("Worker {} shut down gracefully", node_id);
}

/// Wait for a shutdown signal, then give in-flight requests a moment to
/// finish before the coalescer is stopped.
async fn shutdown_signal(active_requests: Arc<AtomicUsize>) {
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

    info!("Initiating graceful shutdown...");

    let max_wait = Duration::from_secs(30);
    let start = Instant::now();
    while active_requests.load(Ordering::Relaxed) > 0 && start.elapsed() < max_wait {
        info!(
            "Waiting for {} active requests to complete...",
            active_requests.load(Ordering::Relaxed)
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let remaining = active_requests.load(Ordering::Relaxed);
    if remaining > 0 {
        warn!("Shutdown timeout reached with {} requests still active", remaining);
    } else {
        info!("All requests completed");
    }
}
