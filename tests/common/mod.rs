//! Shared helpers for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use infermesh::{
    batch_compute, build_worker_router, BatchCoalescer, BatchSettings, InferRequest,
    InferenceEngine, WorkerState,
};

/// Start a real worker on an ephemeral port and return its base URL.
pub async fn spawn_worker(node_id: &str, batch: BatchSettings) -> String {
    let engine = Arc::new(InferenceEngine::new("resnet50", 0));
    let compute = batch_compute(engine, node_id.to_string());
    let coalescer = Arc::new(BatchCoalescer::new(batch.to_coalescer_config(), compute));
    coalescer.start();

    let state = WorkerState {
        node_id: node_id.to_string(),
        coalescer,
        active_requests: Arc::new(AtomicUsize::new(0)),
        total_requests: Arc::new(AtomicU64::new(0)),
    };

    let app = build_worker_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

/// Small batch settings so tests dispatch quickly.
pub fn fast_batch() -> BatchSettings {
    BatchSettings {
        max_batch_size: 8,
        timeout_ms: 10,
        ..Default::default()
    }
}

/// Minimal inference payload; the engine pads the input as needed.
pub fn infer_request(request_id: &str) -> InferRequest {
    InferRequest {
        request_id: request_id.to_string(),
        model_name: "resnet50".to_string(),
        input_data: (0..16).map(|i| i as f32 * 0.125).collect(),
        input_shape: vec![1, 16],
        timestamp: 0,
    }
}
