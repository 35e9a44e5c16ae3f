//! Worker HTTP handlers and batching glue

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use futures::FutureExt;
use tracing::debug;

use crate::api::schema::{HealthResponse, InferRequest, InferResponse, WorkerState};
use crate::batching::ComputeFn;
use crate::inference::InferenceEngine;
use crate::utils::error::{MeshError, Result};

/// Build the coalescer compute callback for a worker.
///
/// Runs the whole batch through the engine in one call on the blocking
/// pool, then reassembles per-request responses index-aligned with the
/// batch.
pub fn batch_compute(
    engine: Arc<InferenceEngine>,
    node_id: String,
) -> ComputeFn<InferRequest, InferResponse> {
    Arc::new(move |batch: Vec<InferRequest>| {
        let engine = engine.clone();
        let node_id = node_id.clone();
        async move {
            let batch_size = batch.len();
            debug!(batch_size, "running batched inference");

            let (batch, results) = tokio::task::spawn_blocking(move || {
                let results = {
                    let inputs: Vec<&[f32]> =
                        batch.iter().map(|req| req.input_data.as_slice()).collect();
                    engine.batch_infer(&inputs)
                };
                (batch, results)
            })
            .await
            .map_err(|e| MeshError::Compute(e.to_string()))?;

            if results.len() != batch.len() {
                return Err(MeshError::Compute(format!(
                    "engine returned {} results for a batch of {}",
                    results.len(),
                    batch.len()
                )));
            }

            let responses = batch
                .into_iter()
                .zip(results)
                .map(|(request, (output, inference_time_us))| InferResponse {
                    request_id: request.request_id,
                    output_shape: vec![output.len() as i64],
                    output_data: output,
                    inference_time_us,
                    node_id: node_id.clone(),
                })
                .collect();
            Ok(responses)
        }
        .boxed()
    })
}

/// Handle one inference request by batching it with its neighbors.
pub async fn infer(
    State(state): State<WorkerState>,
    Json(request): Json<InferRequest>,
) -> Result<Json<InferResponse>> {
    if request.input_data.is_empty() {
        return Err(MeshError::InvalidRequest(
            "input_data cannot be empty".to_string(),
        ));
    }

    state.total_requests.fetch_add(1, Ordering::Relaxed);
    state.active_requests.fetch_add(1, Ordering::Relaxed);

    let result = state.coalescer.submit(request).await;

    state.active_requests.fetch_sub(1, Ordering::Relaxed);
    result.map(Json)
}

/// Worker health and batching metrics.
pub async fn health(State(state): State<WorkerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        active_requests: state.active_requests.load(Ordering::Relaxed),
        total_requests: state.total_requests.load(Ordering::Relaxed),
        batch_metrics: state.coalescer.metrics().into(),
    })
}

/// Build the worker application router
pub fn build_worker_router(state: WorkerState) -> Router {
    Router::new()
        .route("/infer", post(infer))
        .route("/health", get(health))
        .with_state(state)
}
