//! API request/response schemas

use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::batching::{BatchCoalescer, CoalescerMetrics};
use crate::routing::Router;

/// Inference request as it travels between client, gateway, and worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
    /// Idempotency and routing key.
    pub request_id: String,

    pub model_name: String,

    /// Flattened input tensor.
    pub input_data: Vec<f32>,

    pub input_shape: Vec<i64>,

    /// Client-side submission time, microseconds since the epoch.
    #[serde(default)]
    pub timestamp: u64,
}

/// Per-request inference result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferResponse {
    pub request_id: String,

    /// Flattened output tensor.
    pub output_data: Vec<f32>,

    pub output_shape: Vec<i64>,

    pub inference_time_us: u64,

    /// Which worker produced this result.
    pub node_id: String,
}

/// Worker health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub active_requests: usize,
    pub total_requests: u64,
    pub batch_metrics: BatchMetricsBody,
}

/// Batch metrics as exposed on the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetricsBody {
    pub total_batches: u64,
    pub avg_batch_size: f64,
    pub timeout_batches: u64,
    pub full_batches: u64,
}

impl From<CoalescerMetrics> for BatchMetricsBody {
    fn from(metrics: CoalescerMetrics) -> Self {
        Self {
            total_batches: metrics.total_batches,
            avg_batch_size: metrics.avg_batch_size,
            timeout_batches: metrics.timeout_batches,
            full_batches: metrics.full_batches,
        }
    }
}

/// Shared state for the gateway application
#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<Router>,
}

/// Shared state for the worker application
#[derive(Clone)]
pub struct WorkerState {
    pub node_id: String,
    pub coalescer: Arc<BatchCoalescer<InferRequest, InferResponse>>,
    pub active_requests: Arc<AtomicUsize>,
    pub total_requests: Arc<AtomicU64>,
}
