//! Infermesh: distributed inference-serving fabric
//!
//! A stateless gateway routes inference requests to worker nodes with
//! consistent hashing; each worker coalesces concurrent requests into
//! batches and runs them through a local compute engine in one pass.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use infermesh::{batch_compute, BatchCoalescer, CoalescerConfig, InferenceEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Arc::new(InferenceEngine::new("resnet50", 0));
//!     let compute = batch_compute(engine, "worker_8001".to_string());
//!     let coalescer = BatchCoalescer::new(CoalescerConfig::default(), compute);
//!     coalescer.start();
//!     // Submit requests from any number of tasks...
//! }
//! ```

pub mod api;
pub mod batching;
pub mod config;
pub mod inference;
pub mod routing;
pub mod utils;

pub use api::{
    batch_compute, build_gateway_router, build_worker_router, GatewayState, HealthResponse,
    InferRequest, InferResponse, WorkerState,
};
pub use batching::{BatchCoalescer, BatchTrigger, CoalescerConfig, CoalescerMetrics, ComputeFn};
pub use config::{BatchSettings, GatewayConfig, LoggingConfig, WorkerConfig};
pub use inference::InferenceEngine;
pub use routing::{HashRing, Router, RouterStats};
pub use utils::error::{MeshError, Result};
