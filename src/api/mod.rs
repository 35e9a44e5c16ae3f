pub mod gateway;
pub mod schema;
pub mod worker;

pub use gateway::build_gateway_router;
pub use schema::{GatewayState, HealthResponse, InferRequest, InferResponse, WorkerState};
pub use worker::{batch_compute, build_worker_router};
