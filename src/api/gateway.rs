//! Gateway HTTP handlers

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tracing::debug;

use crate::api::schema::GatewayState;
use crate::routing::RouterStats;
use crate::utils::error::MeshError;

/// Forward an inference request to the worker chosen by the hash ring.
///
/// The body is treated as opaque JSON; only `request_id` is read, for
/// routing. The worker's response is returned verbatim.
pub async fn infer(
    State(state): State<GatewayState>,
    Json(request): Json<Value>,
) -> Result<Json<Value>, MeshError> {
    debug!(
        request_id = request
            .get("request_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("<generated>"),
        "gateway received inference request"
    );
    state.router.route(request).await.map(Json)
}

/// Gateway routing statistics.
pub async fn stats(State(state): State<GatewayState>) -> Json<RouterStats> {
    Json(state.router.stats())
}

/// Build the gateway application router
pub fn build_gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/infer", post(infer))
        .route("/stats", get(stats))
        .with_state(state)
}
