//! Error types for infermesh

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for infermesh
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("hash ring is empty")]
    EmptyRing,

    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("all workers failed: {cause}")]
    AllWorkersFailed { cause: String },

    #[error("request processing timeout")]
    SubmitTimeout,

    #[error("queue is full")]
    QueueFull,

    #[error("shutting down")]
    ShuttingDown,

    #[error("compute error: {0}")]
    Compute(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let status = match self {
            MeshError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            MeshError::SubmitTimeout => StatusCode::REQUEST_TIMEOUT,
            MeshError::QueueFull | MeshError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Plain-text body shared with the gateway/worker wire contract.
        (status, format!("Error: {}", self)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
