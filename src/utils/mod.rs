pub mod benchmark;
pub mod error;

pub use benchmark::{LatencyTracker, LoadReport};
pub use error::{MeshError, Result};
