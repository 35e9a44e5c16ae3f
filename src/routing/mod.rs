pub mod ring;
pub mod router;

pub use ring::{HashRing, DEFAULT_REPLICAS};
pub use router::{Router, RouterStats, DEFAULT_FORWARD_TIMEOUT};
