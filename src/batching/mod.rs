pub mod coalescer;

pub use coalescer::{
    BatchCoalescer, BatchTrigger, CoalescerConfig, CoalescerMetrics, ComputeFn,
};
