//! Run statistics: numerically stable, order-independent mean/variance over a
//! run's samples, with the warm-up sample excluded.

pub mod aggregate;
pub mod service;

pub use aggregate::{
    aggregate, merge, reduce_parallel, PartialAggregate, RunStats, StatsAccumulator, WarmupFilter,
    PARALLEL_THRESHOLD,
};
pub use service::StatsService;
