pub mod pool;
pub mod rate_limiter;
pub mod snapshotter;
pub mod system_status;

pub use pool::{
    AutoscaledPool, AutoscaledPoolOptions, BoolFuture, PoolCallbacks, PoolState, TaskFuture,
};
pub use rate_limiter::TokenBucket;
pub use snapshotter::{
    ClientSample, CpuSample, EventLoopSample, MemorySample, Snapshotter, SnapshotterOptions,
};
pub use system_status::{StatusReport, SystemStatus, SystemStatusOptions};
