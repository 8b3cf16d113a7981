pub mod executor;
pub mod pool;

pub use executor::{Executor, ExecutorSettings, JobOutcome};
pub use pool::{PoolSettings, WorkerPool};
