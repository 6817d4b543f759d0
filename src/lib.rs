//! batchpool - run a batch of tasks across a fixed pool of threads or
//! processes, with every worker's log output funneled through one consumer.
//!
//! The entry point is [`execute_pool`]; see [`pool`] for the moving parts.

pub mod builtin;
pub mod error;
pub mod logging;
pub mod pool;

pub use error::{PoolError, Result, TaskError};
pub use pool::{
    DrainPolicy, Interrupt, PoolConfig, ProgressOptions, Setup, TaskFn, TaskRegistry,
    WorkerCommand, WorkerInfo, WorkerKind, execute_pool,
};
