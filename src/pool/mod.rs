//! Batch execution on a pool of worker threads or worker processes.
//!
//! # Architecture
//!
//! ```text
//!   execute_pool ──(seq, input)──► queue ──► Worker 0..N   (threads or processes)
//!        ▲                                      │    │
//!        └────────── result / error ────────────┘    │ log records
//!                                                    ▼
//!                    tracing ◄── LogAggregator ◄── LogChannel
//! ```
//!
//! Every call builds a fresh pool, a fresh log channel and a fresh
//! aggregator, and tears all three down before it returns: workers first,
//! then the channel sentinel, then the aggregator.
//!
//! Worker threads share the caller's subscriber and log to it directly;
//! only worker processes route their records through the channel.

pub mod aggregator;
pub mod config;
mod dispatcher;
pub mod initializer;
pub mod interrupt;
pub mod log_channel;
pub mod process;
pub mod task;
mod threads;

pub use aggregator::{AggregatorStats, LogAggregator, RecordSink, TracingSink};
pub use config::{DrainPolicy, PoolConfig, ProgressOptions, WorkerCommand, WorkerKind};
pub use dispatcher::{execute_pool, execute_pool_with_sink};
pub use initializer::{FAULT_EXIT_CODE, FaultPolicy, WorkerInitializer};
pub use interrupt::Interrupt;
pub use log_channel::{ForwardLayer, ForwardRecord, LogChannel, LogRecord, LogSender};
pub use task::{Setup, TaskFn, TaskRegistry, WorkerInfo};

use crate::error::{PoolError, Result};

/// What a worker reports to the dispatcher.
pub(crate) enum WorkerEvent<O> {
    /// A task ran to completion, successfully or not.
    Finished {
        worker: usize,
        seq: u64,
        outcome: Result<O>,
    },
    /// The worker could not start or stopped outside of a task.
    Failed { worker: usize, error: PoolError },
}
