//! Worker processes.
//!
//! Workers are copies of an executable started in worker mode (see
//! [`run_worker`]). They speak newline-delimited JSON with the parent:
//!
//! ```text
//!   parent (driver thread)              worker process
//!   ──────────────────────              ──────────────
//!                          <── ready | init_failed
//!   run {seq, input}       ──>
//!                          <── log {record}         (any number)
//!                          <── result | error | panicked | fault
//!   ...
//!   exit                   ──>
//! ```
//!
//! A worker that hits SIGBUS writes `fault` from its signal handler and
//! exits; the parent fails the running task with
//! [`TaskError::InputInaccessible`](crate::TaskError::InputInaccessible).

mod ipc;
mod pool;
mod proc;
pub(crate) mod protocol;
mod signals;
mod spawn;
mod table;
mod worker_main;

pub(crate) use pool::ProcessPool;
pub use worker_main::{WorkerArgs, run_worker};
