//! Tasks shipped with the `batchpool` binary.
//!
//! They exist to exercise the pool from the command line and from tests, and
//! double as the registry that the binary's worker processes serve.

use crate::error::TaskError;
use crate::pool::{Setup, TaskFn, TaskRegistry, WorkerInfo};
use nix::sys::signal::{Signal, raise};
use std::time::Duration;

/// Returns its input unchanged.
pub const ECHO: TaskFn<String, String> = TaskFn::new("echo", echo);

/// Sleeps for the given number of milliseconds and returns it.
pub const SLEEP: TaskFn<u64, u64> = TaskFn::new("sleep", sleep);

/// Fails on inputs starting with "fail", echoes everything else.
pub const FAIL: TaskFn<String, String> = TaskFn::new("fail", fail);

/// Raises SIGBUS on the input "fault", echoes everything else.
pub const FAULT: TaskFn<String, String> = TaskFn::new("fault", fault);

/// Logs a line when a worker comes up.
pub const ANNOUNCE: Setup = Setup::new("announce", announce);

/// Every built-in task and setup, for [`run_worker`](crate::pool::process::run_worker).
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register(ECHO)
        .register(SLEEP)
        .register(FAIL)
        .register(FAULT)
        .register_setup(ANNOUNCE);
    registry
}

fn echo(input: String) -> Result<String, TaskError> {
    tracing::debug!(len = input.len(), "echo");
    Ok(input)
}

fn sleep(ms: u64) -> Result<u64, TaskError> {
    std::thread::sleep(Duration::from_millis(ms));
    tracing::info!(ms, "Slept");
    Ok(ms)
}

fn fail(input: String) -> Result<String, TaskError> {
    if input.starts_with("fail") {
        tracing::warn!(input = %input, "Refusing input");
        return Err(TaskError::failed(format!("refused '{}'", input)));
    }
    Ok(input)
}

fn fault(input: String) -> Result<String, TaskError> {
    if input != "fault" {
        return Ok(input);
    }
    // In a worker process the fault handler exits before this returns.
    // Worker threads block SIGBUS, so the signal stays pending instead.
    raise(Signal::SIGBUS).map_err(|e| TaskError::failed(e.to_string()))?;
    Err(TaskError::InputInaccessible)
}

fn announce(info: &WorkerInfo) -> Result<(), TaskError> {
    tracing::info!(worker = info.id, kind = %info.kind, "Worker ready");
    Ok(())
}
