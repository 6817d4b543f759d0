//! Worker process and driver thread spawning.

use super::proc::Proc;
use super::worker_main::WorkerArgs;
use crate::error::{PoolError, Result};
use crate::pool::config::WorkerCommand;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;

/// Launch one worker process.
///
/// stdin and stdout carry the protocol; stderr is shared with the parent
/// so anything the worker prints there outside of logging stays visible.
pub fn spawn_worker(command: &WorkerCommand, args: &WorkerArgs) -> Result<Proc> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.args(args.to_args());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| {
        PoolError::Worker(format!(
            "Failed to spawn worker {} ({}): {}",
            args.worker_id,
            command.program.display(),
            e
        ))
    })?;

    Proc::from_child(child)
}

/// Spawn the parent-side thread that drives one worker process.
pub fn spawn_driver_thread<F>(worker: usize, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("pool-driver-{}", worker))
        .spawn(f)
        .map_err(|e| PoolError::Worker(format!("Failed to spawn driver thread: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_is_reported() {
        let command = WorkerCommand::new("/nonexistent/batchpool-worker");
        let args = WorkerArgs::new("echo", 3);
        let err = spawn_worker(&command, &args).err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("worker 3"));
        assert!(msg.contains("/nonexistent/batchpool-worker"));
    }
}
