//! Live worker processes, so teardown can kill them from any thread.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared map from worker id to the pid of its live process.
///
/// A pid leaves the table before its process is reaped, so [`kill_all`]
/// never signals a pid that could have been reused.
///
/// [`kill_all`]: ProcessTable::kill_all
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    workers: Arc<Mutex<HashMap<usize, Pid>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Pid>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, worker: usize, pid: Pid) {
        self.lock().insert(worker, pid);
        tracing::debug!(worker, pid = pid.as_raw(), "Registered worker process");
    }

    /// Forget a worker. Call before reaping its process.
    pub fn unregister(&self, worker: usize) {
        if let Some(pid) = self.lock().remove(&worker) {
            tracing::debug!(worker, pid = pid.as_raw(), "Unregistered worker process");
        }
    }

    /// SIGKILL every registered process. Returns how many were signalled.
    ///
    /// The processes stay registered; their drivers see EOF, unregister and
    /// reap them.
    pub fn kill_all(&self) -> usize {
        let workers = self.lock();
        let mut killed = 0;
        for (&worker, &pid) in workers.iter() {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => killed += 1,
                Err(e) => tracing::debug!(worker, error = %e, "Failed to kill worker process"),
            }
        }
        killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitStatus, waitpid};
    use std::process::Command;

    #[test]
    fn test_kill_all_signals_live_processes() {
        let child = Command::new("sleep").arg("60").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let table = ProcessTable::new();
        table.register(0, pid);
        assert_eq!(table.kill_all(), 1);

        table.unregister(0);
        assert_eq!(table.kill_all(), 0);
        assert!(matches!(
            waitpid(pid, None).unwrap(),
            WaitStatus::Signaled(_, Signal::SIGKILL, _)
        ));
    }
}
