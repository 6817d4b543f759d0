//! Why a worker process went away.

use crate::error::{PoolError, TaskError};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// The fault handler reported a bus error on the protocol stream.
    Faulted,
    /// Killed by SIGBUS before the handler was installed.
    BusError,
    /// SIGKILL, from the pool's own teardown or from the OOM killer.
    Killed,
    /// Killed by another signal.
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Whether the worker lost access to an input file.
    pub fn is_input_fault(&self) -> bool {
        matches!(self, Self::Faulted | Self::BusError)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Faulted => "reported a memory-access fault".to_string(),
            Self::BusError => "killed by SIGBUS".to_string(),
            Self::Killed => "killed by SIGKILL".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }

    /// The error the parent reports for a worker that died mid-task.
    pub fn into_error(self, worker: usize) -> PoolError {
        if self.is_input_fault() {
            PoolError::Task(TaskError::InputInaccessible)
        } else {
            PoolError::WorkerDied {
                worker,
                reason: self.description(),
            }
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify a reaped worker. A fault is only ever inferred from SIGBUS
/// itself: an exit status is under the task's control.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGBUS, _) => TerminationReason::BusError,
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::Killed,
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
