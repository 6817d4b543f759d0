//! Per-worker initialization.
//!
//! Every worker runs its initializer exactly once, before it accepts a task:
//! it applies the [`FaultPolicy`] for its kind, redirects logging when it
//! lives in its own process, and then calls the user's [`Setup`].

use super::config::WorkerKind;
use super::log_channel::{ForwardLayer, ForwardRecord};
use super::process::protocol::FAULT_LINE;
use super::task::{Setup, WorkerInfo};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;

/// Exit status of a worker process that was stopped by a memory-access fault.
///
/// Informational only: the parent recognizes a fault by the line the handler
/// writes, not by this status.
pub const FAULT_EXIT_CODE: i32 = 86;

/// Signal disposition applied to a worker at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Worker process: ignore SIGINT and SIGPIPE, report SIGBUS to the parent
    /// as [`TaskError::InputInaccessible`](crate::TaskError::InputInaccessible).
    Process,
    /// Worker thread: block SIGBUS so the main thread receives it.
    Thread,
}

impl FaultPolicy {
    pub fn for_kind(kind: WorkerKind) -> Self {
        match kind {
            WorkerKind::Processes => Self::Process,
            WorkerKind::Threads => Self::Thread,
        }
    }

    /// Install the policy for the calling worker.
    pub fn apply(self) -> Result<()> {
        match self {
            Self::Process => {
                // Safety: SIG_IGN dispositions and a handler that only calls
                // async-signal-safe functions (write, _exit).
                unsafe {
                    signal::signal(Signal::SIGINT, SigHandler::SigIgn)?;
                    signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
                    let action = SigAction::new(
                        SigHandler::Handler(report_fault_and_exit),
                        SaFlags::SA_RESETHAND,
                        SigSet::empty(),
                    );
                    signal::sigaction(Signal::SIGBUS, &action)?;
                }
            }
            Self::Thread => {
                let mut blocked = SigSet::empty();
                blocked.add(Signal::SIGBUS);
                signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), None)?;
            }
        }
        Ok(())
    }
}

/// SIGBUS handler for worker processes.
///
/// The task cannot be resumed after a bus error, so the handler reports the
/// fault on the protocol stream and exits; the parent turns the report into
/// the failure of the task that was running.
extern "C" fn report_fault_and_exit(_signal: libc::c_int) {
    // Safety: write(2) and _exit(2) are async-signal-safe; fd 1 is the
    // worker's protocol pipe.
    unsafe {
        libc::write(
            libc::STDOUT_FILENO,
            FAULT_LINE.as_ptr().cast(),
            FAULT_LINE.len(),
        );
        libc::_exit(FAULT_EXIT_CODE);
    }
}

/// Everything a worker needs to prepare itself.
#[derive(Debug, Clone, Copy)]
pub struct WorkerInitializer {
    kind: WorkerKind,
    setup: Option<Setup>,
    /// Level the parent logs at; `None` means logging is off.
    log_level: Option<Level>,
}

impl WorkerInitializer {
    pub fn new(kind: WorkerKind, setup: Option<Setup>, log_level: Option<Level>) -> Self {
        Self {
            kind,
            setup,
            log_level,
        }
    }

    pub fn setup(&self) -> Option<Setup> {
        self.setup
    }

    pub fn log_level(&self) -> Option<Level> {
        self.log_level
    }

    /// Initialize a worker thread. Logging is shared with the parent
    /// already, so only the fault policy and setup apply.
    pub fn init_thread(&self, id: usize) -> Result<()> {
        self.fault_policy().apply()?;
        self.run_setup(id)
    }

    /// Initialize a worker process.
    ///
    /// Returns the guard of the worker's own logging dispatcher, which sends
    /// every record through `forward`. Dropping the guard ends redirection.
    pub fn init_process<F: ForwardRecord>(&self, id: usize, forward: F) -> Result<DefaultGuard> {
        self.fault_policy().apply()?;

        let filter = match self.log_level {
            Some(level) => LevelFilter::from_level(level),
            None => LevelFilter::OFF,
        };
        let subscriber =
            tracing_subscriber::registry().with(ForwardLayer::new(forward).with_filter(filter));
        let guard = tracing::subscriber::set_default(subscriber);

        self.run_setup(id)?;
        Ok(guard)
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        FaultPolicy::for_kind(self.kind)
    }

    fn run_setup(&self, id: usize) -> Result<()> {
        let Some(setup) = self.setup else {
            return Ok(());
        };
        let info = WorkerInfo {
            id,
            kind: self.kind,
        };
        tracing::debug!(worker = id, setup = setup.name, "Running worker setup");
        (setup.run)(&info).map_err(|e| PoolError::WorkerInit {
            worker: id,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::pool::log_channel::{LogChannel, LogMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SETUP_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_setup(info: &WorkerInfo) -> std::result::Result<(), TaskError> {
        assert_eq!(info.kind, WorkerKind::Threads);
        SETUP_CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn failing_setup(_: &WorkerInfo) -> std::result::Result<(), TaskError> {
        Err(TaskError::failed("missing cache directory"))
    }

    #[test]
    fn test_fault_policy_for_kind() {
        assert_eq!(
            FaultPolicy::for_kind(WorkerKind::Processes),
            FaultPolicy::Process
        );
        assert_eq!(
            FaultPolicy::for_kind(WorkerKind::Threads),
            FaultPolicy::Thread
        );
    }

    #[test]
    fn test_initializer_picks_policy_from_kind() {
        let threads = WorkerInitializer::new(WorkerKind::Threads, None, None);
        assert_eq!(threads.fault_policy(), FaultPolicy::Thread);
        let processes = WorkerInitializer::new(WorkerKind::Processes, None, None);
        assert_eq!(processes.fault_policy(), FaultPolicy::Process);
    }

    #[test]
    fn test_thread_policy_blocks_sigbus() {
        std::thread::spawn(|| {
            FaultPolicy::Thread.apply().unwrap();
            let current = SigSet::thread_get_mask().unwrap();
            assert!(current.contains(Signal::SIGBUS));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_init_thread_runs_setup() {
        let init = WorkerInitializer::new(
            WorkerKind::Threads,
            Some(Setup::new("count", counting_setup)),
            Some(Level::INFO),
        );
        std::thread::spawn(move || init.init_thread(0).unwrap())
            .join()
            .unwrap();
        assert_eq!(SETUP_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_setup_failure_names_worker() {
        let init = WorkerInitializer::new(
            WorkerKind::Threads,
            Some(Setup::new("fail", failing_setup)),
            None,
        );
        let err = std::thread::spawn(move || init.init_thread(5))
            .join()
            .unwrap()
            .unwrap_err();
        match err {
            PoolError::WorkerInit { worker, message } => {
                assert_eq!(worker, 5);
                assert!(message.contains("missing cache directory"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_redirected_logging_respects_level() {
        let mut channel = LogChannel::new();
        let rx = channel.take_receiver().unwrap();
        let sender = channel.sender();
        let init = WorkerInitializer::new(WorkerKind::Processes, None, Some(Level::INFO));

        // The process policy changes signal dispositions for the whole test
        // binary, so only the logging half is exercised here.
        let filter = LevelFilter::from_level(init.log_level().unwrap());
        let subscriber =
            tracing_subscriber::registry().with(ForwardLayer::new(sender).with_filter(filter));
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("hidden");
            tracing::info!("shown");
        });
        channel.close();

        match rx.recv() {
            Some(LogMessage::Record(record)) => assert_eq!(record.message, "shown"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.recv(), Some(LogMessage::Shutdown));
    }
}
