//! Pool configuration.

use super::interrupt::Interrupt;
use super::task::Setup;
use crate::error::{PoolError, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

/// Whether workers are OS threads or OS processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerKind {
    #[default]
    Threads,
    Processes,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threads => write!(f, "threads"),
            Self::Processes => write!(f, "processes"),
        }
    }
}

/// What happens to the rest of the pool when a task fails.
///
/// Interrupts always terminate immediately regardless of this setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Kill workers right away; in-flight results would be thrown out anyway.
    #[default]
    Terminate,
    /// Discard queued tasks but let in-flight ones finish, so sibling workers
    /// can flush their own diagnostics before the failure is returned.
    Graceful,
}

impl FromStr for DrainPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "terminate" => Ok(Self::Terminate),
            "graceful" => Ok(Self::Graceful),
            _ => Err(format!(
                "Unknown drain policy: '{}'. Valid options: terminate, graceful",
                s
            )),
        }
    }
}

/// Progress bar settings, handed to `indicatif` as-is.
#[derive(Debug, Clone, Default)]
pub struct ProgressOptions {
    /// Bar length. Defaults to the number of task arguments.
    pub total: Option<u64>,
    /// Text shown next to the bar.
    pub message: String,
    /// Custom `indicatif` template.
    pub template: Option<String>,
    /// Draw nothing (the bar still counts).
    pub hidden: bool,
}

const DEFAULT_TEMPLATE: &str = "  {msg} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) [{elapsed_precise}]";

impl ProgressOptions {
    pub fn hidden() -> Self {
        Self {
            hidden: true,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Build the bar for a batch of `task_count` tasks.
    pub fn build(&self, task_count: usize) -> Result<ProgressBar> {
        let bar = ProgressBar::with_draw_target(
            Some(self.total.unwrap_or(task_count as u64)),
            if self.hidden {
                ProgressDrawTarget::hidden()
            } else {
                ProgressDrawTarget::stderr()
            },
        );
        let style = ProgressStyle::default_bar()
            .template(self.template.as_deref().unwrap_or(DEFAULT_TEMPLATE))
            .map_err(|e| PoolError::Config(format!("invalid progress template: {}", e)))?
            .progress_chars("█▓▒░  ");
        bar.set_style(style);
        bar.set_message(self.message.clone());
        Ok(bar)
    }
}

/// How worker processes are launched.
///
/// The spawned program must route its worker arguments to
/// [`run_worker`](crate::pool::process::run_worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Arguments placed before the worker arguments (e.g. a subcommand).
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable, re-entered through its `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            PoolError::Config(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe).arg("worker"))
    }
}

/// Configuration for one [`execute_pool`](crate::pool::execute_pool) call.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub kind: WorkerKind,
    /// Fixed pool size; must be at least 1.
    pub worker_count: usize,
    pub progress: ProgressOptions,
    pub setup: Option<Setup>,
    pub drain: DrainPolicy,
    pub interrupt: Interrupt,
    /// Launch command for process workers (None = current executable).
    pub worker_command: Option<WorkerCommand>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: WorkerKind::Threads,
            worker_count: default_worker_count(),
            progress: ProgressOptions::default(),
            setup: None,
            drain: DrainPolicy::Terminate,
            interrupt: Interrupt::new(),
            worker_command: None,
        }
    }
}

impl PoolConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: WorkerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Shorthand for choosing process isolation.
    pub fn use_processes(self, enabled: bool) -> Self {
        self.with_kind(if enabled {
            WorkerKind::Processes
        } else {
            WorkerKind::Threads
        })
    }

    pub fn with_progress(mut self, progress: ProgressOptions) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_setup(mut self, setup: Setup) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn with_drain(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(PoolError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the launch command for process workers.
    pub(crate) fn resolved_worker_command(&self) -> Result<WorkerCommand> {
        match self.worker_command {
            Some(ref command) => Ok(command.clone()),
            None => WorkerCommand::current_exe(),
        }
    }
}

/// Number of available CPUs, falling back to 4.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.kind, WorkerKind::Threads);
        assert_eq!(config.drain, DrainPolicy::Terminate);
        assert!(config.worker_count >= 1);
        assert!(config.setup.is_none());
        assert!(config.worker_command.is_none());
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(3)
            .use_processes(true)
            .with_drain(DrainPolicy::Graceful)
            .with_worker_command(WorkerCommand::new("/bin/worker").arg("work"));

        assert_eq!(config.worker_count, 3);
        assert_eq!(config.kind, WorkerKind::Processes);
        assert_eq!(config.drain, DrainPolicy::Graceful);
        let command = config.resolved_worker_command().unwrap();
        assert_eq!(command.program, PathBuf::from("/bin/worker"));
        assert_eq!(command.args, vec![OsString::from("work")]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = PoolConfig::new(0).validate().unwrap_err();
        assert!(err.to_string().contains("at least 1"));
        assert!(PoolConfig::new(1).validate().is_ok());
    }

    #[test]
    fn test_drain_policy_from_str() {
        assert_eq!(
            "graceful".parse::<DrainPolicy>().unwrap(),
            DrainPolicy::Graceful
        );
        assert_eq!(
            "TERMINATE".parse::<DrainPolicy>().unwrap(),
            DrainPolicy::Terminate
        );
        assert!("later".parse::<DrainPolicy>().is_err());
    }

    #[test]
    fn test_progress_bar_length() {
        let bar = ProgressOptions::hidden().build(7).unwrap();
        assert_eq!(bar.length(), Some(7));

        let bar = ProgressOptions::hidden().with_total(100).build(7).unwrap();
        assert_eq!(bar.length(), Some(100));
    }
}
