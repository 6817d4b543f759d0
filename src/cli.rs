//! Command-line interface definitions using clap.

use batchpool::DrainPolicy;
use batchpool::pool::process::WorkerArgs;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

/// Run a batch of built-in tasks on a pool of threads or processes.
#[derive(Parser, Debug)]
#[command(name = "batchpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task once per argument.
    Run(RunArgs),

    /// List the built-in tasks.
    Tasks,

    /// Serve as a pool worker process (started by `run --processes`).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task to run.
    #[arg(short, long, value_enum, default_value_t = TaskName::Echo)]
    pub task: TaskName,

    /// Task arguments, one task each.
    pub args: Vec<String>,

    /// Number of workers (default: number of CPUs).
    #[arg(short = 'j', long, env = "BATCHPOOL_WORKERS")]
    pub workers: Option<usize>,

    /// Run every worker in its own process.
    #[arg(long, env = "BATCHPOOL_PROCESSES")]
    pub processes: bool,

    /// On task failure: terminate workers, or let in-flight tasks finish.
    #[arg(long, env = "BATCHPOOL_DRAIN", default_value = "terminate")]
    pub drain: DrainPolicy,

    /// Run the `announce` setup in every worker.
    #[arg(long)]
    pub announce: bool,

    /// Do not draw a progress bar.
    #[arg(long)]
    pub no_progress: bool,

    /// Print each result as a JSON value.
    #[arg(long)]
    pub json: bool,
}

/// Built-in tasks selectable from the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskName {
    /// Print each argument back.
    Echo,
    /// Sleep for each argument's number of milliseconds.
    Sleep,
    /// Fail on arguments starting with "fail".
    Fail,
    /// Raise SIGBUS on the argument "fault" (use with --processes).
    Fault,
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and errors.
    Normal,
    /// -v: include worker progress messages.
    Info,
    /// -vv: include pool lifecycle details.
    Debug,
}

impl Verbosity {
    pub fn level(self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::WARN,
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
        }
    }
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["batchpool", "run", "a", "b"]).unwrap();
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.task, TaskName::Echo);
                assert_eq!(run.args, vec!["a", "b"]);
                assert_eq!(run.drain, DrainPolicy::Terminate);
                assert!(!run.processes);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_options() {
        let cli = Cli::try_parse_from([
            "batchpool",
            "-vv",
            "run",
            "--task",
            "sleep",
            "-j",
            "3",
            "--processes",
            "--drain",
            "graceful",
            "10",
        ])
        .unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Debug);
        match cli.command {
            Commands::Run(run) => {
                assert_eq!(run.task, TaskName::Sleep);
                assert_eq!(run.workers, Some(3));
                assert!(run.processes);
                assert_eq!(run.drain, DrainPolicy::Graceful);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_worker_command() {
        let cli = Cli::try_parse_from([
            "batchpool",
            "worker",
            "--task",
            "echo",
            "--worker-id",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Worker(worker) => {
                assert_eq!(worker.task, "echo");
                assert_eq!(worker.worker_id, 2);
                assert_eq!(worker.log_level(), None);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["batchpool", "-q", "-v", "tasks"]).is_err());
        let cli = Cli::try_parse_from(["batchpool", "-q", "tasks"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Quiet);
        assert_eq!(cli.verbosity().level(), Level::ERROR);
    }

    #[test]
    fn test_bad_drain_policy() {
        assert!(Cli::try_parse_from(["batchpool", "run", "--drain", "later"]).is_err());
    }
}
