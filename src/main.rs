//! batchpool - batch task runner

mod cli;

use anyhow::{Context, Result};
use batchpool::logging::{self, LogConfig};
use batchpool::pool::process::run_worker;
use batchpool::{
    Interrupt, PoolConfig, PoolError, ProgressOptions, TaskFn, builtin, execute_pool,
};
use clap::Parser;
use indicatif::ProgressBar;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;

use cli::{Cli, Commands, RunArgs, TaskName};

/// Exit status after Ctrl+C, as shells report for SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Worker(args) => run_worker(args, &builtin::registry()),
        Commands::Tasks => cmd_tasks(),
        Commands::Run(args) => {
            init_logging(&cli);
            cmd_run(args)
        }
    };

    if let Err(e) = result {
        let interrupted = e
            .downcast_ref::<PoolError>()
            .is_some_and(PoolError::is_interrupt);

        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(if interrupted { EXIT_INTERRUPTED } else { 1 });
    }
}

fn init_logging(cli: &Cli) {
    let config = LogConfig::new()
        .with_level(cli.verbosity().level())
        .with_env_overrides();
    logging::init_with_file(config);
}

fn cmd_tasks() -> Result<()> {
    for name in builtin::registry().task_names() {
        println!("{}", name);
    }
    Ok(())
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let mut config = PoolConfig::default()
        .use_processes(args.processes)
        .with_drain(args.drain)
        .with_interrupt(Interrupt::ctrlc()?);
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if args.announce {
        config = config.with_setup(builtin::ANNOUNCE);
    }
    config = config.with_progress(if args.no_progress {
        ProgressOptions::hidden()
    } else {
        ProgressOptions::default().with_message(format!("{:?}", args.task).to_lowercase())
    });

    match args.task {
        TaskName::Echo => run_and_print(&config, builtin::ECHO, args.args.clone(), args.json),
        TaskName::Fail => run_and_print(&config, builtin::FAIL, args.args.clone(), args.json),
        TaskName::Fault => run_and_print(&config, builtin::FAULT, args.args.clone(), args.json),
        TaskName::Sleep => {
            let durations = args
                .args
                .iter()
                .map(|arg| {
                    arg.parse::<u64>()
                        .with_context(|| format!("'{}' is not a number of milliseconds", arg))
                })
                .collect::<Result<Vec<_>>>()?;
            run_and_print(&config, builtin::SLEEP, durations, args.json)
        }
    }
}

/// Run the batch, printing each result as it completes.
fn run_and_print<I, O>(config: &PoolConfig, task: TaskFn<I, O>, inputs: Vec<I>, json: bool) -> Result<()>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Display + Send + 'static,
{
    let count = inputs.len();
    let print = |output: O, pbar: &ProgressBar| {
        let line = if json {
            serde_json::to_string(&output).unwrap_or_else(|e| format!("<unserializable: {}>", e))
        } else {
            output.to_string()
        };
        pbar.suspend(|| println!("{}", line));
        pbar.inc(1);
    };

    execute_pool(config, task, inputs, Some(print))
        .with_context(|| format!("Task '{}' did not complete", task.name))?;

    tracing::info!(task = task.name, count, "Batch complete");
    Ok(())
}
