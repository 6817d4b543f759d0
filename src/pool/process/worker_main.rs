//! Entry point of a worker process.
//!
//! The executable named by the pool's [`WorkerCommand`] routes its worker
//! arguments here. The worker initializes itself, reports `ready`, then runs
//! one task per `run` request until it is told to exit or its stdin closes.
//!
//! [`WorkerCommand`]: crate::pool::WorkerCommand

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::Result;
use crate::logging::parse_level;
use crate::pool::aggregator::panic_message;
use crate::pool::config::WorkerKind;
use crate::pool::initializer::WorkerInitializer;
use crate::pool::log_channel::{ForwardRecord, LogRecord};
use crate::pool::task::TaskRegistry;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::Level;

/// Command-line arguments the parent passes to a worker process.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Registered name of the task to run.
    #[arg(long)]
    pub task: String,

    /// Registered name of the per-worker setup.
    #[arg(long)]
    pub setup: Option<String>,

    /// Index of this worker within its pool.
    #[arg(long, default_value_t = 0)]
    pub worker_id: usize,

    /// Most verbose level to forward to the parent ("off" forwards nothing).
    #[arg(long, default_value = "off")]
    pub log_level: String,
}

impl WorkerArgs {
    pub fn new(task: impl Into<String>, worker_id: usize) -> Self {
        Self {
            task: task.into(),
            setup: None,
            worker_id,
            log_level: "off".to_string(),
        }
    }

    pub fn with_setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    pub fn with_log_level(mut self, level: Option<Level>) -> Self {
        self.log_level = match level {
            Some(level) => level.as_str().to_lowercase(),
            None => "off".to_string(),
        };
        self
    }

    pub fn log_level(&self) -> Option<Level> {
        parse_level(&self.log_level)
    }

    /// Render back into command-line form.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--task".to_string(),
            self.task.clone(),
            "--worker-id".to_string(),
            self.worker_id.to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ];
        if let Some(setup) = &self.setup {
            args.push("--setup".to_string());
            args.push(setup.clone());
        }
        args
    }
}

type SharedWriter = Arc<Mutex<LineWriter>>;

/// Sends the worker's log records up the protocol pipe.
struct PipeLog {
    writer: SharedWriter,
}

impl ForwardRecord for PipeLog {
    fn forward(&self, record: LogRecord) {
        let _ = respond(&self.writer, &WorkResponse::Log { record });
    }
}

fn respond(writer: &SharedWriter, response: &WorkResponse) -> Result<()> {
    let line = response.to_line()?;
    writer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .write_line(&line)?;
    Ok(())
}

/// Run the worker process. Never returns.
pub fn run_worker(args: &WorkerArgs, registry: &TaskRegistry) -> ! {
    // Safety: fds 0 and 1 are the protocol pipes the parent set up, and
    // nothing else in this process reads stdin or writes stdout through
    // Rust's handles.
    let reader = LineReader::new(unsafe { PipeFd::from_raw(0) });
    let writer = Arc::new(Mutex::new(LineWriter::new(unsafe { PipeFd::from_raw(1) })));

    match serve(args, registry, reader, writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

fn serve(
    args: &WorkerArgs,
    registry: &TaskRegistry,
    mut reader: LineReader,
    writer: SharedWriter,
) -> Result<()> {
    let setup = match args.setup.as_deref().map(|name| registry.setup(name)).transpose() {
        Ok(setup) => setup,
        Err(e) => return respond(&writer, &WorkResponse::init_failed(e.to_string())),
    };
    if !registry.contains_task(&args.task) {
        let message = format!("Unknown task '{}'", args.task);
        return respond(&writer, &WorkResponse::init_failed(message));
    }

    let initializer = WorkerInitializer::new(WorkerKind::Processes, setup, args.log_level());
    let forward = PipeLog {
        writer: Arc::clone(&writer),
    };
    let _logging = match initializer.init_process(args.worker_id, forward) {
        Ok(guard) => guard,
        Err(e) => return respond(&writer, &WorkResponse::init_failed(e.to_string())),
    };

    respond(&writer, &WorkResponse::Ready)?;

    loop {
        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            None => return Ok(()),
        };

        match WorkRequest::from_line(&line) {
            Ok(WorkRequest::Exit) => return Ok(()),
            Ok(WorkRequest::Run { seq, input }) => {
                let response = run_task(registry, &args.task, seq, input)?;
                respond(&writer, &response)?;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring invalid request"),
        }
    }
}

fn run_task(registry: &TaskRegistry, task: &str, seq: u64, input: Value) -> Result<WorkResponse> {
    match catch_unwind(AssertUnwindSafe(|| registry.run(task, input))) {
        Ok(outcome) => Ok(match outcome? {
            Ok(output) => WorkResponse::Result { seq, output },
            Err(error) => WorkResponse::Error { seq, error },
        }),
        Err(panic) => Ok(WorkResponse::Panicked {
            seq,
            message: panic_message(&*panic),
        }),
    }
}
