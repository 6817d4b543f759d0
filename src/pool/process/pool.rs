//! Process-backed worker pool.
//!
//! Each worker process has a driver thread in the parent. The driver pulls
//! tasks from the shared queue, sends them down the worker's stdin, forwards
//! the worker's log records to the log channel and reports results back to
//! the dispatcher.

use super::proc::{Incoming, Proc};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use super::spawn::{spawn_driver_thread, spawn_worker};
use super::table::ProcessTable;
use super::worker_main::WorkerArgs;
use crate::error::{PoolError, Result};
use crate::pool::WorkerEvent;
use crate::pool::config::WorkerCommand;
use crate::pool::initializer::WorkerInitializer;
use crate::pool::log_channel::{LogRecord, LogSender};
use crate::pool::task::TaskFn;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::Level;

/// How long an idle worker gets to honour an exit request.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Logger name for worker stdout lines that are not protocol messages.
const STRAY_OUTPUT_LOGGER: &str = "batchpool::worker::stdout";

pub(crate) struct ProcessPool {
    drivers: Vec<JoinHandle<()>>,
    table: ProcessTable,
    stop: Arc<AtomicBool>,
}

impl ProcessPool {
    /// Launch `count` worker processes and their drivers.
    pub fn start<I, O>(
        count: usize,
        command: &WorkerCommand,
        initializer: &WorkerInitializer,
        task: TaskFn<I, O>,
        queue: Receiver<(u64, I)>,
        events: Sender<WorkerEvent<O>>,
        logs: LogSender,
    ) -> Result<Self>
    where
        I: Serialize + Send + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        let mut pool = Self {
            drivers: Vec::with_capacity(count),
            table: ProcessTable::new(),
            stop: Arc::new(AtomicBool::new(false)),
        };

        // Spawn every process before any driver runs, so a launch failure
        // never leaves a half-started batch consuming tasks.
        let mut procs = Vec::with_capacity(count);
        for worker in 0..count {
            let mut args =
                WorkerArgs::new(task.name, worker).with_log_level(initializer.log_level());
            if let Some(setup) = initializer.setup() {
                args = args.with_setup(setup.name);
            }
            procs.push(spawn_worker(command, &args)?);
        }

        for (worker, proc) in procs.into_iter().enumerate() {
            pool.table.register(worker, proc.pid());
            let driver = Driver {
                worker,
                proc,
                table: pool.table.clone(),
                queue: queue.clone(),
                events: events.clone(),
                logs: logs.clone(),
                stop: Arc::clone(&pool.stop),
                _task: PhantomData,
            };
            match spawn_driver_thread(worker, move || driver.run()) {
                Ok(handle) => pool.drivers.push(handle),
                Err(e) => {
                    // The closure, and the process with it, is already gone.
                    pool.table.unregister(worker);
                    return Err(e);
                }
            }
        }

        tracing::debug!(workers = count, program = %command.program.display(), "Started worker processes");
        Ok(pool)
    }

    /// Let in-flight tasks finish but start no new ones.
    pub fn stop_accepting(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Kill every worker process now.
    pub fn terminate(&self) {
        self.stop_accepting();
        let killed = self.table.kill_all();
        tracing::debug!(killed, "Terminated worker processes");
    }

    /// Wait for every driver, which in turn reaps its process.
    pub fn join(&mut self) {
        for driver in self.drivers.drain(..) {
            if driver.join().is_err() {
                tracing::error!("Worker driver thread panicked");
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if !self.drivers.is_empty() {
            self.terminate();
            self.join();
        }
    }
}

/// How a driver's conversation with its worker ended.
enum Ended {
    /// The worker is alive and idle; ask it to exit.
    Idle,
    /// The worker is gone and already reaped.
    Reaped,
}

/// Result of handing one task to the worker.
enum Step<O> {
    Done(Result<O>),
    /// The worker died; the error describes why.
    Died(PoolError),
}

struct Driver<I, O> {
    worker: usize,
    proc: Proc,
    table: ProcessTable,
    queue: Receiver<(u64, I)>,
    events: Sender<WorkerEvent<O>>,
    logs: LogSender,
    stop: Arc<AtomicBool>,
    _task: PhantomData<fn(I) -> O>,
}

impl<I, O> Driver<I, O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    fn run(mut self) {
        if let Ended::Idle = self.drive() {
            self.table.unregister(self.worker);
            match self.proc.stop(EXIT_TIMEOUT) {
                Ok(status) => tracing::debug!(
                    worker = self.worker,
                    reason = %analyze_wait_status(status),
                    "Worker process exited"
                ),
                Err(e) => tracing::warn!(worker = self.worker, error = %e, "Failed to stop worker process"),
            }
        }
    }

    fn drive(&mut self) -> Ended {
        let worker = self.worker;

        let startup = match self.await_reply() {
            Ok(Some(WorkResponse::Ready)) => None,
            Ok(Some(WorkResponse::InitFailed { message })) => {
                Some(PoolError::WorkerInit { worker, message })
            }
            Ok(Some(other)) => Some(PoolError::Worker(format!(
                "Worker {} sent {:?} before it was ready",
                worker, other
            ))),
            Ok(None) => {
                let reason = self.reap();
                self.report(WorkerEvent::Failed {
                    worker,
                    error: PoolError::WorkerInit {
                        worker,
                        message: reason.description(),
                    },
                });
                return Ended::Reaped;
            }
            Err(e) => Some(e),
        };
        if let Some(error) = startup {
            self.report(WorkerEvent::Failed { worker, error });
            return Ended::Idle;
        }
        tracing::trace!(worker, "Worker process ready");

        loop {
            if self.stopping() {
                return Ended::Idle;
            }
            let Ok((seq, input)) = self.queue.recv() else {
                return Ended::Idle;
            };
            if self.stopping() {
                return Ended::Idle;
            }

            match self.run_one(seq, input) {
                Step::Done(outcome) => {
                    if !self.report(WorkerEvent::Finished {
                        worker,
                        seq,
                        outcome,
                    }) {
                        return Ended::Idle;
                    }
                }
                Step::Died(error) => {
                    self.report(WorkerEvent::Finished {
                        worker,
                        seq,
                        outcome: Err(error),
                    });
                    return Ended::Reaped;
                }
            }
        }
    }

    fn run_one(&mut self, seq: u64, input: I) -> Step<O> {
        let request = match serde_json::to_value(input) {
            Ok(input) => WorkRequest::run(seq, input),
            Err(e) => return Step::Done(Err(e.into())),
        };
        if self.proc.send(&request).is_err() {
            return self.died(false);
        }

        match self.await_reply() {
            Ok(Some(WorkResponse::Result { output, .. })) => {
                Step::Done(serde_json::from_value(output).map_err(PoolError::from))
            }
            Ok(Some(WorkResponse::Error { error, .. })) => Step::Done(Err(PoolError::Task(error))),
            Ok(Some(WorkResponse::Panicked { message, .. })) => {
                Step::Done(Err(PoolError::Panicked(message)))
            }
            Ok(Some(WorkResponse::Fault)) => self.died(true),
            Ok(None) => self.died(false),
            Ok(Some(other)) => Step::Done(Err(PoolError::Worker(format!(
                "Worker {} sent {:?} instead of a result",
                self.worker, other
            )))),
            Err(e) => {
                self.table.unregister(self.worker);
                let _ = self.proc.kill();
                Step::Died(e)
            }
        }
    }

    /// Read until a non-log response, forwarding log records on the way.
    fn await_reply(&mut self) -> Result<Option<WorkResponse>> {
        let worker = self.worker.to_string();
        loop {
            match self.proc.recv()? {
                None => return Ok(None),
                Some(Incoming::Response(WorkResponse::Log { record })) => {
                    self.logs.send(record.with_field("worker", worker.as_str()));
                }
                Some(Incoming::Stray(line)) => {
                    self.logs.send(
                        LogRecord::new(STRAY_OUTPUT_LOGGER, Level::WARN, line)
                            .with_field("worker", worker.as_str()),
                    );
                }
                Some(Incoming::Response(response)) => return Ok(Some(response)),
            }
        }
    }

    /// Reap a worker that stopped answering mid-task. Only the fault line
    /// or death by SIGBUS count as a fault; the exit code alone does not.
    fn died(&mut self, reported_fault: bool) -> Step<O> {
        let reason = if reported_fault {
            // The handler exits right after the line; make sure of it.
            self.table.unregister(self.worker);
            let _ = self.proc.kill();
            let _ = self.proc.wait();
            TerminationReason::Faulted
        } else {
            self.reap()
        };
        if !self.stopping() {
            tracing::warn!(worker = self.worker, reason = %reason, "Worker process died during a task");
        }
        Step::Died(reason.into_error(self.worker))
    }

    fn reap(&mut self) -> TerminationReason {
        self.table.unregister(self.worker);
        match self.proc.wait() {
            Ok(status) => analyze_wait_status(status),
            Err(_) => TerminationReason::Unknown,
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Hand an event to the dispatcher. False once it stopped listening.
    fn report(&self, event: WorkerEvent<O>) -> bool {
        self.events.send(event).is_ok()
    }
}
