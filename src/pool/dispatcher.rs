//! `execute_pool`: run one batch of tasks on a fresh pool.

use super::WorkerEvent;
use super::aggregator::{AggregatorStats, LogAggregator, RecordSink, TracingSink};
use super::config::{DrainPolicy, PoolConfig, WorkerKind};
use super::initializer::WorkerInitializer;
use super::interrupt::Interrupt;
use super::log_channel::LogChannel;
use super::process::ProcessPool;
use super::task::TaskFn;
use super::threads::ThreadPool;
use crate::error::{PoolError, Result};
use crate::logging;
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use indicatif::ProgressBar;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Run `task` once for every item of `task_arguments` on a pool of
/// `config.worker_count` workers and block until the batch is done.
///
/// Results are handed to `on_task_complete` on the calling thread, in
/// completion order, together with the progress bar; the callback decides
/// how far to advance it. Without a callback the bar advances by one per
/// result and results are dropped.
///
/// The first task failure, worker failure or interrupt ends the batch and is
/// returned. Whatever happens, by the time this returns every worker has
/// been stopped and joined and every log record they produced has been
/// re-emitted.
///
/// ```no_run
/// use batchpool::{PoolConfig, TaskError, TaskFn, execute_pool};
///
/// fn count_words(text: String) -> Result<usize, TaskError> {
///     Ok(text.split_whitespace().count())
/// }
///
/// let mut total = 0;
/// execute_pool(
///     &PoolConfig::new(4),
///     TaskFn::new("count_words", count_words),
///     vec!["one two".to_string(), "three".to_string()],
///     Some(|words: usize, pbar: &indicatif::ProgressBar| {
///         total += words;
///         pbar.inc(1);
///     }),
/// )?;
/// assert_eq!(total, 3);
/// # Ok::<(), batchpool::PoolError>(())
/// ```
pub fn execute_pool<I, O, C>(
    config: &PoolConfig,
    task: TaskFn<I, O>,
    task_arguments: impl IntoIterator<Item = I>,
    on_task_complete: Option<C>,
) -> Result<()>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    C: FnMut(O, &ProgressBar),
{
    execute_pool_with_sink(config, task, task_arguments, on_task_complete, TracingSink)
}

/// [`execute_pool`] with a custom destination for worker log records.
pub fn execute_pool_with_sink<I, O, C, S>(
    config: &PoolConfig,
    task: TaskFn<I, O>,
    task_arguments: impl IntoIterator<Item = I>,
    on_task_complete: Option<C>,
    sink: S,
) -> Result<()>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    C: FnMut(O, &ProgressBar),
    S: RecordSink,
{
    config.validate()?;
    let arguments: Vec<I> = task_arguments.into_iter().collect();
    let progress = config.progress.build(arguments.len())?;

    let mut logs = LogRoute::open(sink)?;
    let result = run_batch(
        config,
        task,
        arguments,
        &progress,
        on_task_complete,
        &logs.channel,
    );
    let stats = logs.close();

    tracing::debug!(
        forwarded = stats.forwarded,
        failed = stats.failed,
        "Worker log records re-emitted"
    );
    match result {
        Ok(()) => progress.finish(),
        Err(_) => progress.abandon(),
    }
    result
}

/// Log channel plus its aggregator, closed in that order on every exit path.
struct LogRoute {
    channel: LogChannel,
    aggregator: Option<LogAggregator>,
}

impl LogRoute {
    fn open<S: RecordSink>(sink: S) -> Result<Self> {
        let mut channel = LogChannel::new();
        let receiver = channel
            .take_receiver()
            .ok_or_else(|| PoolError::Worker("log receiver already taken".into()))?;
        let aggregator = LogAggregator::spawn(receiver, sink)?;
        Ok(Self {
            channel,
            aggregator: Some(aggregator),
        })
    }

    /// Send the sentinel and wait for the aggregator to drain.
    fn close(&mut self) -> AggregatorStats {
        self.channel.close();
        self.aggregator
            .take()
            .map(LogAggregator::join)
            .unwrap_or_default()
    }
}

impl Drop for LogRoute {
    fn drop(&mut self) {
        self.close();
    }
}

/// The running pool, whichever kind it is.
enum Workers {
    Threads(ThreadPool),
    Processes(ProcessPool),
}

impl Workers {
    fn stop_accepting(&self) {
        match self {
            Self::Threads(pool) => pool.stop_accepting(),
            Self::Processes(pool) => pool.stop_accepting(),
        }
    }

    fn terminate(&mut self) {
        match self {
            Self::Threads(pool) => pool.terminate(),
            Self::Processes(pool) => pool.terminate(),
        }
    }

    fn join(&mut self) {
        match self {
            Self::Threads(pool) => pool.join(),
            Self::Processes(pool) => pool.join(),
        }
    }
}

/// A started pool and the receiving end of its events.
///
/// Fields drop in declaration order: when a panicking callback unwinds
/// through [`run_batch`], the receiver goes first so no worker stays blocked
/// reporting to it while the pool terminates and joins itself.
struct Batch<O> {
    events: Receiver<WorkerEvent<O>>,
    workers: Workers,
}

impl<O> Batch<O> {
    /// Stop the pool after a failure, honouring the drain policy. Workers
    /// must already have stopped accepting work.
    fn stop(&mut self, error: &PoolError, drain: DrainPolicy, discarded: usize) {
        if !error.is_interrupt() && drain == DrainPolicy::Graceful {
            tracing::debug!(discarded, "Batch failed, letting in-flight tasks finish");
        } else {
            tracing::debug!(discarded, error = %error, "Batch stopped, terminating workers");
            self.workers.terminate();
        }
    }

    /// Join every worker. Nobody reads events past this point.
    fn finish(self) {
        let Batch { events, mut workers } = self;
        drop(events);
        workers.join();
    }
}

/// Start the pool, feed it, collect results and tear it down.
///
/// Workers are joined before this returns, also when it unwinds out of a
/// panicking callback: each pool kind terminates itself on drop.
fn run_batch<I, O, C>(
    config: &PoolConfig,
    task: TaskFn<I, O>,
    arguments: Vec<I>,
    progress: &ProgressBar,
    on_task_complete: Option<C>,
    logs: &LogChannel,
) -> Result<()>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    C: FnMut(O, &ProgressBar),
{
    let total = arguments.len();
    let (work_tx, work_rx) = unbounded::<(u64, I)>();
    let (event_tx, event_rx) = bounded::<WorkerEvent<O>>(config.worker_count);

    // Triggers that arrived while no batch was running belong to no batch.
    if config.interrupt.clear() {
        tracing::debug!("Discarded an interrupt raised before the batch started");
    }

    let initializer = WorkerInitializer::new(config.kind, config.setup, logging::current_level());
    let workers = match config.kind {
        WorkerKind::Threads => Workers::Threads(ThreadPool::start(
            config.worker_count,
            initializer,
            task,
            work_rx.clone(),
            event_tx,
        )?),
        WorkerKind::Processes => Workers::Processes(ProcessPool::start(
            config.worker_count,
            &config.resolved_worker_command()?,
            &initializer,
            task,
            work_rx.clone(),
            event_tx,
            logs.sender(),
        )?),
    };
    let mut batch = Batch {
        events: event_rx,
        workers,
    };
    tracing::debug!(
        task = task.name,
        kind = %config.kind,
        workers = config.worker_count,
        tasks = total,
        "Dispatching batch"
    );

    for (seq, argument) in arguments.into_iter().enumerate() {
        // Cannot fail: `work_rx` is still alive.
        let _ = work_tx.send((seq as u64, argument));
    }
    drop(work_tx);

    let result = collect(
        &batch.events,
        &config.interrupt,
        total,
        progress,
        on_task_complete,
    );

    if let Err(ref e) = result {
        batch.workers.stop_accepting();
        let discarded = work_rx.try_iter().count();
        batch.stop(e, config.drain, discarded);
    }
    batch.finish();
    result
}

/// Wait for `total` results, the first failure or an interrupt.
fn collect<O, C>(
    events: &Receiver<WorkerEvent<O>>,
    interrupt: &Interrupt,
    total: usize,
    progress: &ProgressBar,
    mut on_task_complete: Option<C>,
) -> Result<()>
where
    C: FnMut(O, &ProgressBar),
{
    let mut remaining = total;
    while remaining > 0 {
        select! {
            recv(events) -> event => match event {
                Ok(WorkerEvent::Finished { worker, seq, outcome }) => {
                    remaining -= 1;
                    let output = outcome.inspect_err(|e| {
                        tracing::debug!(worker, seq, error = %e, "Task failed");
                    })?;
                    match on_task_complete.as_mut() {
                        Some(callback) => callback(output, progress),
                        None => progress.inc(1),
                    }
                }
                Ok(WorkerEvent::Failed { worker, error }) => {
                    tracing::debug!(worker, error = %error, "Worker failed");
                    return Err(error);
                }
                Err(_) => {
                    return Err(PoolError::Worker(format!(
                        "all workers exited with {} task(s) outstanding",
                        remaining
                    )));
                }
            },
            recv(interrupt.receiver()) -> _ => return Err(PoolError::Interrupted),
        }
    }
    Ok(())
}
