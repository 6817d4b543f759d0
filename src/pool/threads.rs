//! Thread-backed worker pool.

use super::WorkerEvent;
use super::aggregator::panic_message;
use super::initializer::WorkerInitializer;
use super::task::TaskFn;
use crate::error::{PoolError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

pub(crate) struct ThreadPool {
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ThreadPool {
    pub fn start<I, O>(
        count: usize,
        initializer: WorkerInitializer,
        task: TaskFn<I, O>,
        queue: Receiver<(u64, I)>,
        events: Sender<WorkerEvent<O>>,
    ) -> Result<Self>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            stop: Arc::new(AtomicBool::new(false)),
        };

        for id in 0..count {
            let worker = Worker {
                id,
                initializer,
                task,
                queue: queue.clone(),
                events: events.clone(),
                stop: Arc::clone(&pool.stop),
            };
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{}", id))
                .spawn(move || worker.run())?;
            pool.workers.push(handle);
        }

        tracing::debug!(workers = count, "Started worker threads");
        Ok(pool)
    }

    /// Let in-flight tasks finish but start no new ones.
    pub fn stop_accepting(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop now. Threads cannot be killed, so workers still inside a task
    /// are detached: they finish it, find nobody listening and exit.
    pub fn terminate(&mut self) {
        self.stop_accepting();
        let (idle, busy): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|w| w.is_finished());
        for worker in idle {
            let _ = worker.join();
        }
        if !busy.is_empty() {
            tracing::debug!(detached = busy.len(), "Detached worker threads still running a task");
        }
    }

    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Worker thread panicked outside of a task");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.terminate();
        }
    }
}

struct Worker<I, O> {
    id: usize,
    initializer: WorkerInitializer,
    task: TaskFn<I, O>,
    queue: Receiver<(u64, I)>,
    events: Sender<WorkerEvent<O>>,
    stop: Arc<AtomicBool>,
}

impl<I, O> Worker<I, O> {
    fn run(self) {
        let init = catch_unwind(AssertUnwindSafe(|| self.initializer.init_thread(self.id)))
            .unwrap_or_else(|panic| {
                Err(PoolError::WorkerInit {
                    worker: self.id,
                    message: format!("setup panicked: {}", panic_message(&*panic)),
                })
            });
        if let Err(error) = init {
            let _ = self.events.send(WorkerEvent::Failed {
                worker: self.id,
                error,
            });
            return;
        }

        loop {
            if self.stopping() {
                return;
            }
            let Ok((seq, input)) = self.queue.recv() else {
                return;
            };
            if self.stopping() {
                return;
            }

            let run = self.task.run;
            let outcome = match catch_unwind(AssertUnwindSafe(|| run(input))) {
                Ok(result) => result.map_err(PoolError::Task),
                Err(panic) => Err(PoolError::Panicked(panic_message(&*panic))),
            };

            let event = WorkerEvent::Finished {
                worker: self.id,
                seq,
                outcome,
            };
            if self.events.send(event).is_err() {
                return;
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}
