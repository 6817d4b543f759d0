//! Task and setup functions, and the registry process workers resolve them from.
//!
//! Both are plain function pointers with a name. Threads call the pointer
//! directly; a worker process receives the name on its command line and
//! looks the function up in the [`TaskRegistry`] its executable was built with.

use super::config::WorkerKind;
use crate::error::{PoolError, Result, TaskError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// What a worker knows about itself while running setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Index of the worker within its pool, `0..worker_count`.
    pub id: usize,
    pub kind: WorkerKind,
}

/// A named task function.
pub struct TaskFn<I, O> {
    pub name: &'static str,
    pub run: fn(I) -> std::result::Result<O, TaskError>,
}

impl<I, O> TaskFn<I, O> {
    pub const fn new(name: &'static str, run: fn(I) -> std::result::Result<O, TaskError>) -> Self {
        Self { name, run }
    }
}

// Manual impls: derives would require `I: Clone`, `O: Clone`.
impl<I, O> Clone for TaskFn<I, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, O> Copy for TaskFn<I, O> {}

impl<I, O> fmt::Debug for TaskFn<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFn").field("name", &self.name).finish()
    }
}

/// A named per-worker setup callback, run once before the worker's first task.
#[derive(Clone, Copy)]
pub struct Setup {
    pub name: &'static str,
    pub run: fn(&WorkerInfo) -> std::result::Result<(), TaskError>,
}

impl Setup {
    pub const fn new(
        name: &'static str,
        run: fn(&WorkerInfo) -> std::result::Result<(), TaskError>,
    ) -> Self {
        Self { name, run }
    }
}

impl fmt::Debug for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setup").field("name", &self.name).finish()
    }
}

type ErasedTask = Box<dyn Fn(Value) -> std::result::Result<Value, TaskError> + Send + Sync>;

/// Lookup table used by worker processes.
///
/// The executable that hosts workers registers every task and setup the
/// parent may name, then hands the registry to
/// [`run_worker`](crate::pool::process::run_worker).
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, ErasedTask>,
    setups: HashMap<&'static str, Setup>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its name. A later registration with the same
    /// name replaces the earlier one.
    pub fn register<I, O>(&mut self, task: TaskFn<I, O>) -> &mut Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
    {
        let erased: ErasedTask = Box::new(move |input: Value| {
            let input: I = serde_json::from_value(input)
                .map_err(|e| TaskError::failed(format!("invalid input for '{}': {}", task.name, e)))?;
            let output = (task.run)(input)?;
            serde_json::to_value(output)
                .map_err(|e| TaskError::failed(format!("invalid output from '{}': {}", task.name, e)))
        });
        self.tasks.insert(task.name, erased);
        self
    }

    pub fn register_setup(&mut self, setup: Setup) -> &mut Self {
        self.setups.insert(setup.name, setup);
        self
    }

    pub fn contains_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tasks.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run the named task on a JSON payload.
    pub fn run(&self, name: &str, input: Value) -> Result<std::result::Result<Value, TaskError>> {
        let task = self
            .tasks
            .get(name)
            .ok_or_else(|| PoolError::UnknownTask(name.to_string()))?;
        Ok(task(input))
    }

    pub fn setup(&self, name: &str) -> Result<Setup> {
        self.setups
            .get(name)
            .copied()
            .ok_or_else(|| PoolError::UnknownTask(name.to_string()))
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = self.task_names();
        let mut setups: Vec<_> = self.setups.keys().collect();
        setups.sort();
        f.debug_struct("TaskRegistry")
            .field("tasks", &tasks)
            .field("setups", &setups)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn double(x: u32) -> std::result::Result<u32, TaskError> {
        Ok(x * 2)
    }

    fn refuse(_: &WorkerInfo) -> std::result::Result<(), TaskError> {
        Err(TaskError::failed("no scratch space"))
    }

    const DOUBLE: TaskFn<u32, u32> = TaskFn::new("double", double);

    #[test]
    fn test_registry_runs_by_name() {
        let mut registry = TaskRegistry::new();
        registry.register(DOUBLE);

        assert!(registry.contains_task("double"));
        assert_eq!(registry.task_names(), vec!["double"]);
        let out = registry.run("double", json!(21)).unwrap();
        assert_eq!(out, Ok(json!(42)));
    }

    #[test]
    fn test_registry_rejects_bad_input() {
        let mut registry = TaskRegistry::new();
        registry.register(DOUBLE);

        match registry.run("double", json!("twenty")).unwrap() {
            Err(TaskError::Failed(msg)) => assert!(msg.contains("invalid input for 'double'")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_registry_unknown_names() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.run("missing", json!(null)),
            Err(PoolError::UnknownTask(name)) if name == "missing"
        ));
        assert!(registry.setup("missing").is_err());
    }

    #[test]
    fn test_setup_lookup() {
        let mut registry = TaskRegistry::new();
        registry.register_setup(Setup::new("refuse", refuse));

        let setup = registry.setup("refuse").unwrap();
        let info = WorkerInfo {
            id: 0,
            kind: WorkerKind::Processes,
        };
        assert!((setup.run)(&info).is_err());
        assert!(format!("{:?}", registry).contains("refuse"));
    }
}
