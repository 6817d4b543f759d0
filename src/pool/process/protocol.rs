//! Wire protocol between the parent and a worker process.
//!
//! Messages are JSON objects tagged by `type`, one per line. Requests go to
//! the worker's stdin, responses come back on its stdout.

use crate::error::TaskError;
use crate::pool::log_channel::LogRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Written by the SIGBUS handler straight to fd 1.
///
/// Starts with a newline so it is parsed on its own even if the fault hit
/// halfway through another line.
pub const FAULT_LINE: &str = "\n{\"type\":\"fault\"}\n";

/// Request from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    /// Run the worker's task on one argument.
    Run {
        /// Submission index of the argument within the batch.
        seq: u64,
        input: Value,
    },

    /// Graceful shutdown request.
    Exit,
}

/// Response from worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    /// Initialization finished; the worker accepts tasks.
    Ready,

    /// Initialization failed; the worker exits after sending this.
    InitFailed { message: String },

    /// A log record emitted by the worker.
    Log { record: LogRecord },

    /// The task returned a value.
    Result { seq: u64, output: Value },

    /// The task returned an error.
    Error { seq: u64, error: TaskError },

    /// The task panicked; the worker caught it and stays usable.
    Panicked { seq: u64, message: String },

    /// The worker hit SIGBUS and is exiting.
    Fault,
}

impl WorkRequest {
    pub fn run(seq: u64, input: Value) -> Self {
        Self::Run { seq, input }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        to_line(self)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    pub fn init_failed(message: impl Into<String>) -> Self {
        Self::InitFailed {
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        to_line(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

fn to_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing::Level;

    #[test]
    fn test_request_wire_format() {
        let line = WorkRequest::run(3, json!("batch-7.json")).to_line().unwrap();
        assert_eq!(line, "{\"type\":\"run\",\"seq\":3,\"input\":\"batch-7.json\"}\n");
        assert_eq!(
            WorkRequest::from_line("{\"type\":\"exit\"}").unwrap(),
            WorkRequest::Exit
        );
    }

    #[test]
    fn test_task_error_crosses_the_wire() {
        let response = WorkResponse::Error {
            seq: 7,
            error: TaskError::InputInaccessible,
        };
        let line = response.to_line().unwrap();
        assert!(line.contains("\"kind\":\"input_inaccessible\""));
        assert_eq!(WorkResponse::from_line(&line).unwrap(), response);
    }

    #[test]
    fn test_fault_line_parses() {
        let lines: Vec<&str> = FAULT_LINE.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(WorkResponse::from_line(lines[0]).unwrap(), WorkResponse::Fault);
    }

    #[test]
    fn test_log_response() {
        let record = LogRecord::new("resize.image", Level::WARN, "upscaling").with_field("item", "4");
        let line = WorkResponse::Log {
            record: record.clone(),
        }
        .to_line()
        .unwrap();
        assert_eq!(
            WorkResponse::from_line(&line).unwrap(),
            WorkResponse::Log { record }
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(WorkResponse::from_line("Hello from a stray println").is_err());
        assert!(WorkRequest::from_line("{\"type\":\"explode\"}").is_err());
    }
}
