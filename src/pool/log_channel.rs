//! Log record channel between workers and the aggregator.
//!
//! Many writers, one reader. The channel owner is the only party able to
//! enqueue the termination sentinel, and it does so at most once.

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// A structured log entry produced by a worker.
///
/// The level stays in its textual form until the aggregator re-emits the
/// record, so a record from a misbehaving worker is rejected there and not
/// while it is being read off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Logger name (the `tracing` target of the original event).
    pub logger: String,
    /// Severity: "ERROR", "WARN", "INFO", "DEBUG" or "TRACE".
    pub level: String,
    pub message: String,
    /// Remaining event fields, rendered with `Debug`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl LogRecord {
    pub fn new(
        logger: impl Into<String>,
        level: tracing::Level,
        message: impl Into<String>,
    ) -> Self {
        Self {
            logger: logger.into(),
            level: level.as_str().to_string(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Item carried by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    Record(LogRecord),
    /// No more records will be read after this one.
    Shutdown,
}

/// Write-only handle held by workers (or by process-worker drivers).
#[derive(Debug, Clone)]
pub struct LogSender {
    tx: Sender<LogMessage>,
}

impl LogSender {
    /// Enqueue a record. Never blocks; a record sent after the aggregator
    /// has stopped is dropped.
    pub fn send(&self, record: LogRecord) {
        let _ = self.tx.send(LogMessage::Record(record));
    }
}

/// Read side of the channel, owned by the aggregator.
#[derive(Debug)]
pub struct LogReceiver {
    rx: Receiver<LogMessage>,
}

impl LogReceiver {
    /// Block until the next message. `None` once every sender is gone.
    pub fn recv(&self) -> Option<LogMessage> {
        self.rx.recv().ok()
    }
}

/// Owner of the log channel.
///
/// Closing (explicitly or on drop) enqueues the sentinel exactly once.
#[derive(Debug)]
pub struct LogChannel {
    tx: Sender<LogMessage>,
    rx: Option<Receiver<LogMessage>>,
    closed: bool,
}

impl LogChannel {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx: Some(rx),
            closed: false,
        }
    }

    /// Hand a write-only handle to a worker.
    pub fn sender(&self) -> LogSender {
        LogSender {
            tx: self.tx.clone(),
        }
    }

    /// Take the read side. Only the first call returns it.
    pub fn take_receiver(&mut self) -> Option<LogReceiver> {
        self.rx.take().map(|rx| LogReceiver { rx })
    }

    /// Enqueue the termination sentinel. Later calls do nothing.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.tx.send(LogMessage::Shutdown);
        }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LogChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Destination for records captured by [`ForwardLayer`].
pub trait ForwardRecord: Send + Sync + 'static {
    fn forward(&self, record: LogRecord);
}

impl ForwardRecord for LogSender {
    fn forward(&self, record: LogRecord) {
        self.send(record);
    }
}

/// `tracing` layer that turns every event into a [`LogRecord`] and hands it
/// to a forwarding handle instead of formatting it locally.
pub struct ForwardLayer<F> {
    sink: F,
}

impl<F: ForwardRecord> ForwardLayer<F> {
    pub fn new(sink: F) -> Self {
        Self { sink }
    }
}

impl<S, F> Layer<S> for ForwardLayer<F>
where
    S: Subscriber,
    F: ForwardRecord,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        self.sink.forward(LogRecord {
            logger: metadata.target().to_string(),
            level: metadata.level().as_str().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}
