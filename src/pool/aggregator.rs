//! Log aggregator: the single consumer of the log channel.
//!
//! Runs on its own thread in the parent process regardless of worker kind,
//! so only one party ever writes to the process-wide logging sink.

use super::log_channel::{LogMessage, LogReceiver, LogRecord};
use crate::error::{PoolError, Result};
use crate::logging::parse_level;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};
use tracing::callsite::{Callsite, Identifier};
use tracing::field::{FieldSet, Value};
use tracing::metadata::Kind;
use tracing::subscriber::Interest;
use tracing::{Event, Level, Metadata, dispatcher};

/// Where the aggregator re-emits records.
pub trait RecordSink: Send + 'static {
    /// Emit one record. An error is reported as a diagnostic and the
    /// aggregator moves on to the next record.
    fn emit(&mut self, record: &LogRecord) -> Result<()>;
}

/// Re-emits records as `tracing` events on the parent's subscriber.
///
/// Each record is filtered under its own logger name, so directives such as
/// `mytask=debug` apply to worker records as they would to local events. The
/// emitted event has the fixed target `batchpool::worker` and carries the
/// logger name in its `logger` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

const RECORD_FIELDS: &[&str] = &["message", "logger", "fields"];

macro_rules! record_callsite {
    ($level:expr, $callsite:ident, $meta:ident, $ty:ident) => {
        struct $ty;
        static $callsite: $ty = $ty;
        static $meta: Metadata<'static> = Metadata::new(
            "worker record",
            "batchpool::worker",
            $level,
            None,
            None,
            None,
            FieldSet::new(RECORD_FIELDS, Identifier(&$callsite)),
            Kind::EVENT,
        );

        impl Callsite for $ty {
            fn set_interest(&self, _: Interest) {}
            fn metadata(&self) -> &Metadata<'_> {
                &$meta
            }
        }
    };
}

record_callsite!(Level::ERROR, ERROR_CALLSITE, ERROR_META, ErrorCallsite);
record_callsite!(Level::WARN, WARN_CALLSITE, WARN_META, WarnCallsite);
record_callsite!(Level::INFO, INFO_CALLSITE, INFO_META, InfoCallsite);
record_callsite!(Level::DEBUG, DEBUG_CALLSITE, DEBUG_META, DebugCallsite);
record_callsite!(Level::TRACE, TRACE_CALLSITE, TRACE_META, TraceCallsite);

fn record_metadata(level: Level) -> &'static Metadata<'static> {
    match level {
        Level::ERROR => &ERROR_META,
        Level::WARN => &WARN_META,
        Level::INFO => &INFO_META,
        Level::DEBUG => &DEBUG_META,
        _ => &TRACE_META,
    }
}

impl RecordSink for TracingSink {
    fn emit(&mut self, record: &LogRecord) -> Result<()> {
        let level = parse_level(&record.level).ok_or_else(|| {
            PoolError::Worker(format!(
                "malformed log record from '{}': unknown level '{}'",
                record.logger, record.level
            ))
        })?;

        let meta = record_metadata(level);
        let fields = meta.fields();
        let (Some(message), Some(logger), Some(extra)) = (
            fields.field("message"),
            fields.field("logger"),
            fields.field("fields"),
        ) else {
            return Err(PoolError::Worker("worker record callsite lacks its fields".into()));
        };
        let rendered = (!record.fields.is_empty()).then(|| format!("{:?}", record.fields));

        dispatcher::get_default(|dispatch| {
            let filter_meta = Metadata::new(
                "worker record",
                &record.logger,
                level,
                None,
                None,
                None,
                FieldSet::new(RECORD_FIELDS, meta.callsite()),
                Kind::EVENT,
            );
            if !dispatch.enabled(&filter_meta) {
                return;
            }
            dispatch.event(&Event::new(
                meta,
                &fields.value_set(&[
                    (&message, Some(&record.message.as_str() as &dyn Value)),
                    (&logger, Some(&record.logger.as_str() as &dyn Value)),
                    (&extra, rendered.as_ref().map(|s| s as &dyn Value)),
                ]),
            ));
        });
        Ok(())
    }
}

/// Handle to the running aggregator thread.
pub struct LogAggregator {
    thread: Option<JoinHandle<AggregatorStats>>,
}

/// Counters returned when the aggregator stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Records handed to the sink successfully.
    pub forwarded: usize,
    /// Records that failed and produced a diagnostic instead.
    pub failed: usize,
    /// Whether the loop ended on the sentinel (as opposed to a lost channel).
    pub saw_sentinel: bool,
}

impl LogAggregator {
    /// Start the consumer thread.
    pub fn spawn<S: RecordSink>(receiver: LogReceiver, sink: S) -> Result<Self> {
        let thread = thread::Builder::new()
            .name("log-aggregator".to_string())
            .spawn(move || aggregate(receiver, sink))?;
        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Wait for the aggregator to consume the sentinel and stop.
    ///
    /// Only returns once the channel owner has closed the channel.
    pub fn join(mut self) -> AggregatorStats {
        self.wait()
    }

    fn wait(&mut self) -> AggregatorStats {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                eprintln!("Logging problem: log aggregator thread panicked");
                AggregatorStats::default()
            }),
            None => AggregatorStats::default(),
        }
    }
}

impl Drop for LogAggregator {
    fn drop(&mut self) {
        self.wait();
    }
}

/// Receive loop. Stops on the sentinel and never reads past it.
fn aggregate<S: RecordSink>(receiver: LogReceiver, mut sink: S) -> AggregatorStats {
    let mut stats = AggregatorStats::default();

    loop {
        let record = match receiver.recv() {
            Some(LogMessage::Record(record)) => record,
            Some(LogMessage::Shutdown) => {
                stats.saw_sentinel = true;
                break;
            }
            None => {
                eprintln!("Logging problem: log channel closed without a shutdown sentinel");
                break;
            }
        };

        match catch_unwind(AssertUnwindSafe(|| sink.emit(&record))) {
            Ok(Ok(())) => stats.forwarded += 1,
            Ok(Err(e)) => {
                stats.failed += 1;
                eprintln!("Logging problem: {}", e);
            }
            Err(panic) => {
                stats.failed += 1;
                eprintln!(
                    "Logging problem: sink panicked on record from '{}': {}",
                    record.logger,
                    panic_message(&*panic)
                );
            }
        }
    }

    stats
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::log_channel::LogChannel;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{EnvFilter, Layer};

    /// Sink that records messages and chokes on a few trigger words.
    #[derive(Clone, Default)]
    struct Collecting {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl RecordSink for Collecting {
        fn emit(&mut self, record: &LogRecord) -> Result<()> {
            match record.message.as_str() {
                "explode" => panic!("sink blew up"),
                "reject" => Err(PoolError::Worker("rejected".into())),
                _ => {
                    self.seen.lock().unwrap().push(record.message.clone());
                    Ok(())
                }
            }
        }
    }

    fn record(message: &str) -> LogRecord {
        LogRecord::new("test", Level::INFO, message)
    }

    #[test]
    fn test_forwards_until_sentinel() {
        let mut channel = LogChannel::new();
        let sink = Collecting::default();
        let aggregator =
            LogAggregator::spawn(channel.take_receiver().unwrap(), sink.clone()).unwrap();

        let sender = channel.sender();
        sender.send(record("one"));
        sender.send(record("two"));
        channel.close();
        // Enqueued strictly after the sentinel: must never reach the sink.
        sender.send(record("late"));

        let stats = aggregator.join();
        assert!(stats.saw_sentinel);
        assert_eq!(stats.forwarded, 2);
        assert_eq!(*sink.seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_survives_bad_records() {
        let mut channel = LogChannel::new();
        let sink = Collecting::default();
        let aggregator =
            LogAggregator::spawn(channel.take_receiver().unwrap(), sink.clone()).unwrap();

        let sender = channel.sender();
        sender.send(record("before"));
        sender.send(record("explode"));
        sender.send(record("reject"));
        sender.send(record("after"));
        channel.close();

        let stats = aggregator.join();
        assert_eq!(stats.failed, 2);
        assert_eq!(*sink.seen.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn test_stops_promptly_on_sentinel() {
        let mut channel = LogChannel::new();
        let aggregator =
            LogAggregator::spawn(channel.take_receiver().unwrap(), Collecting::default())
                .unwrap();

        let start = Instant::now();
        channel.close();
        aggregator.join();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_tracing_sink_rejects_unknown_level() {
        let mut sink = TracingSink;
        let mut bad = record("hello");
        bad.level = "LOUD".to_string();
        assert!(sink.emit(&bad).is_err());
        assert!(sink.emit(&record("hello")).is_ok());
    }

    /// Layer that keeps "<logger> <level>" for every event it sees.
    #[derive(Clone, Default)]
    struct Capture {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl<S: tracing::Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &Event<'_>, _: Context<'_, S>) {
            struct LoggerField(Option<String>);
            impl Visit for LoggerField {
                fn record_str(&mut self, field: &Field, value: &str) {
                    if field.name() == "logger" {
                        self.0 = Some(value.to_string());
                    }
                }
                fn record_debug(&mut self, _: &Field, _: &dyn std::fmt::Debug) {}
            }

            let mut logger = LoggerField(None);
            event.record(&mut logger);
            let name = logger.0.unwrap_or_else(|| event.metadata().target().to_string());
            self.seen
                .lock()
                .unwrap()
                .push(format!("{} {}", name, event.metadata().level()));
        }
    }

    #[test]
    fn test_tracing_sink_filters_by_logger_name() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry()
            .with(capture.clone().with_filter(EnvFilter::new("warn,mytask=debug")));

        tracing::subscriber::with_default(subscriber, || {
            let mut sink = TracingSink;
            sink.emit(&LogRecord::new("mytask", Level::DEBUG, "kept")).unwrap();
            sink.emit(&LogRecord::new("mytask", Level::TRACE, "too verbose")).unwrap();
            sink.emit(&LogRecord::new("other", Level::DEBUG, "filtered")).unwrap();
            sink.emit(&LogRecord::new("other", Level::WARN, "warned")).unwrap();
        });

        assert_eq!(
            *capture.seen.lock().unwrap(),
            vec!["mytask DEBUG", "other WARN"]
        );
    }
}
