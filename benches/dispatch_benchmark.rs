//! Benchmarks for per-batch dispatch overhead.

use batchpool::pool::{LogRecord, RecordSink, TracingSink, execute_pool_with_sink};
use batchpool::{PoolConfig, ProgressOptions, TaskError, TaskFn, execute_pool};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use indicatif::ProgressBar;
use std::hint::black_box;

fn checksum(bytes: Vec<u8>) -> Result<u64, TaskError> {
    Ok(bytes.iter().map(|&b| b as u64).sum())
}

const CHECKSUM: TaskFn<Vec<u8>, u64> = TaskFn::new("checksum", checksum);

/// Sink that drops everything, so only the channel is measured.
struct Discard;

impl RecordSink for Discard {
    fn emit(&mut self, record: &LogRecord) -> batchpool::Result<()> {
        black_box(record);
        Ok(())
    }
}

fn inputs(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![(i % 251) as u8; 256]).collect()
}

fn bench_thread_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_pool");

    for workers in [1, 4, 8].iter() {
        let config = PoolConfig::new(*workers).with_progress(ProgressOptions::hidden());

        group.bench_with_input(BenchmarkId::new("1000_tasks", workers), workers, |b, _| {
            b.iter(|| {
                let mut total = 0u64;
                execute_pool(
                    &config,
                    CHECKSUM,
                    inputs(1000),
                    Some(|sum: u64, pbar: &ProgressBar| {
                        total += sum;
                        pbar.inc(1);
                    }),
                )
                .unwrap();
                black_box(total)
            });
        });
    }

    group.finish();
}

fn bench_pool_startup(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_startup");

    for workers in [1, 16].iter() {
        let config = PoolConfig::new(*workers).with_progress(ProgressOptions::hidden());

        group.bench_with_input(BenchmarkId::new("empty_batch", workers), workers, |b, _| {
            b.iter(|| {
                execute_pool_with_sink(
                    &config,
                    CHECKSUM,
                    Vec::new(),
                    None::<fn(u64, &ProgressBar)>,
                    TracingSink,
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_log_channel(c: &mut Criterion) {
    use batchpool::pool::{LogAggregator, LogChannel};
    use tracing::Level;

    c.bench_function("log_channel/10000_records", |b| {
        b.iter(|| {
            let mut channel = LogChannel::new();
            let aggregator =
                LogAggregator::spawn(channel.take_receiver().unwrap(), Discard).unwrap();
            let sender = channel.sender();
            for i in 0..10_000 {
                sender.send(LogRecord::new("bench", Level::INFO, format!("record {}", i)));
            }
            channel.close();
            black_box(aggregator.join())
        });
    });
}

criterion_group!(
    benches,
    bench_thread_pool,
    bench_pool_startup,
    bench_log_channel
);
criterion_main!(benches);
