//! Criterion benchmarks for the channel queue hot path.
//!
//! Measures the cost of fanning a window out to the window queues and of a full
//! producer/consumer hand-off across threads, which bounds how small a window period the
//! pipeline can sustain.
//!
//! Run with: cargo bench --bench channel_queue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use infer_daq::channel::{Channel, WindowQueue};
use infer_daq::shared_counters::SharedCountersBlock;
use infer_daq::{ChannelId, SampleWindow, ShutdownToken, SinkSelection};
use std::sync::Arc;
use std::thread;

fn channel(dir: &std::path::Path, sinks: SinkSelection) -> Arc<Channel> {
    let block = Arc::new(SharedCountersBlock::create(dir, "bench_counters").unwrap());
    Channel::new(ChannelId::Ch1, sinks, block, ShutdownToken::new())
}

/// Publish then pop on one thread, for each fan-out width.
fn publish_and_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_and_pop");
    group.throughput(Throughput::Elements(1));

    let widths = [
        ("inference_only", SinkSelection::default()),
        (
            "all_raw_sinks",
            SinkSelection {
                raw_to_file: true,
                raw_to_device: true,
                ..Default::default()
            },
        ),
    ];

    for (name, sinks) in widths {
        let temp_dir = tempfile::tempdir().unwrap();
        let ch = channel(temp_dir.path(), sinks);
        let window = Arc::new(SampleWindow::new(0, vec![0.0; 64]));

        group.bench_with_input(BenchmarkId::from_parameter(name), &sinks, |b, sinks| {
            b.iter(|| {
                ch.publish_window(Arc::clone(&window));
                black_box(ch.pop_window(WindowQueue::Inference));
                if sinks.raw_to_file {
                    black_box(ch.pop_window(WindowQueue::RawToFile));
                }
                if sinks.raw_to_device {
                    black_box(ch.pop_window(WindowQueue::RawToDevice));
                }
            });
        });
    }
    group.finish();
}

/// One producer thread, one consumer thread, 10k windows per iteration.
fn cross_thread_handoff(c: &mut Criterion) {
    const WINDOWS: u64 = 10_000;
    let mut group = c.benchmark_group("cross_thread_handoff");
    group.throughput(Throughput::Elements(WINDOWS));
    group.sample_size(20);

    group.bench_function("10k_windows", |b| {
        b.iter(|| {
            let temp_dir = tempfile::tempdir().unwrap();
            let ch = channel(temp_dir.path(), SinkSelection::default());

            let consumer = {
                let ch = Arc::clone(&ch);
                thread::spawn(move || {
                    let mut count = 0u64;
                    while ch.pop_window(WindowQueue::Inference).is_some() {
                        count += 1;
                    }
                    count
                })
            };

            for seq in 0..WINDOWS {
                ch.publish_window(Arc::new(SampleWindow::new(seq, vec![0.0; 64])));
            }
            ch.close_windows();
            assert_eq!(consumer.join().unwrap(), WINDOWS);
        });
    });
    group.finish();
}

criterion_group!(benches, publish_and_pop, cross_thread_handoff);
criterion_main!(benches);
