use std::time::Duration;

use criterion::{black_box, BatchSize, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;
use time::OffsetDateTime;

use filemq::{Address, InboundQueue, Message, QueueConfig};

const MESSAGES_PER_ITER: usize = 200;

fn filled_queue(persist_read_logs: bool) -> (tempfile::TempDir, InboundQueue) {
    let dir = tempdir().expect("tempdir");
    let mut config = QueueConfig::new(dir.path());
    config.persist_read_logs = persist_read_logs;
    let queue = InboundQueue::open("bench", &config).expect("queue");
    let from = Address::pipe("bench");
    for i in 0..MESSAGES_PER_ITER {
        let msg = Message::text(from.clone(), "bench", i.to_string(), OffsetDateTime::now_utc());
        queue.enqueue(msg).expect("enqueue");
    }
    (dir, queue)
}

fn bench_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive");
    group.sample_size(10);
    for (label, persist) in [("read_log", true), ("no_read_log", false)] {
        group.bench_function(label, |b| {
            b.iter_batched(
                || filled_queue(persist),
                |(_dir, queue)| {
                    while let Some(msg) = queue.receive(Some(Duration::ZERO)).expect("receive") {
                        black_box(msg);
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.bench_function("accept_acknowledge", |b| {
        b.iter_batched(
            || filled_queue(true),
            |(_dir, queue)| {
                while let Some(msg) = queue.accept(Some(Duration::ZERO)).expect("accept") {
                    queue.acknowledge(black_box(&msg)).expect("ack");
                }
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_receive);
criterion_main!(benches);
