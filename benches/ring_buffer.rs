//! Criterion benchmarks for the in-memory ring buffer's hot paths:
//! producer release throughput and consumer read latency, for both a
//! reserved reader (disk writer) and an unreserved one (live subscriber).
//!
//! Run with: cargo bench --bench ring_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fa_archiver::frame::{Block, Frame};
use fa_archiver::ring::{ReadOutcomeOwned, RingBuffer};
use std::sync::Arc;
use std::thread;

fn block_of(frame_count: usize, id0: u32) -> Block {
    Block {
        frames: (0..frame_count).map(|_| Frame::zeroed()).collect(),
        id0,
    }
}

/// Producer throughput for varying block sizes (frames per device read).
fn ring_buffer_release_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_release");

    for frame_count in [8usize, 64, 512] {
        let ring = RingBuffer::<Block>::new(64);
        let block = block_of(frame_count, 0);

        group.throughput(Throughput::Elements(frame_count as u64));
        group.bench_with_input(BenchmarkId::new("release", frame_count), &frame_count, |b, _| {
            b.iter(|| {
                ring.release_write_slot(false, 0, |slot| *slot = black_box(block.clone()));
            });
        });
    }

    group.finish();
}

/// Reserved-reader read latency: the disk writer's consumption path.
fn ring_buffer_reserved_read(c: &mut Criterion) {
    let ring = RingBuffer::<Block>::new(64);
    let reader = ring.open_reader(true);
    let block = block_of(64, 0);

    c.bench_function("ring_buffer_reserved_read", |b| {
        b.iter(|| {
            ring.release_write_slot(false, 0, |slot| *slot = block.clone());
            black_box(ring.get_read_slot_cloned(reader));
        });
    });
}

/// Unreserved-reader read latency: the live-subscriber path, which
/// never blocks the producer.
fn ring_buffer_unreserved_read(c: &mut Criterion) {
    let ring = RingBuffer::<Block>::new(64);
    let reader = ring.open_reader(false);
    let block = block_of(64, 0);

    c.bench_function("ring_buffer_unreserved_read", |b| {
        b.iter(|| {
            ring.release_write_slot(false, 0, |slot| *slot = block.clone());
            black_box(ring.get_read_slot_cloned(reader));
        });
    });
}

/// One producer thread racing against several consumer threads, the
/// shape the daemon runs in: one reserved reader (disk writer) plus
/// N unreserved readers (subscribers).
fn ring_buffer_concurrent_fan_out(c: &mut Criterion) {
    c.bench_function("ring_buffer_concurrent_fan_out", |b| {
        b.iter(|| {
            let ring = RingBuffer::<Block>::new(64);
            let reserved = ring.open_reader(true);
            let unreserved: Vec<_> = (0..4).map(|_| ring.open_reader(false)).collect();

            let producer_ring = Arc::clone(&ring);
            let producer = thread::spawn(move || {
                for i in 0..200u32 {
                    producer_ring.release_write_slot(false, i as u64, |slot| *slot = block_of(8, i));
                }
            });

            let consumers: Vec<_> = std::iter::once(reserved)
                .chain(unreserved)
                .map(|reader_id| {
                    let ring = Arc::clone(&ring);
                    thread::spawn(move || {
                        let mut received = 0;
                        while received < 200 {
                            match ring.get_read_slot_cloned(reader_id) {
                                ReadOutcomeOwned::Data(_, _, _) => received += 1,
                                ReadOutcomeOwned::Gap => received += 1,
                                ReadOutcomeOwned::Underflow => continue,
                                ReadOutcomeOwned::Closed => break,
                            }
                        }
                    })
                })
                .collect();

            producer.join().unwrap();
            for consumer in consumers {
                consumer.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    ring_buffer_release_throughput,
    ring_buffer_reserved_read,
    ring_buffer_unreserved_read,
    ring_buffer_concurrent_fan_out
);
criterion_main!(benches);
