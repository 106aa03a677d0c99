//! Node pool and ingestion benchmarks.
//!
//! Run with: cargo bench -p tidal-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidal_core::{Engine, NodePool, Shutdown, SlotRing, WorkerOptions};
use tidal_proto::{Instrument, Message, PriceLevel};

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_pool");
    group.throughput(Throughput::Elements(1));

    group.bench_function("allocate_release", |b| {
        let pool = NodePool::new(1024);
        b.iter(|| {
            let h = pool.allocate().unwrap();
            pool.release(black_box(h));
        })
    });

    group.bench_function("slot_ring_push_pop", |b| {
        let ring = SlotRing::with_capacity(1024);
        b.iter(|| {
            ring.push(black_box(7u32)).unwrap();
            black_box(ring.pop());
        })
    });

    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_publish");
    let options = WorkerOptions {
        workers: 1,
        ..WorkerOptions::default()
    };
    let engine = Engine::with_sinks(4096, Vec::new(), options, Shutdown::new()).unwrap();
    let ctx = engine.context_create("bench");

    let def = Instrument::new("BENCH", "F1", "XBTUSD", 1);
    let sid = def.security_id;
    engine.publish(&ctx, &[Message::from_record(&def)]).unwrap();

    for batch in [1usize, 32, 255] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let mut time = 2i64;
            b.iter(|| {
                let messages: Vec<Message> = (0..batch as i64)
                    .map(|i| Message::from_record(&PriceLevel::new(sid, i, 100, 1, time)))
                    .collect();
                time += 1;
                engine.publish(&ctx, black_box(&messages)).unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pool, bench_publish);
criterion_main!(benches);
