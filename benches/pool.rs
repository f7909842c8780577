//! Benchmarks for pool checkout/return cycles and stream writes.
//!
//! Run with: `cargo bench --bench pool`

use criterion::{criterion_group, criterion_main, Criterion};
use prometheus_client::registry::Registry;
use slabstream::{Pool, PoolConfig};

fn new_pool() -> Pool {
    let mut registry = Registry::default();
    Pool::new(PoolConfig::default(), &mut registry).expect("valid config")
}

fn bench_block_cycle(c: &mut Criterion) {
    let pool = new_pool();
    c.bench_function(&format!("{}/block_cycle", module_path!()), |b| {
        b.iter(|| {
            let block = pool.get_block();
            pool.return_blocks(vec![block], None).unwrap();
        })
    });
}

fn bench_large_cycle(c: &mut Criterion) {
    let pool = new_pool();
    c.bench_function(&format!("{}/large_cycle", module_path!()), |b| {
        b.iter(|| {
            let buffer = pool.get_large_buffer(1024 * 1024, None);
            pool.return_large_buffer(buffer, None).unwrap();
        })
    });
}

fn bench_stream_write(c: &mut Criterion) {
    let pool = new_pool();
    for chunk_size in [64usize, 1024, 16 * 1024] {
        let data = vec![0xABu8; chunk_size];
        // Write 1 MiB through the stream per iteration.
        let chunks = (1024 * 1024) / chunk_size;
        c.bench_function(
            &format!("{}/stream_write/chunk={}", module_path!(), chunk_size),
            |b| {
                b.iter(|| {
                    let mut stream = pool.stream(None);
                    for _ in 0..chunks {
                        stream.write(&data).unwrap();
                    }
                    stream.close().unwrap();
                })
            },
        );
    }
}

fn bench_get_buffer_promotion(c: &mut Criterion) {
    let pool = new_pool();
    let data = vec![0xCDu8; 128 * 1024];
    c.bench_function(&format!("{}/get_buffer_promotion", module_path!()), |b| {
        b.iter(|| {
            let mut stream = pool.stream(None);
            stream.write(&data).unwrap();
            let len = stream.get_buffer().unwrap().len();
            stream.close().unwrap();
            len
        })
    });
}

criterion_group!(
    benches,
    bench_block_cycle,
    bench_large_cycle,
    bench_stream_write,
    bench_get_buffer_promotion
);
criterion_main!(benches);
