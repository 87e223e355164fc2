use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parfor::{Dispatcher, ThreadPool};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const N: usize = 100_000;

fn heavy(i: usize) -> u64 {
    let mut x = i as u64;
    for _ in 0..100 {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    }
    x
}

fn parallel_for(c: &mut Criterion) {
    let pool = ThreadPool::builder().build().unwrap();
    let output: Arc<Vec<AtomicU64>> = Arc::new((0..N).map(|_| AtomicU64::new(0)).collect());

    c.bench_function("serial", |b| {
        b.iter(|| {
            for i in 0..N {
                output[i].store(heavy(black_box(i)), Ordering::Relaxed);
            }
        })
    });

    c.bench_function("parallel_for", |b| {
        b.iter(|| {
            let out = output.clone();
            pool.parallel_for(0..N)
                .run(move |i| { out[i].store(heavy(black_box(i)), Ordering::Relaxed); })
                .unwrap();
        })
    });

    c.bench_function("parallel_for empty slices", |b| {
        b.iter(|| {
            let out = output.clone();
            pool.parallel_for(0..2usize)
                .with_workers(16)
                .run(move |i| { out[i].store(heavy(black_box(i)), Ordering::Relaxed); })
                .unwrap();
        })
    });

    pool.shut_down().wait();
}

criterion_group!(benches, parallel_for);
criterion_main!(benches);
