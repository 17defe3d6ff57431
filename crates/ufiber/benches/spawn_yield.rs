//! Spawn, yield and io_uring round-trip costs

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::{Arc, OnceLock};
use ufiber::{AsyncOp, Runtime, RuntimeConfig, Semaphore};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let rt = Runtime::new(RuntimeConfig::from_env()).expect("runtime");
        rt.start().expect("runtime start");
        rt
    })
}

fn bench_block_on(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("block_on_round_trip", |b| {
        b.iter(|| black_box(rt.block_on(|| black_box(42)).unwrap()))
    });
}

fn bench_spawn_many(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("spawn_1000", |b| {
        b.iter(|| {
            rt.block_on(|| {
                let done = Arc::new(Semaphore::new(0));
                for i in 0..1000 {
                    let done = done.clone();
                    ufiber::spawn(move || {
                        black_box(i);
                        done.release();
                    });
                }
                for _ in 0..1000 {
                    done.acquire();
                }
            })
            .unwrap()
        })
    });
}

fn bench_yield(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("yield_now_100", |b| {
        b.iter(|| {
            rt.block_on(|| {
                for _ in 0..100 {
                    ufiber::yield_now();
                }
            })
            .unwrap()
        })
    });
}

fn bench_nop(c: &mut Criterion) {
    let rt = runtime();
    c.bench_function("uring_nop_100", |b| {
        b.iter(|| {
            rt.block_on(|| {
                for _ in 0..100 {
                    black_box(AsyncOp::new().prep_nop().submit_and_park());
                }
            })
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_block_on, bench_spawn_many, bench_yield, bench_nop);
criterion_main!(benches);
