//! Criterion benchmarks: batched stepping on the serial and parallel
//! drivers at a few instance counts.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use herd_bench::{parallel_profile, serial_profile, step_input};
use herd_env::{step_mdp, Env, RolloutOptions, StepMdpOptions};

const SIZES: [usize; 3] = [2, 4, 8];

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("step");
    for n in SIZES {
        let mut serial = serial_profile(n, 42).unwrap();
        let td = step_input(&mut serial, 0.1).unwrap();
        group.bench_with_input(BenchmarkId::new("serial", n), &td, |b, td| {
            b.iter(|| black_box(serial.step(td).unwrap()));
        });

        let mut parallel = parallel_profile(n, 42).unwrap();
        let td = step_input(&mut parallel, 0.1).unwrap();
        group.bench_with_input(BenchmarkId::new("parallel", n), &td, |b, td| {
            b.iter(|| black_box(parallel.step(td).unwrap()));
        });
    }
    group.finish();
}

fn bench_step_and_transition(c: &mut Criterion) {
    let mut env = parallel_profile(4, 7).unwrap();
    let view = StepMdpOptions::with_keys(env.keys().clone()).exclude_action(false);
    let mut td = step_input(&mut env, 0.1).unwrap();
    c.bench_function("parallel_step_mdp_4", |b| {
        b.iter(|| {
            let out = env.step(&td).unwrap();
            td = step_mdp(&out, &view).unwrap();
            black_box(&td);
        });
    });
}

fn bench_rollout(c: &mut Criterion) {
    let mut env = serial_profile(4, 3).unwrap();
    c.bench_function("serial_rollout_4x32", |b| {
        b.iter(|| {
            let options = RolloutOptions::new(32).break_when_any_done(false);
            black_box(env.rollout(options, None).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_step,
    bench_step_and_transition,
    bench_rollout
);
criterion_main!(benches);
