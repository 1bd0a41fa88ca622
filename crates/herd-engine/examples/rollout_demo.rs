//! Batched rollout demo: the same random-walk task on both drivers.
//!
//! Demonstrates:
//!   1. Building an `EnvFactory` from keyword arguments
//!   2. Running a seeded rollout on a `SerialEnv` and a `ParallelEnv`
//!   3. Masked resets and per-instance attribute reads
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example rollout_demo

use std::error::Error;
use std::time::Instant;

use herd_core::{Tensor, Value};
use herd_engine::{BatchedEnv, BatchedEnvConfig, EnvFactory, EnvKwargs, ParallelEnv, SerialEnv};
use herd_env::{Env, RolloutOptions};
use herd_test_utils::RandomWalkEnv;
use tracing_subscriber::EnvFilter;

// ─── Parameters ─────────────────────────────────────────────────

const WORKERS: usize = 4;
const DIM: i64 = 3;
const HORIZON: i64 = 50;
const SEED: u64 = 2024;

fn run(label: &str, env: &mut dyn BatchedEnv) -> Result<(), Box<dyn Error>> {
    env.set_seed(SEED, false)?;
    let started = Instant::now();
    let options = RolloutOptions::new(HORIZON as usize)
        .break_when_any_done(false)
        .action_seed(SEED);
    let traj = env.rollout(options, None)?;
    let elapsed = started.elapsed();

    let reward = traj
        .tensor(("next", "reward"))
        .and_then(Tensor::as_f32)
        .map_or(0.0, |r| r.iter().sum::<f32>());
    println!(
        "{label:>8}: batch {:?} in {:.2?}, total reward {reward:.3}",
        traj.batch_size(),
        elapsed
    );

    let mask = Tensor::from_bool(&[WORKERS, 1], vec![true, false, false, true])?;
    let partial = env.reset(Some(&herd_core::Record::new(&[WORKERS]).with("_reset", mask)?))?;
    println!(
        "{label:>8}: done after masked reset {:?}",
        partial.tensor("done").and_then(Tensor::as_bool)
    );
    println!("{label:>8}: dims {:?}", env.get_attr_all("dim")?);
    env.close()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut kwargs = EnvKwargs::new();
    kwargs.insert("dim".to_string(), Value::Int(DIM));
    kwargs.insert("max_steps".to_string(), Value::Int(HORIZON));
    let factory = EnvFactory::with_kwargs(RandomWalkEnv::from_kwargs);

    let mut serial = SerialEnv::with_factories(
        vec![factory.clone()],
        vec![kwargs.clone()],
        BatchedEnvConfig::new(WORKERS),
    )?;
    run("serial", &mut serial)?;

    let mut parallel = ParallelEnv::with_factories(
        vec![factory],
        vec![kwargs],
        BatchedEnvConfig::new(WORKERS),
    )?;
    run("parallel", &mut parallel)?;
    Ok(())
}
