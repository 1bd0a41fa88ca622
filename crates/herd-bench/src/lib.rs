//! Benchmark profiles for the herd batched drivers.
//!
//! - [`walk_factory`]: a random-walk task of configurable width and horizon
//! - [`serial_profile`] / [`parallel_profile`]: started drivers over it
//! - [`step_input`]: a reset record carrying a constant action

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use herd_core::{EnvError, Record, Tensor};
use herd_engine::{BatchedEnv, BatchedEnvConfig, EnvFactory, ParallelEnv, SerialEnv};
use herd_env::Env;
use herd_test_utils::RandomWalkEnv;

/// Observation width of the reference profile.
pub const REFERENCE_DIM: usize = 64;

/// A random-walk task of width `dim` that stays alive for `max_steps`.
pub fn walk_factory(dim: usize, max_steps: usize) -> EnvFactory {
    EnvFactory::new(move || RandomWalkEnv::new(&[], dim, max_steps))
}

/// A started serial driver over `n` reference walkers.
pub fn serial_profile(n: usize, seed: u64) -> Result<SerialEnv, EnvError> {
    let mut env = SerialEnv::new(
        walk_factory(REFERENCE_DIM, usize::MAX),
        BatchedEnvConfig::new(n),
    )?;
    env.start()?;
    env.set_seed(seed, false)?;
    Ok(env)
}

/// A started parallel driver over `n` reference walkers.
pub fn parallel_profile(n: usize, seed: u64) -> Result<ParallelEnv, EnvError> {
    let mut env = ParallelEnv::new(
        walk_factory(REFERENCE_DIM, usize::MAX),
        BatchedEnvConfig::new(n),
    )?;
    env.start()?;
    env.set_seed(seed, false)?;
    Ok(env)
}

/// Reset `env` and attach a constant action matching its action spec.
pub fn step_input(env: &mut dyn BatchedEnv, action: f32) -> Result<Record, EnvError> {
    let shape = env
        .specs()
        .action_spec()
        .map(|spec| spec.shape().to_vec())
        .ok_or_else(|| EnvError::MissingAction {
            key: env.keys().action.to_string(),
        })?;
    let td = env.reset(None)?;
    Ok(td.with("action", Tensor::full_f32(&shape, action))?)
}
