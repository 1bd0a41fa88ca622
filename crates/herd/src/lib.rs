//! herd: batched reinforcement-learning environments.
//!
//! This is the facade crate re-exporting the public API of the herd
//! sub-crates. For most users, adding `herd` as a single dependency is
//! sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use herd::prelude::*;
//!
//! // A coin counter: the observation counts the ones it was fed.
//! struct Coins {
//!     specs: EnvSpecs,
//!     heads: i64,
//! }
//!
//! impl Coins {
//!     fn new() -> Self {
//!         let mut specs = EnvSpecs::new(&[]);
//!         specs.observation = specs
//!             .observation
//!             .with("observation", TensorSpec::unbounded(&[1], DType::F32));
//!         specs.action = specs.action.with("action", TensorSpec::binary(&[1], DType::I64));
//!         specs.reward = specs.reward.with("reward", TensorSpec::unbounded(&[1], DType::F32));
//!         specs.done = specs.done.with("done", TensorSpec::binary(&[1], DType::Bool));
//!         Self { specs, heads: 0 }
//!     }
//!
//!     fn observe(&self) -> Result<Record, EnvError> {
//!         Ok(Record::new(&[])
//!             .with("observation", Tensor::full_f32(&[1], self.heads as f32))?
//!             .with("done", Tensor::full_bool(&[1], self.heads >= 3))?)
//!     }
//! }
//!
//! impl Env for Coins {
//!     fn batch_size(&self) -> &[usize] { &[] }
//!     fn device(&self) -> Device { Device::Cpu }
//!     fn specs(&self) -> &EnvSpecs { &self.specs }
//!
//!     fn reset_impl(&mut self, _input: Option<&Record>) -> Result<Record, EnvError> {
//!         self.heads = 0;
//!         self.observe()
//!     }
//!
//!     fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
//!         let flip = input.tensor("action").and_then(Tensor::as_i64).map_or(0, |a| a[0]);
//!         self.heads += flip;
//!         Ok(self.observe()?.with("reward", Tensor::full_f32(&[1], flip as f32))?)
//!     }
//!
//!     fn set_seed_impl(&mut self, _seed: u64) -> Result<(), EnvError> { Ok(()) }
//! }
//!
//! let mut env = ParallelEnv::new(EnvFactory::new(Coins::new), BatchedEnvConfig::new(4))?;
//! env.set_seed(42, false)?;
//! let traj = env.rollout(RolloutOptions::new(20).action_seed(42), None)?;
//! assert_eq!(traj.batch_size()[0], 4);
//! env.close()?;
//! # Ok::<(), EnvError>(())
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `herd-core` | Tensors, records, key-paths, specs, values, errors |
//! | [`env`] | `herd-env` | The `Env` trait, `step_mdp`, rollouts and policies |
//! | [`engine`] | `herd-engine` | `SerialEnv`, `ParallelEnv` and their configuration |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core data model (`herd-core`).
///
/// [`types::Record`] is the structured container every environment
/// consumes and produces; [`types::TensorSpec`] and
/// [`types::CompositeSpec`] describe its leaves.
pub use herd_core as types;

/// The environment contract (`herd-env`).
///
/// Implement [`env::Env`] for a single simulation instance; drive it
/// with [`env::step_mdp`] and [`env::rollout`].
pub use herd_env as env;

/// Batched drivers (`herd-engine`).
///
/// [`engine::SerialEnv`] steps instances in the calling thread,
/// [`engine::ParallelEnv`] on one worker thread each.
pub use herd_engine as engine;

/// Common imports for typical herd usage.
///
/// ```rust
/// use herd::prelude::*;
/// ```
pub mod prelude {
    // Data model
    pub use herd_core::{
        CompositeSpec, DType, Device, KeyPath, Kwargs, Record, Tensor, TensorSpec, Value,
    };

    // Errors
    pub use herd_core::{EnvError, RecordError};

    // Environment contract
    pub use herd_env::{
        step_mdp, Env, EnvKeys, EnvSpecs, Policy, RandomPolicy, RolloutOptions, StepMdpOptions,
    };

    // Drivers
    pub use herd_engine::{
        BatchedEnv, BatchedEnvConfig, ConfigError, DriverState, EnvFactory, EnvKwargs,
        ParallelEnv, SerialEnv,
    };
}
