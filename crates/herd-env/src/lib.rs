//! The environment contract for herd.
//!
//! Defines the [`Env`] trait every simulation instance and batched
//! driver implements, the [`step_mdp`] transition that turns a step
//! output into the next input, and the [`rollout`] loop built on both.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod env;
pub mod rollout;
pub mod seed;
pub mod transition;

pub use env::{check_batch_size, Env, EnvKeys, EnvSpecs};
pub use rollout::{rollout, Policy, RandomPolicy, RolloutOptions};
pub use seed::{next_seed, seeded_rng};
pub use transition::{step_mdp, step_mdp_into, StepMdpOptions};
