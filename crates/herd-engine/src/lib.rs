//! Batched drivers for herd environments.
//!
//! A batched driver presents N independent environment instances as one
//! [`Env`](herd_env::Env) whose batch size is `[N, *instance_batch]`.
//! [`SerialEnv`] steps its instances one after another in the calling
//! thread; [`ParallelEnv`] gives every instance a dedicated worker
//! thread and synchronises on a barrier per call. Both produce identical
//! outputs under the same seed.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod batched;
pub mod config;
pub mod factory;
pub mod parallel;
pub mod serial;
mod shared;
mod worker;

pub use batched::BatchedEnv;
pub use config::{BatchedEnvConfig, ConfigError};
pub use factory::{EnvFactory, EnvKwargs};
pub use parallel::ParallelEnv;
pub use serial::SerialEnv;
pub use shared::DriverState;
