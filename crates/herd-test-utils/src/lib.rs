//! Test utilities and mock environments for herd development.
//!
//! Provides deterministic [`Env`](herd_env::Env) implementations for
//! exercising the batched drivers: counting envs (flat and nested),
//! batch-locked/unlocked mocks, a seeded random walk with custom
//! methods, per-task envs with heterogeneous schemas, an env with a
//! step-only done flag, and envs that fail or hang on demand.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod counting;
pub mod fixtures;
pub mod mock;

pub use counting::{ones_like, unit_shape, CountingEnv, CountingPolicy, NestedCountingEnv, Nesting};
pub use fixtures::{FailingEnv, FailureMode, HangingEnv, TaskEnv, TruncatingEnv};
pub use mock::{MockBatchedEnv, RandomWalkEnv};
