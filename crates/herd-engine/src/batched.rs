//! The surface both batched drivers add on top of [`Env`].

use herd_core::{EnvError, Record, Value};
use herd_env::Env;

use crate::factory::EnvKwargs;
use crate::shared::DriverState;

/// A driver fanning one batched [`Env`] call out to N instances.
///
/// Implemented by [`SerialEnv`](crate::serial::SerialEnv) and
/// [`ParallelEnv`](crate::parallel::ParallelEnv). Outputs are stacked
/// along a new first dimension in instance order, so a batched driver
/// over instances of batch size `B` has batch size `[N, *B]`.
///
/// # Contract
///
/// - Instances are built lazily: by [`start`](BatchedEnv::start) or by
///   the first operation that needs them.
/// - Every per-instance failure is reported as
///   [`EnvError::WorkerFailed`] carrying the instance index.
/// - After [`close`](Env::close) every operation fails with
///   [`EnvError::Closed`].
///
/// # Object safety
///
/// This trait is object-safe.
pub trait BatchedEnv: Env {
    /// Build every instance and run its handshake reset.
    ///
    /// Fails with [`ConfigError::AlreadyStarted`](crate::ConfigError)
    /// (as [`EnvError::InvalidConfig`]) when called twice.
    fn start(&mut self) -> Result<(), EnvError>;

    /// Current lifecycle state.
    fn state(&self) -> DriverState;

    /// Number of instances.
    fn num_workers(&self) -> usize;

    /// Whether every instance comes from the same factory.
    fn single_task(&self) -> bool;

    /// Replace the keyword arguments instances are built with.
    ///
    /// Only allowed before the driver starts. Accepts one entry per
    /// instance or a single shared entry.
    fn update_kwargs(&mut self, kwargs: Vec<EnvKwargs>) -> Result<(), EnvError>;

    /// Invoke a custom method on every instance, in instance order.
    fn call_all(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, EnvError>;

    /// Read a custom attribute from every instance, in instance order.
    fn get_attr_all(&mut self, name: &str) -> Result<Vec<Value>, EnvError>;

    /// Snapshot every instance.
    fn state_dicts(&mut self) -> Result<Vec<Record>, EnvError>;

    /// Restore one snapshot per instance.
    fn load_state_dicts(&mut self, states: &[Record]) -> Result<(), EnvError>;
}
