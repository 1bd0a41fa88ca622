//! The [`Env`] trait, its spec bundle [`EnvSpecs`] and the configurable
//! special key-paths [`EnvKeys`].

use herd_core::{
    CompositeSpec, Device, EnvError, KeyPath, Record, Tensor, TensorSpec, Value,
};
use rand_chacha::ChaCha8Rng;

use crate::rollout::{rollout, Policy, RolloutOptions};
use crate::seed::next_seed;

// ── Keys and specs ──────────────────────────────────────────────

/// The three special key-paths of an environment.
///
/// Each may point into a nested sub-record. The partial-reset mask lives
/// next to the done key, under the name `_reset`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvKeys {
    /// Where the policy writes the action.
    pub action: KeyPath,
    /// Where `next` carries the reward.
    pub reward: KeyPath,
    /// Where `next` (and reset outputs) carry the done flag.
    pub done: KeyPath,
}

impl Default for EnvKeys {
    fn default() -> Self {
        Self {
            action: KeyPath::from("action"),
            reward: KeyPath::from("reward"),
            done: KeyPath::from("done"),
        }
    }
}

impl EnvKeys {
    /// Key-path of the partial-reset mask: the done key's `_reset` sibling.
    pub fn reset_key(&self) -> KeyPath {
        self.done.sibling("_reset")
    }
}

/// Observation, action, reward, done and state specs of an environment.
///
/// Leaf shapes include the environment's batch size. Batched drivers
/// publish these expanded by the `[N]` instance prefix.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvSpecs {
    /// Everything reset and step report besides reward and done.
    pub observation: CompositeSpec,
    /// The action the policy must write.
    pub action: CompositeSpec,
    /// The reward carried in `next`.
    pub reward: CompositeSpec,
    /// The done flag.
    pub done: CompositeSpec,
    /// Extra inputs an environment accepts on reset.
    pub state: CompositeSpec,
    /// Special key-paths.
    pub keys: EnvKeys,
}

impl EnvSpecs {
    /// Empty specs for batch size `batch_size` with default keys.
    pub fn new(batch_size: &[usize]) -> Self {
        Self {
            observation: CompositeSpec::new(batch_size),
            action: CompositeSpec::new(batch_size),
            reward: CompositeSpec::new(batch_size),
            done: CompositeSpec::new(batch_size),
            state: CompositeSpec::new(batch_size),
            keys: EnvKeys::default(),
        }
    }

    /// The leaf spec at the action key.
    pub fn action_spec(&self) -> Option<&TensorSpec> {
        self.action.get_leaf(&self.keys.action)
    }

    /// The leaf spec at the reward key.
    pub fn reward_spec(&self) -> Option<&TensorSpec> {
        self.reward.get_leaf(&self.keys.reward)
    }

    /// The leaf spec at the done key.
    pub fn done_spec(&self) -> Option<&TensorSpec> {
        self.done.get_leaf(&self.keys.done)
    }

    /// Every spec under the leading dimensions `prefix`.
    pub fn expand(&self, prefix: &[usize]) -> Self {
        Self {
            observation: self.observation.expand(prefix),
            action: self.action.expand(prefix),
            reward: self.reward.expand(prefix),
            done: self.done.expand(prefix),
            state: self.state.expand(prefix),
            keys: self.keys.clone(),
        }
    }

    /// Every spec declared on `device`.
    pub fn to(&self, device: Device) -> Self {
        Self {
            observation: self.observation.to(device),
            action: self.action.to(device),
            reward: self.reward.to(device),
            done: self.done.to(device),
            state: self.state.to(device),
            keys: self.keys.clone(),
        }
    }
}

/// Check an input batch size against an environment's.
///
/// Batch-locked environments require an exact match. Unlocked ones
/// accept any leading prefix as long as the trailing dims equal the
/// environment's batch size.
pub fn check_batch_size(expected: &[usize], locked: bool, got: &[usize]) -> Result<(), EnvError> {
    let ok = if locked {
        expected == got
    } else {
        got.ends_with(expected)
    };
    if ok {
        Ok(())
    } else {
        Err(EnvError::BatchSizeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        })
    }
}

// ── Env ─────────────────────────────────────────────────────────

/// A (possibly batched) environment: the uniform reset/step/seed contract
/// shared by single instances and the batched drivers.
///
/// # Contract
///
/// - `reset_impl` returns a record with the environment's batch size
///   holding the initial observation. When the input carries a `_reset`
///   mask, only the selected elements are reset; the others keep their
///   last observation and done flag.
/// - `step_impl` reads the action at [`EnvKeys::action`] and returns the
///   `next` sub-record: next observation, reward and done.
/// - The provided [`reset`](Env::reset) and [`step`](Env::step) wrap
///   these with shape validation and bookkeeping; callers use those.
///
/// # Object safety
///
/// This trait is object-safe; drivers store instances as
/// `Box<dyn Env>`.
///
/// # Examples
///
/// ```
/// use herd_core::{DType, EnvError, Record, Tensor, TensorSpec, Device};
/// use herd_env::{Env, EnvSpecs};
///
/// struct Constant {
///     specs: EnvSpecs,
/// }
///
/// impl Env for Constant {
///     fn batch_size(&self) -> &[usize] { &[] }
///     fn device(&self) -> Device { Device::Cpu }
///     fn specs(&self) -> &EnvSpecs { &self.specs }
///
///     fn reset_impl(&mut self, _input: Option<&Record>) -> Result<Record, EnvError> {
///         Ok(Record::new(&[]).with("observation", Tensor::full_f32(&[1], 1.0))?)
///     }
///
///     fn step_impl(&mut self, _input: &Record) -> Result<Record, EnvError> {
///         Ok(Record::new(&[])
///             .with("observation", Tensor::full_f32(&[1], 1.0))?
///             .with("reward", Tensor::full_f32(&[1], 0.0))?
///             .with("done", Tensor::full_bool(&[1], true))?)
///     }
///
///     fn set_seed_impl(&mut self, _seed: u64) -> Result<(), EnvError> { Ok(()) }
/// }
///
/// let mut specs = EnvSpecs::new(&[]);
/// specs.done.insert("done", TensorSpec::binary(&[1], DType::Bool))?;
/// let mut env = Constant { specs };
/// let first = env.reset(None)?;
/// assert_eq!(first.tensor("done"), Some(&Tensor::full_bool(&[1], false)));
///
/// let input = first.with("action", Tensor::full_f32(&[1], 0.0))?;
/// let out = env.step(&input)?;
/// assert!(out.tensor(("next", "done")).unwrap().all());
/// # Ok::<(), EnvError>(())
/// ```
pub trait Env {
    /// Batch size of every record this environment consumes and produces.
    fn batch_size(&self) -> &[usize];

    /// Device the environment's records live on.
    fn device(&self) -> Device;

    /// Spec declarations.
    fn specs(&self) -> &EnvSpecs;

    /// Produce the initial (or partially reset) observation record.
    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError>;

    /// Advance one step and return the `next` sub-record.
    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError>;

    /// Seed every random source of the environment.
    fn set_seed_impl(&mut self, seed: u64) -> Result<(), EnvError>;

    /// Whether inputs must match [`batch_size`](Env::batch_size) exactly.
    ///
    /// Default: `true`.
    fn batch_locked(&self) -> bool {
        true
    }

    /// `batch_locked` is read-only; this always fails.
    fn set_batch_locked(&mut self, _locked: bool) -> Result<(), EnvError> {
        Err(EnvError::ReadOnlyProperty {
            name: "batch_locked".to_string(),
        })
    }

    /// The special key-paths.
    fn keys(&self) -> &EnvKeys {
        &self.specs().keys
    }

    /// Reset the environment.
    ///
    /// Validates the input's batch size, fills every done-spec leaf the
    /// instance left out (such as a `truncated` flag only a step reports)
    /// with `false`, and fails with [`EnvError::DoneAfterReset`] when a
    /// full reset (no `_reset` mask in the input) reports any done element.
    fn reset(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        if self.is_closed() {
            return Err(EnvError::Closed);
        }
        if let Some(input) = input {
            check_batch_size(self.batch_size(), self.batch_locked(), input.batch_size())?;
        }
        let keys = self.keys().clone();
        let partial = input.is_some_and(|td| td.contains(&keys.reset_key()));
        let mut out = self.reset_impl(input)?;
        let done = &self.specs().done;
        for path in done.leaf_paths() {
            if out.contains(&path) {
                continue;
            }
            if let Some(spec) = done.get_leaf(&path) {
                out.set(&path, spec.zero())?;
            }
        }
        if !partial && out.tensor(&keys.done).is_some_and(Tensor::any) {
            return Err(EnvError::DoneAfterReset);
        }
        Ok(out)
    }

    /// Step the environment.
    ///
    /// Returns a copy of `input` with the step outcome attached under
    /// `next` (replacing any previous `next`).
    fn step(&mut self, input: &Record) -> Result<Record, EnvError> {
        if self.is_closed() {
            return Err(EnvError::Closed);
        }
        check_batch_size(self.batch_size(), self.batch_locked(), input.batch_size())?;
        let action = &self.keys().action;
        if !input.contains(action) {
            return Err(EnvError::MissingAction {
                key: action.to_string(),
            });
        }
        let next = self.step_impl(input)?;
        let mut out = input.clone();
        out.remove("next");
        out.set_record("next", next)?;
        Ok(out)
    }

    /// Seed the environment.
    ///
    /// Returns `seed` itself when `static_seed` is set, otherwise a
    /// de-correlated successor suitable for seeding the next instance.
    fn set_seed(&mut self, seed: u64, static_seed: bool) -> Result<u64, EnvError> {
        self.set_seed_impl(seed)?;
        Ok(if static_seed { seed } else { next_seed(seed) })
    }

    /// Step with an action sampled from the action spec.
    fn rand_step(
        &mut self,
        input: Option<&Record>,
        rng: &mut ChaCha8Rng,
    ) -> Result<Record, EnvError> {
        let keys = self.keys().clone();
        let spec = self
            .specs()
            .action_spec()
            .ok_or_else(|| EnvError::MissingAction {
                key: keys.action.to_string(),
            })?
            .clone();
        let mut td = match input {
            Some(td) => td.clone(),
            None => Record::with_device(self.batch_size(), self.device()),
        };
        td.set(&keys.action, spec.rand(rng))?;
        self.step(&td)
    }

    /// Alternate policy, step and transition for up to
    /// `options.max_steps` steps; see [`rollout`](crate::rollout::rollout).
    fn rollout(
        &mut self,
        options: RolloutOptions,
        policy: Option<&mut dyn Policy>,
    ) -> Result<Record, EnvError> {
        rollout(self, options, policy)
    }

    /// Relocate the environment to `device`.
    ///
    /// Default: succeeds only when already on `device`.
    fn to_device(&mut self, device: Device) -> Result<(), EnvError> {
        if device == self.device() {
            Ok(())
        } else {
            Err(EnvError::UnsupportedDevice { device })
        }
    }

    /// Invoke a named custom method.
    ///
    /// Default: no custom methods.
    fn call(&mut self, name: &str, _args: &[Value]) -> Result<Value, EnvError> {
        Err(EnvError::UnknownMethod {
            name: name.to_string(),
        })
    }

    /// Read a named custom attribute.
    ///
    /// Default: no custom attributes.
    fn get_attr(&self, name: &str) -> Result<Value, EnvError> {
        Err(EnvError::UnknownAttribute {
            name: name.to_string(),
        })
    }

    /// Snapshot of the environment's internal state.
    ///
    /// Default: an empty record.
    fn state_dict(&self) -> Result<Record, EnvError> {
        Ok(Record::new(&[]))
    }

    /// Restore a snapshot produced by [`state_dict`](Env::state_dict).
    ///
    /// Default: ignores the snapshot.
    fn load_state_dict(&mut self, _state: &Record) -> Result<(), EnvError> {
        Ok(())
    }

    /// Release resources. Must be idempotent.
    fn close(&mut self) -> Result<(), EnvError> {
        Ok(())
    }

    /// Whether [`close`](Env::close) has been called.
    fn is_closed(&self) -> bool {
        false
    }
}
