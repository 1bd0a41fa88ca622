//! Rollouts: alternate policy, step and transition, then stack the
//! frames along a trailing time dimension.

use herd_core::{EnvError, KeyPath, Record, Tensor, TensorSpec};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::env::{Env, EnvSpecs};
use crate::seed::seeded_rng;
use crate::transition::{step_mdp, StepMdpOptions};

/// Writes an action into the current input record.
///
/// Implemented for any `FnMut(&mut Record) -> Result<(), EnvError>`.
pub trait Policy {
    /// Fill the action (and anything else the policy produces) in place.
    fn act(&mut self, input: &mut Record) -> Result<(), EnvError>;
}

impl<F> Policy for F
where
    F: FnMut(&mut Record) -> Result<(), EnvError>,
{
    fn act(&mut self, input: &mut Record) -> Result<(), EnvError> {
        self(input)
    }
}

/// Samples actions uniformly from an action spec.
#[derive(Clone, Debug)]
pub struct RandomPolicy {
    key: KeyPath,
    spec: TensorSpec,
    rng: ChaCha8Rng,
}

impl RandomPolicy {
    /// Sample `spec` into `key` with a generator seeded by `seed`.
    pub fn new(key: KeyPath, spec: TensorSpec, seed: u64) -> Self {
        Self {
            key,
            spec,
            rng: seeded_rng(seed),
        }
    }

    /// Sample the action spec of `specs` at its action key.
    pub fn from_specs(specs: &EnvSpecs, seed: u64) -> Result<Self, EnvError> {
        let spec = specs
            .action_spec()
            .ok_or_else(|| EnvError::MissingAction {
                key: specs.keys.action.to_string(),
            })?
            .clone();
        Ok(Self::new(specs.keys.action.clone(), spec, seed))
    }
}

impl Policy for RandomPolicy {
    fn act(&mut self, input: &mut Record) -> Result<(), EnvError> {
        input.set(&self.key, self.spec.rand(&mut self.rng))?;
        Ok(())
    }
}

/// Options for [`rollout`].
#[derive(Clone, Debug, PartialEq)]
pub struct RolloutOptions {
    /// Upper bound on the number of steps. Must be at least 1.
    pub max_steps: usize,
    /// Reset before the first step. When false, `initial` is required.
    pub auto_reset: bool,
    /// Stop after the first step reporting any done element.
    pub break_when_any_done: bool,
    /// Reset input (with `auto_reset`) or first step input (without).
    pub initial: Option<Record>,
    /// Seed of the random policy used when no policy is supplied.
    pub action_seed: u64,
}

impl RolloutOptions {
    /// Up to `max_steps` steps from a fresh reset, stopping on done.
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            auto_reset: true,
            break_when_any_done: true,
            initial: None,
            action_seed: 0,
        }
    }

    /// Set [`auto_reset`](Self::auto_reset).
    pub fn auto_reset(mut self, auto_reset: bool) -> Self {
        self.auto_reset = auto_reset;
        self
    }

    /// Set [`break_when_any_done`](Self::break_when_any_done).
    pub fn break_when_any_done(mut self, brk: bool) -> Self {
        self.break_when_any_done = brk;
        self
    }

    /// Set [`initial`](Self::initial).
    pub fn initial(mut self, initial: Record) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Set [`action_seed`](Self::action_seed).
    pub fn action_seed(mut self, seed: u64) -> Self {
        self.action_seed = seed;
        self
    }
}

/// Run `env` for up to `options.max_steps` steps.
///
/// Each frame is the full step output (input, action and `next`). Between
/// steps the transition keeps other entries and the previous action and
/// drops the reward. Frames are stacked along a new dimension right after
/// the batch dimensions, so the result's batch size is `(*batch, T)` and
/// nested records become `(*batch, T, *nested)`.
///
/// Without a policy, actions are sampled from the action spec with a
/// generator seeded by `options.action_seed`.
pub fn rollout<E: Env + ?Sized>(
    env: &mut E,
    options: RolloutOptions,
    policy: Option<&mut dyn Policy>,
) -> Result<Record, EnvError> {
    if options.max_steps == 0 {
        return Err(EnvError::InvalidConfig {
            reason: "rollout max_steps must be at least 1".to_string(),
        });
    }
    let keys = env.keys().clone();
    let mut td = if options.auto_reset {
        env.reset(options.initial.as_ref())?
    } else {
        options.initial.ok_or_else(|| EnvError::InvalidConfig {
            reason: "rollout without auto_reset needs an initial record".to_string(),
        })?
    };

    let mut fallback;
    let policy: &mut dyn Policy = match policy {
        Some(policy) => policy,
        None => {
            fallback = RandomPolicy::from_specs(env.specs(), options.action_seed)?;
            &mut fallback
        }
    };

    let transition = StepMdpOptions::with_keys(keys.clone()).exclude_action(false);
    let mut frames = Vec::with_capacity(options.max_steps);
    for _ in 0..options.max_steps {
        policy.act(&mut td)?;
        let out = env.step(&td)?;
        let done = out
            .record("next")
            .and_then(|next| next.tensor(&keys.done))
            .is_some_and(Tensor::any);
        td = step_mdp(&out, &transition)?;
        frames.push(out);
        if options.break_when_any_done && done {
            debug!(steps = frames.len(), "rollout stopped on done");
            break;
        }
    }

    let time_dim = frames.first().map_or(0, Record::batch_dims);
    let refs: Vec<&Record> = frames.iter().collect();
    Ok(Record::stack(&refs, time_dim)?)
}
