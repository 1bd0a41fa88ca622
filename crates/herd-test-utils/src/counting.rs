//! Counting environments: the observation is a counter advanced by the
//! action, and done fires once it exceeds `max_steps`.
//!
//! - [`CountingEnv`] keeps everything at root keys.
//! - [`NestedCountingEnv`] moves observation, action, reward and done
//!   under a `data` sub-record with an extra nested batch dimension.
//! - [`CountingPolicy`] always writes an action of ones.

use herd_core::{
    CompositeSpec, DType, Device, EnvError, KeyPath, Record, RecordError, Tensor, TensorSpec,
};
use herd_env::{Env, EnvKeys, EnvSpecs};

/// `batch` with a trailing unit dimension.
pub fn unit_shape(batch: &[usize]) -> Vec<usize> {
    let mut shape = batch.to_vec();
    shape.push(1);
    shape
}

/// A tensor of ones matching `spec`'s shape and dtype.
pub fn ones_like(spec: &TensorSpec) -> Tensor {
    match spec.dtype() {
        DType::F32 => Tensor::full_f32(spec.shape(), 1.0),
        DType::I64 => Tensor::full_i64(spec.shape(), 1),
        DType::Bool => Tensor::full_bool(spec.shape(), true),
    }
    .to(spec.device())
}

fn missing_action(key: &KeyPath) -> EnvError {
    EnvError::MissingAction {
        key: key.to_string(),
    }
}

// ── CountingEnv ─────────────────────────────────────────────────

/// Counts the actions it receives.
///
/// `observation` is the counter (as float), `done` is `counter >
/// max_steps`, `reward` is always zero. Reset puts the counter back to
/// `start_val`, only on masked elements when a `_reset` mask is given.
#[derive(Clone, Debug)]
pub struct CountingEnv {
    pub max_steps: i64,
    pub start_val: i64,
    batch_size: Vec<usize>,
    count: Tensor,
    specs: EnvSpecs,
    device: Device,
}

impl CountingEnv {
    pub fn new(max_steps: i64, batch_size: &[usize]) -> Self {
        let shape = unit_shape(batch_size);
        let mut specs = EnvSpecs::new(batch_size);
        specs.observation = specs.observation.with(
            "observation",
            TensorSpec::unbounded(&shape, DType::F32),
        );
        specs.action = specs
            .action
            .with("action", TensorSpec::binary(&shape, DType::I64));
        specs.reward = specs
            .reward
            .with("reward", TensorSpec::unbounded(&shape, DType::F32));
        specs.done = specs
            .done
            .with("done", TensorSpec::binary(&shape, DType::Bool));
        Self {
            max_steps,
            start_val: 0,
            batch_size: batch_size.to_vec(),
            count: Tensor::zeros(&shape, DType::I64),
            specs,
            device: Device::Cpu,
        }
    }

    pub fn with_start_val(mut self, start_val: i64) -> Self {
        self.start_val = start_val;
        self
    }

    /// Current counter, shape `(*batch, 1)`.
    pub fn count(&self) -> &Tensor {
        &self.count
    }

    fn counts(&self) -> &[i64] {
        self.count.as_i64().unwrap_or(&[])
    }

    /// Counter as a float observation.
    pub fn observation(&self) -> Result<Tensor, RecordError> {
        let data = self.counts().iter().map(|c| *c as f32).collect();
        Ok(Tensor::from_f32(self.count.shape(), data)?.to(self.device))
    }

    /// `counter > max_steps`, elementwise.
    pub fn done(&self) -> Result<Tensor, RecordError> {
        let data = self.counts().iter().map(|c| *c > self.max_steps).collect();
        Ok(Tensor::from_bool(self.count.shape(), data)?.to(self.device))
    }

    /// Reset the counter where `mask` is set (everywhere without one).
    pub fn reset_count(&mut self, mask: Option<&Tensor>) -> Result<(), RecordError> {
        let start = Tensor::full_i64(self.count.shape(), self.start_val);
        match mask {
            Some(mask) => self.count.assign_rows(mask, &start),
            None => {
                self.count = start;
                Ok(())
            }
        }
    }

    /// Add `action` (any dtype, shape `(*batch, 1)`) to the counter.
    pub fn advance(&mut self, action: &Tensor) -> Result<(), RecordError> {
        if action.shape() != self.count.shape() {
            return Err(RecordError::ShapeMismatch {
                key: "action".to_string(),
                expected: self.count.shape().to_vec(),
                got: action.shape().to_vec(),
            });
        }
        let increments: Vec<i64> = (0..action.numel())
            .map(|i| action.get_f64(i).unwrap_or(0.0) as i64)
            .collect();
        if let Some(counts) = self.count.as_i64_mut() {
            for (c, inc) in counts.iter_mut().zip(increments) {
                *c += inc;
            }
        }
        Ok(())
    }
}

impl Env for CountingEnv {
    fn batch_size(&self) -> &[usize] {
        &self.batch_size
    }

    fn device(&self) -> Device {
        self.device
    }

    fn specs(&self) -> &EnvSpecs {
        &self.specs
    }

    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        let reset_key = self.specs.keys.reset_key();
        self.reset_count(input.and_then(|td| td.tensor(&reset_key)))?;
        Ok(Record::with_device(&self.batch_size, self.device)
            .with("observation", self.observation()?)?
            .with("done", self.done()?)?)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        let key = self.specs.keys.action.clone();
        let action = input.tensor(&key).ok_or_else(|| missing_action(&key))?;
        self.advance(action)?;
        let reward = Tensor::zeros(self.count.shape(), DType::F32).to(self.device);
        Ok(Record::with_device(&self.batch_size, self.device)
            .with("observation", self.observation()?)?
            .with("done", self.done()?)?
            .with("reward", reward)?)
    }

    fn set_seed_impl(&mut self, _seed: u64) -> Result<(), EnvError> {
        Ok(())
    }

    fn to_device(&mut self, device: Device) -> Result<(), EnvError> {
        self.device = device;
        self.count.set_device(device);
        self.specs = self.specs.to(device);
        Ok(())
    }

    fn state_dict(&self) -> Result<Record, EnvError> {
        Ok(Record::new(&[]).with("count", self.count.clone())?)
    }

    fn load_state_dict(&mut self, state: &Record) -> Result<(), EnvError> {
        let count = state
            .tensor("count")
            .ok_or_else(|| RecordError::KeyNotFound {
                key: "count".to_string(),
            })?;
        self.count.copy_from(count)?;
        Ok(())
    }
}

// ── NestedCountingEnv ───────────────────────────────────────────

/// Which of the counting entries live under the nested `data` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nesting {
    pub obs_action: bool,
    pub done: bool,
    pub reward: bool,
}

impl Nesting {
    pub const ALL: Nesting = Nesting {
        obs_action: true,
        done: true,
        reward: true,
    };
}

/// A [`CountingEnv`] whose entries are (optionally) moved under `data`,
/// a sub-record of batch size `(*batch, nested_dim)`.
///
/// Nested leaves have shape `(*batch, nested_dim, 1)` and repeat the
/// root counter along the nested dimension. The nested observation is
/// named `states`. A nested action is reduced by max over the nested
/// dimension, and a nested `_reset` mask by any.
#[derive(Clone, Debug)]
pub struct NestedCountingEnv {
    inner: CountingEnv,
    nested_dim: usize,
    nesting: Nesting,
    observation_key: KeyPath,
    specs: EnvSpecs,
}

impl NestedCountingEnv {
    pub fn new(max_steps: i64, batch_size: &[usize], nested_dim: usize, nesting: Nesting) -> Self {
        let inner = CountingEnv::new(max_steps, batch_size);
        let mut nested_batch = batch_size.to_vec();
        nested_batch.push(nested_dim);

        let declare = |nest: bool, name: &str, flat: &str, dtype: DType, binary: bool| {
            let shape = unit_shape(if nest { nested_batch.as_slice() } else { batch_size });
            let leaf = if binary {
                TensorSpec::binary(&shape, dtype)
            } else {
                TensorSpec::unbounded(&shape, dtype)
            };
            let spec = CompositeSpec::new(batch_size);
            if nest {
                let data = CompositeSpec::new(&nested_batch).with(name, leaf);
                (KeyPath::from(("data", name)), spec.with("data", data))
            } else {
                (KeyPath::from(flat), spec.with(flat, leaf))
            }
        };
        let (observation_key, observation) =
            declare(nesting.obs_action, "states", "observation", DType::F32, false);
        let (action_key, action) = declare(nesting.obs_action, "action", "action", DType::I64, true);
        let (reward_key, reward) = declare(nesting.reward, "reward", "reward", DType::F32, false);
        let (done_key, done) = declare(nesting.done, "done", "done", DType::Bool, true);

        let specs = EnvSpecs {
            observation,
            action,
            reward,
            done,
            state: CompositeSpec::new(batch_size),
            keys: EnvKeys {
                action: action_key,
                reward: reward_key,
                done: done_key,
            },
        };
        Self {
            inner,
            nested_dim,
            nesting,
            observation_key,
            specs,
        }
    }

    /// Key-path of the observation (`data.states` when nested).
    pub fn observation_key(&self) -> &KeyPath {
        &self.observation_key
    }

    fn spread(&self, root: &Tensor) -> Result<Tensor, RecordError> {
        let copies: Vec<&Tensor> = (0..self.nested_dim).map(|_| root).collect();
        Tensor::stack(&copies, self.inner.batch_size.len())
    }

    /// Reduce `(*batch, nested_dim, 1)` to `(*batch, 1)` by max.
    fn collapse(&self, nested: &Tensor) -> Result<Tensor, RecordError> {
        let rows = nested.numel() / self.nested_dim.max(1);
        let data: Vec<i64> = (0..rows)
            .map(|r| {
                (0..self.nested_dim)
                    .filter_map(|j| nested.get_f64(r * self.nested_dim + j))
                    .fold(0.0_f64, f64::max) as i64
            })
            .collect();
        Tensor::from_i64(self.inner.count.shape(), data)
    }

    fn layout(&self, reward: Option<Tensor>) -> Result<Record, EnvError> {
        let device = self.inner.device;
        let mut out = Record::with_device(&self.inner.batch_size, device);
        let observation = self.inner.observation()?;
        let done = self.inner.done()?;
        let place = |out: &mut Record, key: &KeyPath, root: Tensor| -> Result<(), EnvError> {
            if key.len() > 1 {
                if !out.contains("data") {
                    let mut nested_batch = self.inner.batch_size.clone();
                    nested_batch.push(self.nested_dim);
                    out.set_record("data", Record::with_device(&nested_batch, device))?;
                }
                out.set(key, self.spread(&root)?)?;
            } else {
                out.set(key, root)?;
            }
            Ok(())
        };
        place(&mut out, &self.observation_key, observation)?;
        place(&mut out, &self.specs.keys.done, done)?;
        if let Some(reward) = reward {
            place(&mut out, &self.specs.keys.reward, reward)?;
        }
        Ok(out)
    }
}

impl Env for NestedCountingEnv {
    fn batch_size(&self) -> &[usize] {
        &self.inner.batch_size
    }

    fn device(&self) -> Device {
        self.inner.device
    }

    fn specs(&self) -> &EnvSpecs {
        &self.specs
    }

    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        let reset_key = self.specs.keys.reset_key();
        let mask = match input.and_then(|td| td.tensor(&reset_key)) {
            Some(mask) if self.nesting.done => Some(self.collapse(mask)?),
            Some(mask) => Some(mask.clone()),
            None => None,
        };
        self.inner.reset_count(mask.as_ref())?;
        self.layout(None)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        let key = self.specs.keys.action.clone();
        let action = input.tensor(&key).ok_or_else(|| missing_action(&key))?;
        let action = if self.nesting.obs_action {
            self.collapse(action)?
        } else {
            action.clone()
        };
        self.inner.advance(&action)?;
        let reward = Tensor::zeros(self.inner.count.shape(), DType::F32).to(self.inner.device);
        self.layout(Some(reward))
    }

    fn set_seed_impl(&mut self, _seed: u64) -> Result<(), EnvError> {
        Ok(())
    }

    fn to_device(&mut self, device: Device) -> Result<(), EnvError> {
        self.inner.to_device(device)?;
        self.specs = self.specs.to(device);
        Ok(())
    }
}

// ── CountingPolicy ──────────────────────────────────────────────

/// Always writes an action of ones at the action key.
#[derive(Clone, Debug)]
pub struct CountingPolicy {
    key: KeyPath,
    spec: TensorSpec,
}

impl CountingPolicy {
    /// A policy for an environment with `specs`.
    pub fn new(specs: &EnvSpecs) -> Option<Self> {
        Some(Self {
            key: specs.keys.action.clone(),
            spec: specs.action_spec()?.clone(),
        })
    }
}

impl herd_env::Policy for CountingPolicy {
    fn act(&mut self, input: &mut Record) -> Result<(), EnvError> {
        input.set(&self.key, ones_like(&self.spec))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_env::{step_mdp, Policy, RolloutOptions, StepMdpOptions};

    fn ones(batch: &[usize]) -> Tensor {
        Tensor::full_i64(&unit_shape(batch), 1)
    }

    #[test]
    fn counts_until_done() {
        let mut env = CountingEnv::new(3, &[2]);
        let mut td = env.reset(None).unwrap();
        for i in 0..3 {
            td.set("action", ones(&[2])).unwrap();
            let out = env.step(&td).unwrap();
            let obs = out.tensor(("next", "observation")).unwrap();
            assert_eq!(obs.as_f32().unwrap(), &[(i + 1) as f32; 2]);
            assert!(!out.tensor(("next", "done")).unwrap().any());
            td = step_mdp(&out, &StepMdpOptions::default()).unwrap();
        }
        td.set("action", ones(&[2])).unwrap();
        let out = env.step(&td).unwrap();
        assert!(out.tensor(("next", "done")).unwrap().all());
        assert_eq!(
            out.tensor(("next", "observation")).unwrap().as_f32().unwrap(),
            &[4.0, 4.0]
        );
    }

    #[test]
    fn masked_reset_keeps_unmasked_rows() {
        let mut env = CountingEnv::new(3, &[3]);
        env.reset(None).unwrap();
        for _ in 0..4 {
            let td = Record::new(&[3]).with("action", ones(&[3])).unwrap();
            env.step(&td).unwrap();
        }
        let mask = Tensor::from_bool(&[3, 1], vec![true, false, true]).unwrap();
        let td = Record::new(&[3]).with("_reset", mask).unwrap();
        let out = env.reset(Some(&td)).unwrap();
        assert_eq!(out.tensor("observation").unwrap().as_f32().unwrap(), &[0.0, 4.0, 0.0]);
        assert_eq!(
            out.tensor("done").unwrap().as_bool().unwrap(),
            &[false, true, false]
        );
    }

    #[test]
    fn full_reset_after_done_is_clean() {
        let mut env = CountingEnv::new(0, &[1]);
        env.reset(None).unwrap();
        let td = Record::new(&[1]).with("action", ones(&[1])).unwrap();
        env.step(&td).unwrap();
        assert!(env.reset(None).is_ok());
    }

    #[test]
    fn start_above_max_steps_is_done_after_reset() {
        let mut env = CountingEnv::new(3, &[1]).with_start_val(10);
        assert!(matches!(env.reset(None), Err(EnvError::DoneAfterReset)));
    }

    #[test]
    fn state_dict_round_trips_counter() {
        let mut env = CountingEnv::new(9, &[1]);
        env.reset(None).unwrap();
        let td = Record::new(&[1]).with("action", ones(&[1])).unwrap();
        env.step(&td).unwrap();
        let state = env.state_dict().unwrap();
        env.reset(None).unwrap();
        env.load_state_dict(&state).unwrap();
        assert_eq!(env.count().as_i64().unwrap(), &[1]);
    }

    #[test]
    fn nested_layout_has_extended_batch() {
        let mut env = NestedCountingEnv::new(3, &[4], 3, Nesting::ALL);
        let td = env.reset(None).unwrap();
        let data = td.record("data").unwrap();
        assert_eq!(data.batch_size(), &[4, 3]);
        assert_eq!(data.tensor("states").unwrap().shape(), &[4, 3, 1]);
        assert_eq!(data.tensor("done").unwrap().shape(), &[4, 3, 1]);
        assert_eq!(
            env.specs().action_spec().unwrap().shape(),
            &[4, 3, 1]
        );
    }

    #[test]
    fn nested_rollout_counts_with_policy() {
        let mut env = NestedCountingEnv::new(5, &[2], 3, Nesting::ALL);
        let mut policy = CountingPolicy::new(env.specs()).unwrap();
        let td = env
            .rollout(
                RolloutOptions::new(3),
                Some(&mut policy as &mut dyn Policy),
            )
            .unwrap();
        assert_eq!(td.batch_size(), &[2, 3]);
        assert_eq!(td.record("data").unwrap().batch_size(), &[2, 3, 3]);
        let last = td.tensor(("data", "states")).unwrap();
        // input observation at the last step is the count after two steps
        let values = last.as_f32().unwrap();
        assert_eq!(values[2 * 3], 2.0);
        let next = td.tensor(("next", "data", "states")).unwrap();
        assert_eq!(next.as_f32().unwrap()[2 * 3], 3.0);
    }

    #[test]
    fn partially_nested_keys() {
        let nesting = Nesting {
            obs_action: false,
            done: true,
            reward: false,
        };
        let mut env = NestedCountingEnv::new(3, &[2], 2, nesting);
        assert_eq!(env.specs().keys.reset_key(), KeyPath::from(("data", "_reset")));
        let td = env.reset(None).unwrap();
        assert_eq!(td.tensor("observation").unwrap().shape(), &[2, 1]);
        assert!(td.contains(("data", "done")));
        let mut policy = CountingPolicy::new(env.specs()).unwrap();
        let mut td = td;
        policy.act(&mut td).unwrap();
        let out = env.step(&td).unwrap();
        assert!(out.contains(("next", "reward")));
        assert!(out.contains(("next", "data", "done")));
    }
}
