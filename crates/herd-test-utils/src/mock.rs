//! Mock environments with specific contract behaviours.
//!
//! - [`MockBatchedEnv`] — batch-locked or unlocked shape contract.
//! - [`RandomWalkEnv`] — seeded stochastic dynamics, custom methods and
//!   attributes, keyword-argument construction.

use herd_core::{DType, Device, EnvError, Kwargs, Record, RecordError, Tensor, TensorSpec, Value};
use herd_env::{seeded_rng, Env, EnvSpecs};
use rand_chacha::ChaCha8Rng;

use crate::counting::unit_shape;

// ── MockBatchedEnv ──────────────────────────────────────────────

/// Emits a step counter as observation. Unlocked instances step any
/// input whose batch size ends with their own.
#[derive(Clone, Debug)]
pub struct MockBatchedEnv {
    batch_size: Vec<usize>,
    locked: bool,
    counter: f32,
    specs: EnvSpecs,
}

impl MockBatchedEnv {
    pub fn locked(batch_size: &[usize]) -> Self {
        Self::new(batch_size, true)
    }

    pub fn unlocked(batch_size: &[usize]) -> Self {
        Self::new(batch_size, false)
    }

    fn new(batch_size: &[usize], locked: bool) -> Self {
        let shape = unit_shape(batch_size);
        let mut specs = EnvSpecs::new(batch_size);
        specs.observation = specs
            .observation
            .with("observation", TensorSpec::unbounded(&shape, DType::F32));
        specs.action = specs
            .action
            .with("action", TensorSpec::bounded(&shape, -1.0, 1.0));
        specs.reward = specs
            .reward
            .with("reward", TensorSpec::unbounded(&shape, DType::F32));
        specs.done = specs
            .done
            .with("done", TensorSpec::binary(&shape, DType::Bool));
        Self {
            batch_size: batch_size.to_vec(),
            locked,
            counter: 0.0,
            specs,
        }
    }

    fn output(&self, batch: &[usize]) -> Result<Record, RecordError> {
        let shape = unit_shape(batch);
        Record::new(batch)
            .with("observation", Tensor::full_f32(&shape, self.counter))?
            .with("done", Tensor::full_bool(&shape, false))
    }
}

impl Env for MockBatchedEnv {
    fn batch_size(&self) -> &[usize] {
        &self.batch_size
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn specs(&self) -> &EnvSpecs {
        &self.specs
    }

    fn batch_locked(&self) -> bool {
        self.locked
    }

    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        self.counter = 0.0;
        let batch = input.map_or(self.batch_size.as_slice(), Record::batch_size);
        Ok(self.output(batch)?)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        self.counter += 1.0;
        let batch = input.batch_size();
        Ok(self
            .output(batch)?
            .with("reward", Tensor::full_f32(&unit_shape(batch), 1.0))?)
    }

    fn set_seed_impl(&mut self, _seed: u64) -> Result<(), EnvError> {
        Ok(())
    }
}

// ── RandomWalkEnv ───────────────────────────────────────────────

/// A noisy random walk in `dim` dimensions.
///
/// Reset draws the start position from the seeded generator; each step
/// adds the action plus Gaussian noise. Reward is the negative L1 norm of
/// the position; done fires after `max_steps` steps.
///
/// Custom surface: method `custom_fun` returns 0 and `steps` the step
/// count; attributes `custom_attr` (1), `custom_prop` (2), `seed` and
/// `dim`.
#[derive(Clone, Debug)]
pub struct RandomWalkEnv {
    batch_size: Vec<usize>,
    dim: usize,
    max_steps: usize,
    steps: usize,
    position: Tensor,
    rng: ChaCha8Rng,
    seed: Option<u64>,
    specs: EnvSpecs,
    device: Device,
}

impl RandomWalkEnv {
    pub fn new(batch_size: &[usize], dim: usize, max_steps: usize) -> Self {
        let mut shape = batch_size.to_vec();
        shape.push(dim);
        let flag = unit_shape(batch_size);
        let mut specs = EnvSpecs::new(batch_size);
        specs.observation = specs
            .observation
            .with("observation", TensorSpec::unbounded(&shape, DType::F32));
        specs.action = specs
            .action
            .with("action", TensorSpec::bounded(&shape, -1.0, 1.0));
        specs.reward = specs
            .reward
            .with("reward", TensorSpec::unbounded(&flag, DType::F32));
        specs.done = specs
            .done
            .with("done", TensorSpec::binary(&flag, DType::Bool));
        Self {
            batch_size: batch_size.to_vec(),
            dim,
            max_steps,
            steps: 0,
            position: Tensor::zeros(&shape, DType::F32),
            rng: seeded_rng(0),
            seed: None,
            specs,
            device: Device::Cpu,
        }
    }

    /// Build from keyword arguments: `dim` (default 2), `max_steps`
    /// (default 10) and an optional `seed`.
    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Self, EnvError> {
        let int = |name: &str, default: i64| -> Result<i64, EnvError> {
            match kwargs.get(name) {
                None => Ok(default),
                Some(value) => value.as_int().ok_or_else(|| EnvError::InvalidConfig {
                    reason: format!("kwarg '{name}' must be an integer, got {value:?}"),
                }),
            }
        };
        let dim = usize::try_from(int("dim", 2)?).unwrap_or(2);
        let max_steps = usize::try_from(int("max_steps", 10)?).unwrap_or(10);
        let mut env = Self::new(&[], dim, max_steps);
        if kwargs.contains_key("seed") {
            env.set_seed_impl(int("seed", 0)? as u64)?;
        }
        Ok(env)
    }

    fn flag_shape(&self) -> Vec<usize> {
        unit_shape(&self.batch_size)
    }

    fn noise(&mut self) -> Tensor {
        TensorSpec::unbounded(self.position.shape(), DType::F32).rand(&mut self.rng)
    }
}

impl Env for RandomWalkEnv {
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
        let fresh = self.noise().to(self.device);
        let reset_key = self.specs.keys.reset_key();
        match input.and_then(|td| td.tensor(&reset_key)) {
            Some(mask) => self.position.assign_rows(mask, &fresh)?,
            None => {
                self.position = fresh;
                self.steps = 0;
            }
        }
        Ok(Record::with_device(&self.batch_size, self.device)
            .with("observation", self.position.clone())?
            .with("done", Tensor::full_bool(&self.flag_shape(), false).to(self.device))?)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        let action = input
            .tensor("action")
            .ok_or_else(|| EnvError::MissingAction {
                key: "action".to_string(),
            })?
            .clone();
        if action.shape() != self.position.shape() {
            return Err(RecordError::ShapeMismatch {
                key: "action".to_string(),
                expected: self.position.shape().to_vec(),
                got: action.shape().to_vec(),
            }
            .into());
        }
        let noise = self.noise();
        let moves = action.as_f32().unwrap_or(&[]);
        let jitter = noise.as_f32().unwrap_or(&[]);
        if let Some(position) = self.position.as_f32_mut() {
            for ((p, a), n) in position.iter_mut().zip(moves).zip(jitter) {
                *p += a + 0.1 * n;
            }
        }
        self.steps += 1;

        let reward: Vec<f32> = self
            .position
            .as_f32()
            .unwrap_or(&[])
            .chunks(self.dim.max(1))
            .map(|row| -row.iter().map(|x| x.abs()).sum::<f32>())
            .collect();
        let flag = self.flag_shape();
        Ok(Record::with_device(&self.batch_size, self.device)
            .with("observation", self.position.clone())?
            .with("reward", Tensor::from_f32(&flag, reward)?.to(self.device))?
            .with(
                "done",
                Tensor::full_bool(&flag, self.steps >= self.max_steps).to(self.device),
            )?)
    }

    fn set_seed_impl(&mut self, seed: u64) -> Result<(), EnvError> {
        self.rng = seeded_rng(seed);
        self.seed = Some(seed);
        Ok(())
    }

    fn to_device(&mut self, device: Device) -> Result<(), EnvError> {
        self.device = device;
        self.position.set_device(device);
        self.specs = self.specs.to(device);
        Ok(())
    }

    fn call(&mut self, name: &str, _args: &[Value]) -> Result<Value, EnvError> {
        match name {
            "custom_fun" => Ok(Value::Int(0)),
            "steps" => Ok(Value::Int(self.steps as i64)),
            _ => Err(EnvError::UnknownMethod {
                name: name.to_string(),
            }),
        }
    }

    fn get_attr(&self, name: &str) -> Result<Value, EnvError> {
        match name {
            "custom_attr" => Ok(Value::Int(1)),
            "custom_prop" => Ok(Value::Int(2)),
            "dim" => Ok(Value::Int(self.dim as i64)),
            "seed" => Ok(self.seed.map_or(Value::Unit, |s| Value::Int(s as i64))),
            _ => Err(EnvError::UnknownAttribute {
                name: name.to_string(),
            }),
        }
    }

    fn state_dict(&self) -> Result<Record, EnvError> {
        Ok(Record::new(&[])
            .with("position", self.position.clone())?
            .with("steps", Tensor::full_i64(&[1], self.steps as i64))?)
    }

    fn load_state_dict(&mut self, state: &Record) -> Result<(), EnvError> {
        let missing = |key: &str| RecordError::KeyNotFound {
            key: key.to_string(),
        };
        let position = state.tensor("position").ok_or_else(|| missing("position"))?;
        let steps = state.tensor("steps").ok_or_else(|| missing("steps"))?;
        self.position.copy_from(position)?;
        self.steps = steps.get_f64(0).unwrap_or(0.0) as usize;
        Ok(())
    }
}
