//! Fixtures for heterogeneous batches, step-only entries and failure
//! paths.

use std::thread;
use std::time::Duration;

use herd_core::{DType, Device, EnvError, Record, Tensor, TensorSpec, Value};
use herd_env::{Env, EnvSpecs};

use crate::counting::{unit_shape, CountingEnv};

// ── TaskEnv ─────────────────────────────────────────────────────

/// A single-instance env whose observation schema depends on its task.
///
/// Every task shares `observation`; each also emits an exclusive entry
/// named after the task that holds the step count. Action is a float
/// added to `observation`; done fires after `max_steps` steps.
#[derive(Clone, Debug)]
pub struct TaskEnv {
    pub task: String,
    pub max_steps: usize,
    steps: usize,
    position: f32,
    specs: EnvSpecs,
}

impl TaskEnv {
    pub fn new(task: impl Into<String>, max_steps: usize) -> Self {
        let task = task.into();
        let one = [1];
        let mut specs = EnvSpecs::new(&[]);
        specs.observation = specs
            .observation
            .with("observation", TensorSpec::unbounded(&one, DType::F32))
            .with(&task, TensorSpec::unbounded(&one, DType::F32));
        specs.action = specs
            .action
            .with("action", TensorSpec::bounded(&one, -1.0, 1.0));
        specs.reward = specs
            .reward
            .with("reward", TensorSpec::unbounded(&one, DType::F32));
        specs.done = specs
            .done
            .with("done", TensorSpec::binary(&one, DType::Bool));
        Self {
            task,
            max_steps,
            steps: 0,
            position: 0.0,
            specs,
        }
    }

    fn observe(&self) -> Result<Record, EnvError> {
        Ok(Record::new(&[])
            .with("observation", Tensor::full_f32(&[1], self.position))?
            .with(self.task.as_str(), Tensor::full_f32(&[1], self.steps as f32))?
            .with("done", Tensor::full_bool(&[1], self.steps >= self.max_steps))?)
    }
}

impl Env for TaskEnv {
    fn batch_size(&self) -> &[usize] {
        &[]
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn specs(&self) -> &EnvSpecs {
        &self.specs
    }

    fn reset_impl(&mut self, _input: Option<&Record>) -> Result<Record, EnvError> {
        self.steps = 0;
        self.position = 0.0;
        self.observe()
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        let action = input
            .tensor("action")
            .and_then(|a| a.get_f64(0))
            .unwrap_or(0.0);
        self.position += action as f32;
        self.steps += 1;
        Ok(self
            .observe()?
            .with("reward", Tensor::full_f32(&[1], self.position))?)
    }

    fn set_seed_impl(&mut self, _seed: u64) -> Result<(), EnvError> {
        Ok(())
    }

    fn get_attr(&self, name: &str) -> Result<Value, EnvError> {
        match name {
            "task" => Ok(Value::from(self.task.as_str())),
            _ => Err(EnvError::UnknownAttribute {
                name: name.to_string(),
            }),
        }
    }
}

// ── TruncatingEnv ───────────────────────────────────────────────

/// A [`CountingEnv`] that declares a `truncated` done flag but reports
/// it only from `step`, where it is `counter >= truncate_at`.
#[derive(Clone, Debug)]
pub struct TruncatingEnv {
    pub truncate_at: i64,
    inner: CountingEnv,
    specs: EnvSpecs,
}

impl TruncatingEnv {
    pub fn new(max_steps: i64, truncate_at: i64, batch_size: &[usize]) -> Self {
        let inner = CountingEnv::new(max_steps, batch_size);
        let mut specs = inner.specs().clone();
        specs.done = specs.done.with(
            "truncated",
            TensorSpec::binary(&unit_shape(batch_size), DType::Bool),
        );
        Self {
            truncate_at,
            inner,
            specs,
        }
    }
}

impl Env for TruncatingEnv {
    fn batch_size(&self) -> &[usize] {
        self.inner.batch_size()
    }

    fn device(&self) -> Device {
        self.inner.device()
    }

    fn specs(&self) -> &EnvSpecs {
        &self.specs
    }

    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        self.inner.reset_impl(input)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        let out = self.inner.step_impl(input)?;
        let count = self.inner.count();
        let truncated = count
            .as_i64()
            .unwrap_or(&[])
            .iter()
            .map(|c| *c >= self.truncate_at)
            .collect();
        Ok(out.with("truncated", Tensor::from_bool(count.shape(), truncated)?)?)
    }

    fn set_seed_impl(&mut self, seed: u64) -> Result<(), EnvError> {
        self.inner.set_seed_impl(seed)
    }
}

// ── FailingEnv ──────────────────────────────────────────────────

/// How a [`FailingEnv`] fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureMode {
    /// Return [`EnvError::Simulation`].
    Error,
    /// Panic inside `step_impl`.
    Panic,
}

/// A [`CountingEnv`] that fails on its `fail_at`-th step (1-based).
#[derive(Clone, Debug)]
pub struct FailingEnv {
    pub fail_at: usize,
    pub mode: FailureMode,
    steps: usize,
    inner: CountingEnv,
}

impl FailingEnv {
    pub fn new(fail_at: usize, mode: FailureMode) -> Self {
        Self {
            fail_at,
            mode,
            steps: 0,
            inner: CountingEnv::new(100, &[]),
        }
    }
}

impl Env for FailingEnv {
    fn batch_size(&self) -> &[usize] {
        self.inner.batch_size()
    }

    fn device(&self) -> Device {
        self.inner.device()
    }

    fn specs(&self) -> &EnvSpecs {
        self.inner.specs()
    }

    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        self.inner.reset_impl(input)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        self.steps += 1;
        if self.steps >= self.fail_at {
            match self.mode {
                FailureMode::Error => {
                    return Err(EnvError::Simulation {
                        reason: format!("injected failure at step {}", self.steps),
                    })
                }
                FailureMode::Panic => panic!("injected panic at step {}", self.steps),
            }
        }
        self.inner.step_impl(input)
    }

    fn set_seed_impl(&mut self, seed: u64) -> Result<(), EnvError> {
        self.inner.set_seed_impl(seed)
    }
}

// ── HangingEnv ──────────────────────────────────────────────────

/// A [`CountingEnv`] that sleeps for `delay` inside every step.
#[derive(Clone, Debug)]
pub struct HangingEnv {
    pub delay: Duration,
    inner: CountingEnv,
}

impl HangingEnv {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: CountingEnv::new(100, &[]),
        }
    }
}

impl Env for HangingEnv {
    fn batch_size(&self) -> &[usize] {
        self.inner.batch_size()
    }

    fn device(&self) -> Device {
        self.inner.device()
    }

    fn specs(&self) -> &EnvSpecs {
        self.inner.specs()
    }

    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        self.inner.reset_impl(input)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        thread::sleep(self.delay);
        self.inner.step_impl(input)
    }

    fn set_seed_impl(&mut self, seed: u64) -> Result<(), EnvError> {
        self.inner.set_seed_impl(seed)
    }
}
