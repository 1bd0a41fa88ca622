//! In-process batched driver.
//!
//! [`SerialEnv`] owns N instances and runs every batched call through
//! them one after another on the calling thread.

use herd_core::{Device, EnvError, Record, Value};
use herd_env::{Env, EnvSpecs, StepMdpOptions};
use tracing::debug;

use crate::batched::BatchedEnv;
use crate::config::{BatchedEnvConfig, ConfigError};
use crate::factory::{EnvFactory, EnvKwargs};
use crate::shared::{
    instance_input, reset_targets, resolve_factories, resolve_kwargs, start_instance, state_view,
    worker_failed, BatchLayout, DriverState, SlotData,
};

/// Sequential batched driver.
///
/// Same contract as [`ParallelEnv`](crate::parallel::ParallelEnv); with
/// identical factories, seeds and actions both produce bit-identical
/// records.
pub struct SerialEnv {
    factories: Vec<EnvFactory>,
    kwargs: Vec<EnvKwargs>,
    config: BatchedEnvConfig,
    layout: BatchLayout,
    view: StepMdpOptions,
    state: DriverState,
    envs: Vec<Box<dyn Env>>,
    slots: Vec<SlotData>,
}

impl SerialEnv {
    /// `config.num_workers` instances of one task.
    pub fn new(factory: EnvFactory, config: BatchedEnvConfig) -> Result<Self, EnvError> {
        Self::with_factories(vec![factory], Vec::new(), config)
    }

    /// One factory per instance (or one shared), with optional
    /// per-instance keyword arguments.
    ///
    /// Builds one probe instance per distinct factory to learn batch
    /// size, specs and device, then closes it.
    pub fn with_factories(
        factories: Vec<EnvFactory>,
        kwargs: Vec<EnvKwargs>,
        config: BatchedEnvConfig,
    ) -> Result<Self, EnvError> {
        config.validate()?;
        let n = config.num_workers;
        let factories = resolve_factories(factories, n)?;
        let kwargs = resolve_kwargs(kwargs, n)?;
        let layout = BatchLayout::probe(&factories, &kwargs, &config)?;
        let view = state_view(layout.keys());
        Ok(Self {
            factories,
            kwargs,
            config,
            layout,
            view,
            state: DriverState::Constructed,
            envs: Vec::new(),
            slots: Vec::new(),
        })
    }

    fn ensure_started(&mut self) -> Result<(), EnvError> {
        match self.state {
            DriverState::Constructed => self.start(),
            DriverState::Closed => Err(EnvError::Closed),
            DriverState::Started | DriverState::Running => Ok(()),
        }
    }

    fn each<T>(
        &mut self,
        mut op: impl FnMut(&mut dyn Env) -> Result<T, EnvError>,
    ) -> Result<Vec<T>, EnvError> {
        self.ensure_started()?;
        self.envs
            .iter_mut()
            .enumerate()
            .map(|(i, env)| op(env.as_mut()).map_err(|e| worker_failed(i, e)))
            .collect()
    }

    fn gather(
        &self,
        pick: for<'a> fn(&'a SlotData) -> Result<&'a Record, EnvError>,
    ) -> Result<Record, EnvError> {
        let rows = self
            .slots
            .iter()
            .map(pick)
            .collect::<Result<Vec<_>, _>>()?;
        self.layout.gather(&rows)
    }
}

impl Env for SerialEnv {
    fn batch_size(&self) -> &[usize] {
        &self.layout.batch_size
    }

    fn device(&self) -> Device {
        self.layout.device
    }

    fn specs(&self) -> &EnvSpecs {
        &self.layout.specs
    }

    fn reset_impl(&mut self, input: Option<&Record>) -> Result<Record, EnvError> {
        self.ensure_started()?;
        let targets = reset_targets(input, &self.layout.keys().reset_key(), self.envs.len())?;
        for (i, env) in self.envs.iter_mut().enumerate() {
            if !targets[i] {
                continue;
            }
            let sub = instance_input(input, i)?;
            let out = env.reset(sub.as_ref()).map_err(|e| worker_failed(i, e))?;
            self.slots[i].record_reset(out)?;
        }
        self.state = DriverState::Running;
        self.gather(SlotData::state)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        self.ensure_started()?;
        for (i, env) in self.envs.iter_mut().enumerate() {
            let sub = input.index(i)?;
            let out = env.step(&sub).map_err(|e| worker_failed(i, e))?;
            self.slots[i].record_step(&out, &self.view)?;
        }
        self.state = DriverState::Running;
        self.gather(SlotData::next)
    }

    fn set_seed_impl(&mut self, seed: u64) -> Result<(), EnvError> {
        self.set_seed(seed, false).map(|_| ())
    }

    /// Seed instance 0 with `seed` and every following instance with the
    /// seed its predecessor returned. Returns the last instance's
    /// returned seed.
    fn set_seed(&mut self, seed: u64, static_seed: bool) -> Result<u64, EnvError> {
        self.ensure_started()?;
        let mut seed = seed;
        for (i, env) in self.envs.iter_mut().enumerate() {
            seed = env
                .set_seed(seed, static_seed)
                .map_err(|e| worker_failed(i, e))?;
        }
        Ok(seed)
    }

    fn to_device(&mut self, device: Device) -> Result<(), EnvError> {
        match self.state {
            DriverState::Closed => return Err(EnvError::Closed),
            DriverState::Constructed => {}
            DriverState::Started | DriverState::Running => {
                for (i, env) in self.envs.iter_mut().enumerate() {
                    env.to_device(device).map_err(|e| worker_failed(i, e))?;
                }
                for slot in &mut self.slots {
                    slot.relocate(device);
                }
            }
        }
        self.config.device = Some(device);
        self.layout.relocate(device);
        debug!(%device, "serial env relocated");
        Ok(())
    }

    fn close(&mut self) -> Result<(), EnvError> {
        if self.state == DriverState::Closed {
            return Ok(());
        }
        self.state = DriverState::Closed;
        let mut result = Ok(());
        for (i, mut env) in self.envs.drain(..).enumerate() {
            if let Err(e) = env.close() {
                if result.is_ok() {
                    result = Err(worker_failed(i, e));
                }
            }
        }
        self.slots.clear();
        debug!("serial env closed");
        result
    }

    fn is_closed(&self) -> bool {
        self.state == DriverState::Closed
    }
}

impl BatchedEnv for SerialEnv {
    fn start(&mut self) -> Result<(), EnvError> {
        match self.state {
            DriverState::Constructed => {}
            DriverState::Closed => return Err(EnvError::Closed),
            DriverState::Started | DriverState::Running => {
                return Err(ConfigError::AlreadyStarted.into())
            }
        }
        let mut envs = Vec::with_capacity(self.factories.len());
        let mut slots = Vec::with_capacity(self.factories.len());
        for (i, (factory, kwargs)) in self.factories.iter().zip(&self.kwargs).enumerate() {
            match start_instance(factory, kwargs, self.config.device) {
                Ok((env, first)) => {
                    envs.push(env);
                    slots.push(SlotData {
                        state: Some(first),
                        next: None,
                    });
                }
                Err(e) => {
                    for env in &mut envs {
                        let _ = env.close();
                    }
                    return Err(worker_failed(i, e));
                }
            }
        }
        self.envs = envs;
        self.slots = slots;
        self.state = DriverState::Started;
        debug!(num_workers = self.envs.len(), "serial env started");
        Ok(())
    }

    fn state(&self) -> DriverState {
        self.state
    }

    fn num_workers(&self) -> usize {
        self.factories.len()
    }

    fn single_task(&self) -> bool {
        self.layout.single_task
    }

    fn update_kwargs(&mut self, kwargs: Vec<EnvKwargs>) -> Result<(), EnvError> {
        match self.state {
            DriverState::Constructed => {}
            DriverState::Closed => return Err(EnvError::Closed),
            DriverState::Started | DriverState::Running => {
                return Err(ConfigError::AlreadyStarted.into())
            }
        }
        let kwargs = resolve_kwargs(kwargs, self.factories.len())?;
        self.layout = BatchLayout::probe(&self.factories, &kwargs, &self.config)?;
        self.view = state_view(self.layout.keys());
        self.kwargs = kwargs;
        Ok(())
    }

    fn call_all(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, EnvError> {
        self.each(|env| env.call(name, args))
    }

    fn get_attr_all(&mut self, name: &str) -> Result<Vec<Value>, EnvError> {
        self.each(|env| env.get_attr(name))
    }

    fn state_dicts(&mut self) -> Result<Vec<Record>, EnvError> {
        self.each(|env| env.state_dict())
    }

    fn load_state_dicts(&mut self, states: &[Record]) -> Result<(), EnvError> {
        if states.len() != self.factories.len() {
            return Err(EnvError::SchemaMismatch {
                reason: format!(
                    "expected {} state dicts, got {}",
                    self.factories.len(),
                    states.len()
                ),
            });
        }
        let mut states = states.iter();
        self.each(|env| match states.next() {
            Some(state) => env.load_state_dict(state),
            None => Ok(()),
        })?;
        Ok(())
    }
}

impl Drop for SerialEnv {
    fn drop(&mut self) {
        if self.state != DriverState::Closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_core::Tensor;
    use herd_test_utils::{CountingEnv, FailingEnv, FailureMode, MockBatchedEnv};

    fn counting(n: usize) -> SerialEnv {
        SerialEnv::new(
            EnvFactory::new(|| CountingEnv::new(3, &[])),
            BatchedEnvConfig::new(n),
        )
        .unwrap()
    }

    fn ones(env: &SerialEnv, td: Record) -> Record {
        let shape = env.specs().action_spec().unwrap().shape().to_vec();
        td.with("action", Tensor::full_i64(&shape, 1)).unwrap()
    }

    #[test]
    fn instances_start_lazily() {
        let mut env = counting(2);
        assert_eq!(env.state(), DriverState::Constructed);
        assert_eq!(env.batch_size(), &[2]);
        env.reset(None).unwrap();
        assert_eq!(env.state(), DriverState::Running);
        match env.start() {
            Err(EnvError::InvalidConfig { .. }) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn step_stacks_instance_outputs() {
        let mut env = counting(3);
        let td = env.reset(None).unwrap();
        let out = env.step(&ones(&env, td)).unwrap();
        assert_eq!(
            out.tensor(("next", "observation")),
            Some(&Tensor::full_f32(&[3, 1], 1.0))
        );
        assert_eq!(out.record("next").unwrap().batch_size(), &[3]);
    }

    #[test]
    fn failures_carry_instance_index() {
        let mut env = SerialEnv::with_factories(
            vec![
                EnvFactory::new(|| FailingEnv::new(10, FailureMode::Error)),
                EnvFactory::new(|| FailingEnv::new(1, FailureMode::Error)),
            ],
            Vec::new(),
            BatchedEnvConfig::new(2).with_share_individual_td(true),
        )
        .unwrap();
        let td = env.reset(None).unwrap();
        match env.step(&ones(&env, td)) {
            Err(EnvError::WorkerFailed { worker_index: 1, source }) => {
                assert!(matches!(*source, EnvError::Simulation { .. }));
            }
            other => panic!("expected WorkerFailed, got {other:?}"),
        }
    }

    #[test]
    fn unlocked_instances_still_give_a_locked_batch() {
        let mut env = SerialEnv::new(
            EnvFactory::new(|| MockBatchedEnv::unlocked(&[2])),
            BatchedEnvConfig::new(3),
        )
        .unwrap();
        assert!(env.batch_locked());
        let wrong = Record::new(&[2, 3, 2]);
        match env.reset(Some(&wrong)) {
            Err(EnvError::BatchSizeMismatch { .. }) => {}
            other => panic!("expected BatchSizeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn update_kwargs_only_before_start() {
        let mut env = counting(2);
        env.update_kwargs(vec![EnvKwargs::new()]).unwrap();
        env.start().unwrap();
        assert!(env.update_kwargs(Vec::new()).is_err());
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let mut env = counting(2);
        env.reset(None).unwrap();
        env.close().unwrap();
        env.close().unwrap();
        assert!(env.is_closed());
        match env.reset(None) {
            Err(EnvError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
