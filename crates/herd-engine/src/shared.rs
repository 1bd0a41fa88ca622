//! Pieces shared by both drivers: construction-time probing, lifecycle
//! state, per-instance result slots and batch gathering.

use std::sync::{Mutex, MutexGuard, PoisonError};

use herd_core::{Device, EnvError, KeyPath, Record};
use herd_env::{step_mdp, step_mdp_into, Env, EnvKeys, EnvSpecs, StepMdpOptions};
use tracing::debug;

use crate::config::{BatchedEnvConfig, ConfigError};
use crate::factory::{EnvFactory, EnvKwargs};

// ── DriverState ──────────────────────────────────────────────────

/// Lifecycle of a batched driver.
///
/// `Constructed -> Started -> Running -> Closed`. Instances are built
/// on the transition to `Started`; the first reset or step moves the
/// driver to `Running`. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    /// Configured; no instance exists yet.
    Constructed,
    /// Every instance is built and has completed its handshake reset.
    Started,
    /// At least one batched reset or step has completed.
    Running,
    /// Closed; every further operation fails with [`EnvError::Closed`].
    Closed,
}

// ── BatchLayout ──────────────────────────────────────────────────

/// What a driver knows about its instances before they exist.
#[derive(Clone, Debug)]
pub(crate) struct BatchLayout {
    /// `[N, *instance_batch]`.
    pub batch_size: Vec<usize>,
    /// Instance specs expanded by `[N]`.
    pub specs: EnvSpecs,
    pub device: Device,
    pub single_task: bool,
    /// Stack with [`Record::stack_padded`] instead of [`Record::stack`].
    pub padded: bool,
}

impl BatchLayout {
    /// Build one instance per distinct task in the calling thread, read
    /// its metadata, and close it again.
    pub fn probe(
        factories: &[EnvFactory],
        kwargs: &[EnvKwargs],
        config: &BatchedEnvConfig,
    ) -> Result<Self, EnvError> {
        let n = config.num_workers;
        let single_task = factories.iter().all(|f| f.same_task(&factories[0]));
        let padded = config.resolve_padding(single_task)?;

        let mut probed: Vec<(usize, Vec<usize>, EnvSpecs, Device)> = Vec::new();
        for (i, factory) in factories.iter().enumerate() {
            if factories[..i].iter().any(|f| f.same_task(factory)) {
                continue;
            }
            let mut env = factory.build(&kwargs[i]).map_err(|e| worker_failed(i, e))?;
            probed.push((i, env.batch_size().to_vec(), env.specs().clone(), env.device()));
            env.close().map_err(|e| worker_failed(i, e))?;
        }

        let Some((_, instance_batch, first_specs, first_device)) = probed.first() else {
            return Err(ConfigError::NoWorkers.into());
        };
        let mut specs = first_specs.clone();
        for (i, batch, other, _) in &probed[1..] {
            if batch != instance_batch {
                return Err(EnvError::SchemaMismatch {
                    reason: format!(
                        "instance {i} has batch size {batch:?}, instance 0 has {instance_batch:?}"
                    ),
                });
            }
            if other.keys != specs.keys {
                return Err(EnvError::SchemaMismatch {
                    reason: format!("instance {i} declares different action/reward/done keys"),
                });
            }
            specs.observation.merge(&other.observation);
            specs.state.merge(&other.state);
        }

        let device = config.device.unwrap_or(*first_device);
        let mut batch_size = vec![n];
        batch_size.extend_from_slice(instance_batch);
        debug!(
            num_workers = n,
            tasks = probed.len(),
            padded,
            "probed batched env layout"
        );
        Ok(Self {
            batch_size,
            specs: specs.expand(&[n]).to(device),
            device,
            single_task,
            padded,
        })
    }

    pub fn keys(&self) -> &EnvKeys {
        &self.specs.keys
    }

    pub fn relocate(&mut self, device: Device) {
        self.device = device;
        self.specs = self.specs.to(device);
    }

    /// Stack one record per instance along a new first dimension.
    pub fn gather(&self, rows: &[&Record]) -> Result<Record, EnvError> {
        let stacked = if self.padded {
            Record::stack_padded(rows)?
        } else {
            Record::stack(rows, 0)?
        };
        Ok(stacked)
    }
}

/// Replicate a single factory to `n`, or accept exactly `n`.
pub(crate) fn resolve_factories(
    factories: Vec<EnvFactory>,
    n: usize,
) -> Result<Vec<EnvFactory>, ConfigError> {
    match factories.len() {
        1 => Ok(vec![factories[0].clone(); n]),
        len if len == n => Ok(factories),
        got => Err(ConfigError::FactoryCountMismatch { expected: n, got }),
    }
}

/// Accept no kwargs, one shared entry, or exactly `n`.
pub(crate) fn resolve_kwargs(
    kwargs: Vec<EnvKwargs>,
    n: usize,
) -> Result<Vec<EnvKwargs>, ConfigError> {
    match kwargs.len() {
        0 => Ok(vec![EnvKwargs::new(); n]),
        1 => Ok(vec![kwargs[0].clone(); n]),
        len if len == n => Ok(kwargs),
        got => Err(ConfigError::KwargsCountMismatch { expected: n, got }),
    }
}

// ── Per-instance helpers ─────────────────────────────────────────

/// Annotate an instance error with its index.
pub(crate) fn worker_failed(worker_index: usize, source: EnvError) -> EnvError {
    EnvError::WorkerFailed {
        worker_index,
        source: Box::new(source),
    }
}

/// Build one instance, move it to `device`, and run its first reset.
pub(crate) fn start_instance(
    factory: &EnvFactory,
    kwargs: &EnvKwargs,
    device: Option<Device>,
) -> Result<(Box<dyn Env>, Record), EnvError> {
    let mut env = factory.build(kwargs)?;
    if let Some(device) = device {
        if device != env.device() {
            env.to_device(device)?;
        }
    }
    let first = env.reset(None)?;
    Ok((env, first))
}

/// Which instances a batched reset touches.
///
/// Without a `_reset` mask every instance is reset. With one, instance
/// `i` is reset when its slice of the mask has any set element.
pub(crate) fn reset_targets(
    input: Option<&Record>,
    reset_key: &KeyPath,
    n: usize,
) -> Result<Vec<bool>, EnvError> {
    let Some(mask) = input.and_then(|td| td.tensor(reset_key)) else {
        return Ok(vec![true; n]);
    };
    (0..n)
        .map(|i| -> Result<bool, EnvError> { Ok(mask.select(i)?.any()) })
        .collect()
}

/// Row `i` of an optional batched input.
pub(crate) fn instance_input(input: Option<&Record>, i: usize) -> Result<Option<Record>, EnvError> {
    Ok(input.map(|td| td.index(i)).transpose()?)
}

/// Transition that keeps an instance's reset-schema view current after a
/// step: next observation and done, nothing else.
pub(crate) fn state_view(keys: &EnvKeys) -> StepMdpOptions {
    StepMdpOptions::with_keys(keys.clone())
        .keep_other(false)
        .exclude_reward(true)
        .exclude_done(false)
        .exclude_action(true)
}

// ── SlotData ─────────────────────────────────────────────────────

/// The latest outputs of one instance.
#[derive(Clone, Debug, Default)]
pub(crate) struct SlotData {
    /// Observation and done as of the last reset or step.
    pub state: Option<Record>,
    /// The `next` record of the last step.
    pub next: Option<Record>,
}

impl SlotData {
    /// Merge a reset output into the state, keeping entries the reset
    /// does not report (step-only done flags).
    pub fn record_reset(&mut self, out: Record) -> Result<(), EnvError> {
        match &mut self.state {
            Some(state) => state.update(&out)?,
            None => self.state = Some(out),
        }
        Ok(())
    }

    /// Store a step output (the instance's input with `next` attached).
    pub fn record_step(&mut self, out: &Record, view: &StepMdpOptions) -> Result<(), EnvError> {
        let next = out.record("next").ok_or(EnvError::MissingNext)?;
        match &mut self.next {
            Some(dst) => dst.assign(next)?,
            None => self.next = Some(next.clone()),
        }
        match &mut self.state {
            Some(state) => {
                step_mdp_into(out, view, state)?;
            }
            None => self.state = Some(step_mdp(out, view)?),
        }
        Ok(())
    }

    pub fn relocate(&mut self, device: Device) {
        self.state = self.state.as_ref().map(|r| r.to(device));
        self.next = self.next.as_ref().map(|r| r.to(device));
    }

    pub fn state(&self) -> Result<&Record, EnvError> {
        self.state.as_ref().ok_or(EnvError::NotStarted)
    }

    pub fn next(&self) -> Result<&Record, EnvError> {
        self.next.as_ref().ok_or(EnvError::NotStarted)
    }
}

/// Lock a slot. Slots hold plain data, so a poisoned lock is still
/// readable.
pub(crate) fn lock(slot: &Mutex<SlotData>) -> MutexGuard<'_, SlotData> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_core::Tensor;
    use herd_test_utils::{CountingEnv, TaskEnv};

    fn counting() -> EnvFactory {
        EnvFactory::new(|| CountingEnv::new(3, &[2]))
    }

    #[test]
    fn single_factory_is_replicated() {
        let factories = resolve_factories(vec![counting()], 3).unwrap();
        assert_eq!(factories.len(), 3);
        assert!(factories[2].same_task(&factories[0]));
        match resolve_factories(vec![counting(), counting()], 3) {
            Err(ConfigError::FactoryCountMismatch { expected: 3, got: 2 }) => {}
            other => panic!("expected FactoryCountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn kwargs_counts() {
        assert_eq!(resolve_kwargs(vec![], 2).unwrap().len(), 2);
        assert_eq!(resolve_kwargs(vec![EnvKwargs::new()], 4).unwrap().len(), 4);
        assert!(resolve_kwargs(vec![EnvKwargs::new(); 2], 3).is_err());
    }

    #[test]
    fn probe_expands_specs_by_worker_count() {
        let config = BatchedEnvConfig::new(3);
        let factories = resolve_factories(vec![counting()], 3).unwrap();
        let kwargs = resolve_kwargs(vec![], 3).unwrap();
        let layout = BatchLayout::probe(&factories, &kwargs, &config).unwrap();
        assert_eq!(layout.batch_size, vec![3, 2]);
        assert!(layout.single_task);
        assert!(!layout.padded);
        assert_eq!(layout.specs.action_spec().unwrap().shape(), &[3, 2, 1]);
    }

    #[test]
    fn probe_merges_observations_of_distinct_tasks() {
        let config = BatchedEnvConfig::new(2);
        let factories = vec![
            EnvFactory::new(|| TaskEnv::new("pos", 4)),
            EnvFactory::new(|| TaskEnv::new("vel", 4)),
        ];
        let kwargs = resolve_kwargs(vec![], 2).unwrap();
        let layout = BatchLayout::probe(&factories, &kwargs, &config).unwrap();
        assert!(!layout.single_task);
        assert!(layout.padded);
        assert!(layout.specs.observation.get("pos").is_some());
        assert!(layout.specs.observation.get("vel").is_some());
    }

    #[test]
    fn probe_rejects_mismatched_instance_batches() {
        let config = BatchedEnvConfig::new(2);
        let factories = vec![
            EnvFactory::new(|| CountingEnv::new(3, &[2])),
            EnvFactory::new(|| CountingEnv::new(3, &[4])),
        ];
        let kwargs = resolve_kwargs(vec![], 2).unwrap();
        match BatchLayout::probe(&factories, &kwargs, &config) {
            Err(EnvError::SchemaMismatch { .. }) => {}
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn mask_slices_select_instances() {
        let key = EnvKeys::default().reset_key();
        let input = Record::new(&[3])
            .with(
                &key,
                Tensor::from_bool(&[3, 1], vec![true, false, true]).unwrap(),
            )
            .unwrap();
        assert_eq!(
            reset_targets(Some(&input), &key, 3).unwrap(),
            vec![true, false, true]
        );
        assert_eq!(reset_targets(None, &key, 2).unwrap(), vec![true, true]);
    }

    #[test]
    fn step_updates_state_view_in_place() {
        let keys = EnvKeys::default();
        let mut slot = SlotData::default();
        let reset = Record::new(&[])
            .with("observation", Tensor::full_f32(&[1], 0.0))
            .unwrap()
            .with("done", Tensor::full_bool(&[1], false))
            .unwrap();
        slot.record_reset(reset).unwrap();

        let next = Record::new(&[])
            .with("observation", Tensor::full_f32(&[1], 1.0))
            .unwrap()
            .with("reward", Tensor::full_f32(&[1], 5.0))
            .unwrap()
            .with("done", Tensor::full_bool(&[1], true))
            .unwrap();
        let out = Record::new(&[])
            .with("action", Tensor::full_f32(&[1], 1.0))
            .unwrap()
            .with_record("next", next.clone())
            .unwrap();
        slot.record_step(&out, &state_view(&keys)).unwrap();

        let state = slot.state().unwrap();
        assert_eq!(state.tensor("observation"), Some(&Tensor::full_f32(&[1], 1.0)));
        assert_eq!(state.tensor("done"), Some(&Tensor::full_bool(&[1], true)));
        assert!(!state.contains("reward"));
        assert!(!state.contains("action"));
        assert_eq!(slot.next().unwrap(), &next);
    }

    #[test]
    fn reset_merges_into_state_keeping_step_only_entries() {
        let mut slot = SlotData::default();
        let stepped = Record::new(&[])
            .with("observation", Tensor::full_f32(&[1], 3.0))
            .unwrap()
            .with("done", Tensor::full_bool(&[1], true))
            .unwrap()
            .with("truncated", Tensor::full_bool(&[1], true))
            .unwrap();
        slot.record_reset(stepped).unwrap();

        let reset = Record::new(&[])
            .with("observation", Tensor::full_f32(&[1], 0.0))
            .unwrap()
            .with("done", Tensor::full_bool(&[1], false))
            .unwrap();
        slot.record_reset(reset).unwrap();

        let state = slot.state().unwrap();
        assert_eq!(state.tensor("observation"), Some(&Tensor::full_f32(&[1], 0.0)));
        assert_eq!(state.tensor("done"), Some(&Tensor::full_bool(&[1], false)));
        assert_eq!(state.tensor("truncated"), Some(&Tensor::full_bool(&[1], true)));
    }
}
