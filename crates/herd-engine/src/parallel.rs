//! Thread-parallel batched driver.
//!
//! # Architecture
//!
//! ```text
//! Caller thread                      Worker i (herd-worker-i)
//!     |                                   |
//!     |--WorkerCommand------------------->| cmd_rx.recv()
//!     |   [cmd_tx: bounded(capacity)]     | env.step(input)
//!     |                                   | slots[i].lock() <- outputs
//!     |<--Completion----------------------| done_tx.send(Done)
//!     |   [done_rx: bounded(capacity)]    |
//!     | barrier: one reply per worker     |
//!     | slots[..].lock() -> stack         |
//! ```
//!
//! Each slot is written only by its worker and read by the caller only
//! after the barrier, so its mutex is never contended.

use std::sync::{Arc, Mutex};

use crossbeam_channel::RecvTimeoutError;
use herd_core::{Device, EnvError, Record, Value};
use herd_env::{Env, EnvSpecs};
use tracing::{debug, warn};

use crate::batched::BatchedEnv;
use crate::config::{BatchedEnvConfig, ConfigError};
use crate::factory::{EnvFactory, EnvKwargs};
use crate::shared::{
    instance_input, lock, reset_targets, resolve_factories, resolve_kwargs, state_view,
    worker_failed, BatchLayout, DriverState, SlotData,
};
use crate::worker::{Completion, WorkerCommand, WorkerHandle, WorkerSetup};

fn empty_slots(n: usize) -> Arc<[Mutex<SlotData>]> {
    (0..n)
        .map(|_| Mutex::new(SlotData::default()))
        .collect::<Vec<_>>()
        .into()
}

fn unexpected(worker_index: usize, reply: Completion) -> EnvError {
    worker_failed(
        worker_index,
        EnvError::SchemaMismatch {
            reason: format!("unexpected worker reply {reply:?}"),
        },
    )
}

/// Batched driver running each instance on its own worker thread.
///
/// Every batched call is a barrier: it returns once every addressed
/// worker has replied. A failing instance yields
/// [`EnvError::WorkerFailed`] after the barrier and leaves the other
/// workers intact. A worker that stays silent past
/// [`BatchedEnvConfig::timeout`], or disconnects, closes the whole
/// driver.
pub struct ParallelEnv {
    factories: Vec<EnvFactory>,
    kwargs: Vec<EnvKwargs>,
    config: BatchedEnvConfig,
    layout: BatchLayout,
    state: DriverState,
    workers: Vec<WorkerHandle>,
    slots: Arc<[Mutex<SlotData>]>,
}

impl ParallelEnv {
    /// `config.num_workers` instances of one task.
    pub fn new(factory: EnvFactory, config: BatchedEnvConfig) -> Result<Self, EnvError> {
        Self::with_factories(vec![factory], Vec::new(), config)
    }

    /// One factory per instance (or one shared), with optional
    /// per-instance keyword arguments.
    ///
    /// Builds one probe instance per distinct factory on the calling
    /// thread to learn batch size, specs and device, then closes it.
    /// Workers are spawned by [`start`](BatchedEnv::start).
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
        Ok(Self {
            factories,
            kwargs,
            config,
            layout,
            state: DriverState::Constructed,
            workers: Vec::new(),
            slots: empty_slots(n),
        })
    }

    fn ensure_started(&mut self) -> Result<(), EnvError> {
        match self.state {
            DriverState::Constructed => self.start(),
            DriverState::Closed => Err(EnvError::Closed),
            DriverState::Started | DriverState::Running => Ok(()),
        }
    }

    /// Close after a fatal fault. Busy workers finish their current
    /// command, see the disconnected channel and exit; their threads are
    /// detached.
    fn abort(&mut self, err: EnvError) -> EnvError {
        warn!(error = %err, "parallel env aborted");
        self.state = DriverState::Closed;
        for worker in &mut self.workers {
            worker.disconnect();
        }
        self.workers.clear();
        err
    }

    /// Wait for one reply from each worker in `pending`.
    fn barrier(&mut self, pending: &[usize]) -> Result<Vec<(usize, Completion)>, EnvError> {
        let mut replies = Vec::with_capacity(pending.len());
        for &i in pending {
            let rx = self.workers[i].receiver();
            let reply = match self.config.timeout {
                Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout => EnvError::WorkerTimeout { worker_index: i },
                    RecvTimeoutError::Disconnected => {
                        EnvError::WorkerDisconnected { worker_index: i }
                    }
                }),
                None => rx
                    .recv()
                    .map_err(|_| EnvError::WorkerDisconnected { worker_index: i }),
            };
            match reply {
                Ok(reply) => replies.push((i, reply)),
                Err(e) => return Err(self.abort(e)),
            }
        }
        Ok(replies)
    }

    /// Send each command, wait for every reply, then surface the first
    /// instance failure.
    fn dispatch(
        &mut self,
        commands: Vec<(usize, WorkerCommand)>,
    ) -> Result<Vec<(usize, Completion)>, EnvError> {
        self.ensure_started()?;
        let mut pending = Vec::with_capacity(commands.len());
        for (i, cmd) in commands {
            if let Err(e) = self.workers[i].send(cmd) {
                return Err(self.abort(e));
            }
            pending.push(i);
        }
        let mut failure = None;
        let mut out = Vec::with_capacity(pending.len());
        for (i, reply) in self.barrier(&pending)? {
            match reply {
                Completion::Failed(e) => {
                    warn!(worker = i, error = %e, "worker command failed");
                    failure.get_or_insert(worker_failed(i, e));
                }
                reply => out.push((i, reply)),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    fn broadcast(
        &mut self,
        make: impl Fn(usize) -> WorkerCommand,
    ) -> Result<Vec<(usize, Completion)>, EnvError> {
        self.ensure_started()?;
        let commands = (0..self.workers.len()).map(|i| (i, make(i))).collect();
        self.dispatch(commands)
    }

    fn values(&mut self, make: impl Fn(usize) -> WorkerCommand) -> Result<Vec<Value>, EnvError> {
        self.broadcast(make)?
            .into_iter()
            .map(|(i, reply)| match reply {
                Completion::Value(v) => Ok(v),
                other => Err(unexpected(i, other)),
            })
            .collect()
    }

    fn gather(
        &self,
        pick: for<'a> fn(&'a SlotData) -> Result<&'a Record, EnvError>,
    ) -> Result<Record, EnvError> {
        let guards: Vec<_> = self.slots.iter().map(|slot| lock(slot)).collect();
        let rows = guards
            .iter()
            .map(|guard| pick(guard))
            .collect::<Result<Vec<_>, _>>()?;
        self.layout.gather(&rows)
    }
}

impl Env for ParallelEnv {
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
        let n = self.workers.len();
        let targets = reset_targets(input, &self.layout.keys().reset_key(), n)?;
        let mut commands = Vec::with_capacity(n);
        for (i, &target) in targets.iter().enumerate() {
            if target {
                let input = instance_input(input, i)?;
                commands.push((i, WorkerCommand::Reset { input }));
            }
        }
        self.dispatch(commands)?;
        self.state = DriverState::Running;
        self.gather(SlotData::state)
    }

    fn step_impl(&mut self, input: &Record) -> Result<Record, EnvError> {
        self.ensure_started()?;
        let commands = (0..self.workers.len())
            .map(|i| -> Result<_, EnvError> {
                Ok((i, WorkerCommand::Step { input: input.index(i)? }))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.dispatch(commands)?;
        self.state = DriverState::Running;
        self.gather(SlotData::next)
    }

    fn set_seed_impl(&mut self, seed: u64) -> Result<(), EnvError> {
        self.set_seed(seed, false).map(|_| ())
    }

    /// Seed instance 0 with `seed` and every following instance with the
    /// seed its predecessor returned, one worker at a time. Returns the
    /// last instance's returned seed.
    fn set_seed(&mut self, seed: u64, static_seed: bool) -> Result<u64, EnvError> {
        self.ensure_started()?;
        let mut seed = seed;
        for i in 0..self.workers.len() {
            let cmd = WorkerCommand::Seed { seed, static_seed };
            seed = match self.dispatch(vec![(i, cmd)])?.pop() {
                Some((_, Completion::Seeded(next))) => next,
                Some((_, other)) => return Err(unexpected(i, other)),
                None => return Err(EnvError::WorkerDisconnected { worker_index: i }),
            };
        }
        Ok(seed)
    }

    fn to_device(&mut self, device: Device) -> Result<(), EnvError> {
        match self.state {
            DriverState::Closed => return Err(EnvError::Closed),
            DriverState::Constructed => {}
            DriverState::Started | DriverState::Running => {
                self.broadcast(|_| WorkerCommand::ToDevice { device })?;
            }
        }
        self.config.device = Some(device);
        self.layout.relocate(device);
        debug!(%device, "parallel env relocated");
        Ok(())
    }

    fn close(&mut self) -> Result<(), EnvError> {
        if self.state == DriverState::Closed {
            return Ok(());
        }
        self.state = DriverState::Closed;
        for worker in &self.workers {
            let _ = worker.send(WorkerCommand::Close);
        }
        let timeout = self.config.timeout;
        let mut result = Ok(());
        for mut worker in self.workers.drain(..) {
            let reply = match timeout {
                Some(t) => worker.receiver().recv_timeout(t),
                None => worker.receiver().recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match reply {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(worker = worker.index, "worker did not close in time; detaching");
                    worker.disconnect();
                    continue;
                }
                Ok(Completion::Failed(e)) if result.is_ok() => {
                    result = Err(worker_failed(worker.index, e));
                }
                _ => {}
            }
            worker.disconnect();
            if !worker.join() {
                warn!(worker = worker.index, "worker thread panicked");
            }
        }
        debug!("parallel env closed");
        result
    }

    fn is_closed(&self) -> bool {
        self.state == DriverState::Closed
    }
}

impl BatchedEnv for ParallelEnv {
    fn start(&mut self) -> Result<(), EnvError> {
        match self.state {
            DriverState::Constructed => {}
            DriverState::Closed => return Err(EnvError::Closed),
            DriverState::Started | DriverState::Running => {
                return Err(ConfigError::AlreadyStarted.into())
            }
        }
        let n = self.factories.len();
        self.slots = empty_slots(n);
        let view = state_view(self.layout.keys());
        // Workers exist from here on; a failed start must close them.
        self.state = DriverState::Started;
        for (i, (factory, kwargs)) in self.factories.iter().zip(&self.kwargs).enumerate() {
            let setup = WorkerSetup {
                index: i,
                factory: factory.clone(),
                kwargs: kwargs.clone(),
                device: self.config.device,
                view: view.clone(),
                slots: Arc::clone(&self.slots),
            };
            match WorkerHandle::spawn(setup, self.config.channel_capacity) {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    let _ = self.close();
                    return Err(e.into());
                }
            }
        }

        let pending: Vec<usize> = (0..n).collect();
        let mut failure = None;
        for (i, reply) in self.barrier(&pending)? {
            match reply {
                Completion::Ready => {}
                Completion::Failed(e) => {
                    failure.get_or_insert(worker_failed(i, e));
                }
                other => {
                    failure.get_or_insert(unexpected(i, other));
                }
            }
        }
        if let Some(e) = failure {
            warn!(error = %e, "parallel env failed to start");
            let _ = self.close();
            return Err(e);
        }
        debug!(num_workers = n, "parallel env started");
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
        self.kwargs = kwargs;
        Ok(())
    }

    fn call_all(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, EnvError> {
        self.values(|_| WorkerCommand::Call {
            name: name.to_string(),
            args: args.to_vec(),
        })
    }

    fn get_attr_all(&mut self, name: &str) -> Result<Vec<Value>, EnvError> {
        self.values(|_| WorkerCommand::GetAttr {
            name: name.to_string(),
        })
    }

    fn state_dicts(&mut self) -> Result<Vec<Record>, EnvError> {
        self.broadcast(|_| WorkerCommand::StateDict)?
            .into_iter()
            .map(|(i, reply)| match reply {
                Completion::StateDict(state) => Ok(state),
                other => Err(unexpected(i, other)),
            })
            .collect()
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
        self.broadcast(|i| WorkerCommand::LoadStateDict {
            state: states[i].clone(),
        })?;
        Ok(())
    }
}

impl Drop for ParallelEnv {
    fn drop(&mut self) {
        if self.state != DriverState::Closed {
            let _ = self.close();
        }
    }
}
