//! Worker threads for [`ParallelEnv`](crate::parallel::ParallelEnv).
//!
//! Each worker owns one instance, built in place from its factory.
//! Commands arrive over a bounded crossbeam channel; results are written
//! into the worker's shared slot and acknowledged with a lightweight
//! [`Completion`] token on a second channel.
//!
//! Worker states: `Uninitialized` (building and handshaking) ->
//! `Running` (serving commands) -> `Closed` (loop exited). The loop
//! exits on [`WorkerCommand::Close`], when the command channel
//! disconnects, or after an instance panic.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use herd_core::{Device, EnvError, Record, Value};
use herd_env::{Env, StepMdpOptions};
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::factory::{EnvFactory, EnvKwargs};
use crate::shared::{lock, start_instance, SlotData};

/// A request sent to one worker.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Reset the instance; the output lands in the slot's `state`.
    Reset { input: Option<Record> },
    /// Step the instance; `next` and the updated `state` land in the slot.
    Step { input: Record },
    /// Seed the instance.
    Seed { seed: u64, static_seed: bool },
    /// Relocate the instance and its slot.
    ToDevice { device: Device },
    /// Snapshot the instance.
    StateDict,
    /// Restore a snapshot.
    LoadStateDict { state: Record },
    /// Invoke a custom method.
    Call { name: String, args: Vec<Value> },
    /// Read a custom attribute.
    GetAttr { name: String },
    /// Close the instance and exit.
    Close,
}

/// A worker's reply to one command.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Built and handshake reset done.
    Ready,
    /// The command completed; any output is in the slot.
    Done,
    /// The successor seed.
    Seeded(u64),
    /// Result of a call or attribute read.
    Value(Value),
    /// A state snapshot.
    StateDict(Record),
    /// The command failed.
    Failed(EnvError),
    /// The instance is closed and the worker exited.
    Closed,
}

/// Everything a worker thread needs.
pub(crate) struct WorkerSetup {
    pub index: usize,
    pub factory: EnvFactory,
    pub kwargs: EnvKwargs,
    pub device: Option<Device>,
    pub view: StepMdpOptions,
    pub slots: Arc<[Mutex<SlotData>]>,
}

/// The parent's handle on one worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub index: usize,
    cmd_tx: Option<Sender<WorkerCommand>>,
    done_rx: Receiver<Completion>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker thread. It builds its instance, performs the
    /// handshake reset and replies [`Completion::Ready`].
    pub fn spawn(setup: WorkerSetup, capacity: usize) -> Result<Self, ConfigError> {
        let index = setup.index;
        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(capacity);
        let (done_tx, done_rx) = crossbeam_channel::bounded(capacity);
        let thread = thread::Builder::new()
            .name(format!("herd-worker-{index}"))
            .spawn(move || worker_loop(setup, cmd_rx, done_tx))
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("herd-worker-{index}: {e}"),
            })?;
        Ok(Self {
            index,
            cmd_tx: Some(cmd_tx),
            done_rx,
            thread: Some(thread),
        })
    }

    /// Queue a command. Fails with [`EnvError::WorkerDisconnected`] when
    /// the worker has exited.
    pub fn send(&self, cmd: WorkerCommand) -> Result<(), EnvError> {
        let disconnected = || EnvError::WorkerDisconnected {
            worker_index: self.index,
        };
        self.cmd_tx
            .as_ref()
            .ok_or_else(disconnected)?
            .send(cmd)
            .map_err(|_| disconnected())
    }

    pub fn receiver(&self) -> &Receiver<Completion> {
        &self.done_rx
    }

    /// Drop the command sender so an idle worker exits.
    pub fn disconnect(&mut self) {
        self.cmd_tx.take();
    }

    /// Wait for the thread to exit. Returns `false` if it panicked.
    pub fn join(&mut self) -> bool {
        self.thread.take().is_none_or(|t| t.join().is_ok())
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

fn build(setup: &WorkerSetup) -> Result<Box<dyn Env>, EnvError> {
    let (env, first) = start_instance(&setup.factory, &setup.kwargs, setup.device)?;
    lock(&setup.slots[setup.index]).record_reset(first)?;
    Ok(env)
}

fn worker_loop(setup: WorkerSetup, cmd_rx: Receiver<WorkerCommand>, done_tx: Sender<Completion>) {
    let index = setup.index;
    let mut env = match panic::catch_unwind(AssertUnwindSafe(|| build(&setup))) {
        Ok(Ok(env)) => env,
        Ok(Err(e)) => {
            warn!(worker = index, error = %e, "worker failed to start");
            let _ = done_tx.send(Completion::Failed(e));
            return;
        }
        Err(payload) => {
            let reason = panic_reason(&*payload);
            warn!(worker = index, %reason, "worker panicked while starting");
            let _ = done_tx.send(Completion::Failed(EnvError::WorkerPanicked { reason }));
            return;
        }
    };
    debug!(worker = index, "worker ready");
    if done_tx.send(Completion::Ready).is_err() {
        return;
    }

    while let Ok(cmd) = cmd_rx.recv() {
        if let WorkerCommand::Close = cmd {
            let reply = match env.close() {
                Ok(()) => Completion::Closed,
                Err(e) => Completion::Failed(e),
            };
            let _ = done_tx.send(reply);
            debug!(worker = index, "worker closed");
            return;
        }

        let reply = match panic::catch_unwind(AssertUnwindSafe(|| {
            execute(env.as_mut(), cmd, &setup)
        })) {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => Completion::Failed(e),
            Err(payload) => {
                let reason = panic_reason(&*payload);
                warn!(worker = index, %reason, "environment panicked; worker exiting");
                let _ = done_tx.send(Completion::Failed(EnvError::WorkerPanicked { reason }));
                return;
            }
        };
        if done_tx.send(reply).is_err() {
            break;
        }
    }
    let _ = env.close();
    debug!(worker = index, "worker exited after disconnect");
}

fn execute(
    env: &mut dyn Env,
    cmd: WorkerCommand,
    setup: &WorkerSetup,
) -> Result<Completion, EnvError> {
    let slot = &setup.slots[setup.index];
    match cmd {
        WorkerCommand::Reset { input } => {
            let out = env.reset(input.as_ref())?;
            lock(slot).record_reset(out)?;
            Ok(Completion::Done)
        }
        WorkerCommand::Step { input } => {
            let out = env.step(&input)?;
            lock(slot).record_step(&out, &setup.view)?;
            Ok(Completion::Done)
        }
        WorkerCommand::Seed { seed, static_seed } => {
            Ok(Completion::Seeded(env.set_seed(seed, static_seed)?))
        }
        WorkerCommand::ToDevice { device } => {
            env.to_device(device)?;
            lock(slot).relocate(device);
            Ok(Completion::Done)
        }
        WorkerCommand::StateDict => Ok(Completion::StateDict(env.state_dict()?)),
        WorkerCommand::LoadStateDict { state } => {
            env.load_state_dict(&state)?;
            Ok(Completion::Done)
        }
        WorkerCommand::Call { name, args } => Ok(Completion::Value(env.call(&name, &args)?)),
        WorkerCommand::GetAttr { name } => Ok(Completion::Value(env.get_attr(&name)?)),
        WorkerCommand::Close => Ok(Completion::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_env::EnvKeys;
    use herd_test_utils::{CountingEnv, FailingEnv, FailureMode};

    use crate::shared::state_view;

    fn setup(factory: EnvFactory) -> WorkerSetup {
        WorkerSetup {
            index: 0,
            factory,
            kwargs: EnvKwargs::new(),
            device: None,
            view: state_view(&EnvKeys::default()),
            slots: vec![Mutex::new(SlotData::default())].into(),
        }
    }

    #[test]
    fn handshake_populates_slot_then_closes() {
        let s = setup(EnvFactory::new(|| CountingEnv::new(3, &[])));
        let slots = Arc::clone(&s.slots);
        let mut worker = WorkerHandle::spawn(s, 2).unwrap();
        assert!(matches!(worker.receiver().recv(), Ok(Completion::Ready)));
        assert!(lock(&slots[0]).state.is_some());

        worker.send(WorkerCommand::Close).unwrap();
        assert!(matches!(worker.receiver().recv(), Ok(Completion::Closed)));
        assert!(worker.join());
    }

    #[test]
    fn panics_are_reported_not_propagated() {
        let s = setup(EnvFactory::new(|| FailingEnv::new(1, FailureMode::Panic)));
        let mut worker = WorkerHandle::spawn(s, 2).unwrap();
        assert!(matches!(worker.receiver().recv(), Ok(Completion::Ready)));

        let input = Record::new(&[])
            .with("action", herd_core::Tensor::full_i64(&[1], 1))
            .unwrap();
        worker.send(WorkerCommand::Step { input }).unwrap();
        match worker.receiver().recv() {
            Ok(Completion::Failed(EnvError::WorkerPanicked { reason })) => {
                assert!(reason.contains("injected panic"));
            }
            other => panic!("expected WorkerPanicked, got {other:?}"),
        }
        assert!(worker.join());
    }

    #[test]
    fn disconnect_ends_the_loop() {
        let s = setup(EnvFactory::new(|| CountingEnv::new(3, &[])));
        let mut worker = WorkerHandle::spawn(s, 2).unwrap();
        assert!(matches!(worker.receiver().recv(), Ok(Completion::Ready)));
        worker.disconnect();
        assert!(worker.join());
        match worker.send(WorkerCommand::StateDict) {
            Err(EnvError::WorkerDisconnected { worker_index: 0 }) => {}
            other => panic!("expected WorkerDisconnected, got {other:?}"),
        }
    }
}
