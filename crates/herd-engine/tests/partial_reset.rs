//! Integration test: `_reset` masks through batched drivers.
//!
//! Three counting instances with `max_steps = 3` report done with an
//! observation of 4 after the fourth step. A reset masked to instances
//! 0 and 2 restarts those two and leaves instance 1 exactly as it was.
//! Instances with their own batch dims reset element by element, and
//! done flags reported only by `step` keep the schema stable.

use herd_core::{Record, Tensor};
use herd_engine::{BatchedEnv, BatchedEnvConfig, EnvFactory, ParallelEnv, SerialEnv};
use herd_env::{step_mdp, Env, RolloutOptions, StepMdpOptions};
use herd_test_utils::{
    ones_like, CountingEnv, CountingPolicy, NestedCountingEnv, Nesting, TruncatingEnv,
};
use proptest::prelude::*;

fn counting() -> EnvFactory {
    EnvFactory::new(|| CountingEnv::new(3, &[]))
}

fn drivers(factory: EnvFactory, n: usize) -> Vec<Box<dyn BatchedEnv>> {
    vec![
        Box::new(SerialEnv::new(factory.clone(), BatchedEnvConfig::new(n)).unwrap()),
        Box::new(ParallelEnv::new(factory, BatchedEnvConfig::new(n)).unwrap()),
    ]
}

fn step_until_done(env: &mut dyn BatchedEnv) -> Record {
    let action = ones_like(env.specs().action_spec().unwrap());
    let view = StepMdpOptions::with_keys(env.keys().clone());
    let mut td = env.reset(None).unwrap();
    for _ in 0..10 {
        td.set("action", action.clone()).unwrap();
        let out = env.step(&td).unwrap();
        td = step_mdp(&out, &view).unwrap();
        if td.tensor("done").is_some_and(Tensor::all) {
            return td;
        }
    }
    panic!("counting instances never reported done");
}

/// `td` with a `_reset` mask shaped like its done flag.
fn masked(td: &Record, mask: Vec<bool>) -> Record {
    let shape = td.tensor("done").unwrap().shape().to_vec();
    td.clone()
        .with("_reset", Tensor::from_bool(&shape, mask).unwrap())
        .unwrap()
}

#[test]
fn counting_example_keeps_unmasked_instance() {
    for mut env in drivers(counting(), 3) {
        let td = step_until_done(env.as_mut());
        assert_eq!(td.tensor("observation"), Some(&Tensor::full_f32(&[3, 1], 4.0)));
        assert_eq!(td.tensor("done"), Some(&Tensor::full_bool(&[3, 1], true)));

        let out = env.reset(Some(&masked(&td, vec![true, false, true]))).unwrap();
        assert_eq!(
            out.tensor("observation"),
            Some(&Tensor::from_f32(&[3, 1], vec![0.0, 4.0, 0.0]).unwrap())
        );
        assert_eq!(
            out.tensor("done"),
            Some(&Tensor::from_bool(&[3, 1], vec![false, true, false]).unwrap())
        );
        env.close().unwrap();
    }
}

#[test]
fn instance_batches_reset_element_by_element() {
    let factory = EnvFactory::new(|| CountingEnv::new(3, &[2]));
    for mut env in drivers(factory, 2) {
        let td = step_until_done(env.as_mut());
        assert_eq!(td.tensor("observation"), Some(&Tensor::full_f32(&[2, 2, 1], 4.0)));

        // instance 0 is reset in its first row, instance 1 in its second
        let mask = vec![true, false, false, true];
        let out = env.reset(Some(&masked(&td, mask))).unwrap();
        assert_eq!(
            out.tensor("observation"),
            Some(&Tensor::from_f32(&[2, 2, 1], vec![0.0, 4.0, 4.0, 0.0]).unwrap())
        );
        assert_eq!(
            out.tensor("done"),
            Some(&Tensor::from_bool(&[2, 2, 1], vec![false, true, true, false]).unwrap())
        );
        env.close().unwrap();
    }
}

#[test]
fn step_only_done_flags_survive_partial_reset() {
    let factory = EnvFactory::new(|| TruncatingEnv::new(10, 1, &[]));
    for mut env in drivers(factory, 2) {
        let td = env.reset(None).unwrap();
        assert_eq!(td.tensor("truncated"), Some(&Tensor::full_bool(&[2, 1], false)));

        let td = td.with("action", Tensor::full_i64(&[2, 1], 1)).unwrap();
        let out = env.step(&td).unwrap();
        assert_eq!(
            out.tensor(("next", "truncated")),
            Some(&Tensor::full_bool(&[2, 1], true))
        );

        let td = step_mdp(&out, &StepMdpOptions::with_keys(env.keys().clone())).unwrap();
        let out = env.reset(Some(&masked(&td, vec![true, false]))).unwrap();
        assert_eq!(
            out.tensor("observation"),
            Some(&Tensor::from_f32(&[2, 1], vec![0.0, 1.0]).unwrap())
        );
        assert_eq!(
            out.tensor("truncated"),
            Some(&Tensor::from_bool(&[2, 1], vec![false, true]).unwrap())
        );

        // reset and stepped slots still stack on the next step
        let td = out.with("action", Tensor::full_i64(&[2, 1], 1)).unwrap();
        let out = env.step(&td).unwrap();
        assert_eq!(
            out.tensor(("next", "observation")),
            Some(&Tensor::from_f32(&[2, 1], vec![1.0, 2.0]).unwrap())
        );
        env.close().unwrap();
    }
}

#[test]
fn step_only_done_flags_roll_out() {
    let options = || RolloutOptions::new(3).break_when_any_done(false);

    let mut single = TruncatingEnv::new(10, 2, &[]);
    let mut policy = CountingPolicy::new(single.specs()).unwrap();
    let traj = single.rollout(options(), Some(&mut policy)).unwrap();
    assert_eq!(traj.batch_size(), &[3]);
    assert_eq!(
        traj.tensor("truncated"),
        Some(&Tensor::from_bool(&[3, 1], vec![false, false, true]).unwrap())
    );
    assert_eq!(
        traj.tensor(("next", "truncated")),
        Some(&Tensor::from_bool(&[3, 1], vec![false, true, true]).unwrap())
    );

    let factory = EnvFactory::new(|| TruncatingEnv::new(10, 2, &[]));
    for mut env in drivers(factory, 2) {
        let mut policy = CountingPolicy::new(env.specs()).unwrap();
        let traj = env.rollout(options(), Some(&mut policy)).unwrap();
        assert_eq!(traj.batch_size(), &[2, 3]);
        let per_instance = [false, false, true];
        let truncated = per_instance.iter().chain(&per_instance).copied().collect();
        assert_eq!(
            traj.tensor("truncated"),
            Some(&Tensor::from_bool(&[2, 3, 1], truncated).unwrap())
        );
        env.close().unwrap();
    }
}

#[test]
fn full_reset_restarts_every_instance() {
    for mut env in drivers(counting(), 2) {
        step_until_done(env.as_mut());
        let out = env.reset(None).unwrap();
        assert_eq!(out.tensor("observation"), Some(&Tensor::full_f32(&[2, 1], 0.0)));
        assert!(!out.tensor("done").is_some_and(Tensor::any));
    }
}

#[test]
fn wrong_batch_fails_before_dispatch() {
    for mut env in drivers(counting(), 2) {
        let td = Record::new(&[5]);
        match env.reset(Some(&td)) {
            Err(herd_core::EnvError::BatchSizeMismatch { .. }) => {}
            other => panic!("expected BatchSizeMismatch, got {other:?}"),
        }
        assert_eq!(env.state(), herd_engine::DriverState::Constructed);
    }
}

#[test]
fn nested_rollout_stacks_time_after_outer_batch() {
    let factory = EnvFactory::new(|| NestedCountingEnv::new(3, &[], 2, Nesting::ALL));
    let mut outputs = Vec::new();
    for mut env in drivers(factory, 2) {
        let mut policy = CountingPolicy::new(env.specs()).unwrap();
        let out = env
            .rollout(RolloutOptions::new(10), Some(&mut policy))
            .unwrap();
        assert_eq!(out.batch_size(), &[2, 4]);
        assert_eq!(out.record("data").unwrap().batch_size(), &[2, 4, 2]);
        outputs.push(out);
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn data_record_exists_only_for_nested_entries() {
    for bits in 0..8u8 {
        let nesting = Nesting {
            obs_action: bits & 1 != 0,
            done: bits & 2 != 0,
            reward: bits & 4 != 0,
        };
        let factory = EnvFactory::new(move || NestedCountingEnv::new(3, &[], 2, nesting));
        let mut outputs = Vec::new();
        for mut env in drivers(factory, 2) {
            let mut policy = CountingPolicy::new(env.specs()).unwrap();
            let out = env
                .rollout(RolloutOptions::new(10), Some(&mut policy))
                .unwrap();
            assert_eq!(out.batch_size(), &[2, 4], "{nesting:?}");
            // reward is dropped from the carried state, so it alone
            // never creates a root `data`
            let root_nested = nesting.obs_action || nesting.done;
            assert_eq!(out.contains("data"), root_nested, "{nesting:?}");
            assert_eq!(out.contains(("next", "data")), bits != 0, "{nesting:?}");
            if root_nested {
                assert_eq!(out.record("data").unwrap().batch_size(), &[2, 4, 2]);
            }
            env.close().unwrap();
            outputs.push(out);
        }
        assert_eq!(outputs[0], outputs[1], "{nesting:?}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn masked_reset_touches_only_masked_elements(
        instance_batch in any::<bool>(),
        mask in prop::collection::vec(any::<bool>(), 4),
    ) {
        // four scalar instances, or two instances of batch [2]
        let (factory, instances) = if instance_batch {
            (EnvFactory::new(|| CountingEnv::new(3, &[2])), 2)
        } else {
            (counting(), 4)
        };
        for mut env in drivers(factory, instances) {
            let td = step_until_done(env.as_mut());
            let shape = td.tensor("done").unwrap().shape().to_vec();
            let out = env.reset(Some(&masked(&td, mask.clone()))).unwrap();
            let expected: Vec<f32> = mask.iter().map(|&m| if m { 0.0 } else { 4.0 }).collect();
            prop_assert_eq!(
                out.tensor("observation"),
                Some(&Tensor::from_f32(&shape, expected).unwrap())
            );
            let done: Vec<bool> = mask.iter().map(|&m| !m).collect();
            prop_assert_eq!(out.tensor("done"), Some(&Tensor::from_bool(&shape, done).unwrap()));
            env.close().unwrap();
        }
    }
}
