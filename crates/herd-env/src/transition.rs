//! The transition step: turn a record with a `next` sub-record into the
//! next step's input record.

use herd_core::{EnvError, KeyPath, Record, RecordError};

use crate::env::EnvKeys;

/// Which fields [`step_mdp`] carries into the next input record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepMdpOptions {
    /// Keep root entries that are neither under `next` nor special keys.
    pub keep_other: bool,
    /// Drop the reward from the output.
    pub exclude_reward: bool,
    /// Drop the done flag from the output.
    pub exclude_done: bool,
    /// Drop the action from the output.
    pub exclude_action: bool,
    /// Key-paths of action, reward and done.
    pub keys: EnvKeys,
}

impl Default for StepMdpOptions {
    fn default() -> Self {
        Self {
            keep_other: true,
            exclude_reward: true,
            exclude_done: false,
            exclude_action: true,
            keys: EnvKeys::default(),
        }
    }
}

impl StepMdpOptions {
    /// Options with the given special keys and default flags.
    pub fn with_keys(keys: EnvKeys) -> Self {
        Self {
            keys,
            ..Self::default()
        }
    }

    /// Set [`keep_other`](Self::keep_other).
    pub fn keep_other(mut self, keep: bool) -> Self {
        self.keep_other = keep;
        self
    }

    /// Set [`exclude_reward`](Self::exclude_reward).
    pub fn exclude_reward(mut self, exclude: bool) -> Self {
        self.exclude_reward = exclude;
        self
    }

    /// Set [`exclude_done`](Self::exclude_done).
    pub fn exclude_done(mut self, exclude: bool) -> Self {
        self.exclude_done = exclude;
        self
    }

    /// Set [`exclude_action`](Self::exclude_action).
    pub fn exclude_action(mut self, exclude: bool) -> Self {
        self.exclude_action = exclude;
        self
    }
}

fn under(path: &[String], key: &KeyPath) -> bool {
    !key.is_empty() && path.starts_with(key)
}

/// Build the next step's input from `input` and its `next` sub-record.
///
/// Every leaf of `next` is carried over at the same key-path except the
/// action (never taken from `next`) and, when excluded, reward and done.
/// With `keep_other`, the remaining leaves of `input` outside `next` are
/// kept too, `next` winning on collisions. The previous action is carried
/// forward when `exclude_action` is false. The output never aliases the
/// input: nested records are created fresh, each taking the batch size of
/// the sub-record it mirrors.
pub fn step_mdp(input: &Record, options: &StepMdpOptions) -> Result<Record, EnvError> {
    let mut out = Record::with_device(input.batch_size(), input.device());
    step_mdp_into(input, options, &mut out)?;
    Ok(out)
}

/// [`step_mdp`] into a pre-allocated destination.
///
/// Existing entries of `dest` are overwritten where the transition
/// produces them and otherwise left alone. `dest` must share `input`'s
/// batch size.
pub fn step_mdp_into<'a>(
    input: &Record,
    options: &StepMdpOptions,
    dest: &'a mut Record,
) -> Result<&'a mut Record, EnvError> {
    let next = input.record("next").ok_or(EnvError::MissingNext)?;
    if dest.batch_size() != input.batch_size() {
        return Err(RecordError::ShapeMismatch {
            key: String::new(),
            expected: input.batch_size().to_vec(),
            got: dest.batch_size().to_vec(),
        }
        .into());
    }
    let keys = &options.keys;
    let special = |path: &[String]| {
        under(path, &keys.action) || under(path, &keys.reward) || under(path, &keys.done)
    };

    if options.keep_other {
        for path in input.leaf_paths() {
            if path.first().map(String::as_str) == Some("next") || special(&path) {
                continue;
            }
            if next.get_path(&path).is_some() {
                continue;
            }
            dest.insert_from(input, &path)?;
        }
    }

    for path in next.leaf_paths() {
        if under(&path, &keys.action)
            || (options.exclude_reward && under(&path, &keys.reward))
            || (options.exclude_done && under(&path, &keys.done))
        {
            continue;
        }
        dest.insert_from(next, &path)?;
    }

    if !options.exclude_action {
        for path in input.leaf_paths() {
            if under(&path, &keys.action) {
                dest.insert_from(input, &path)?;
            }
        }
    }

    Ok(dest)
}
