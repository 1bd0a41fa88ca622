//! Environment factories.
//!
//! Instances are never moved between threads: a worker receives an
//! [`EnvFactory`] and builds its instance in place, so only the factory
//! has to be `Send + Sync`.

use std::fmt;
use std::sync::Arc;

use herd_core::{EnvError, Kwargs};
use herd_env::Env;

/// Keyword arguments passed to a factory when it builds an instance.
pub type EnvKwargs = Kwargs;

type BuildFn = dyn Fn(&EnvKwargs) -> Result<Box<dyn Env>, EnvError> + Send + Sync;

/// A shareable constructor of environment instances.
///
/// Two factories describe the same task when they are clones of one
/// another; batches built from a single factory are single-task.
#[derive(Clone)]
pub struct EnvFactory(Arc<BuildFn>);

impl EnvFactory {
    /// A factory that ignores its keyword arguments.
    pub fn new<E, F>(build: F) -> Self
    where
        E: Env + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        Self(Arc::new(
            move |_: &EnvKwargs| -> Result<Box<dyn Env>, EnvError> { Ok(Box::new(build())) },
        ))
    }

    /// A fallible factory configured by keyword arguments.
    pub fn with_kwargs<E, F>(build: F) -> Self
    where
        E: Env + 'static,
        F: Fn(&EnvKwargs) -> Result<E, EnvError> + Send + Sync + 'static,
    {
        Self(Arc::new(
            move |kwargs: &EnvKwargs| -> Result<Box<dyn Env>, EnvError> {
                Ok(Box::new(build(kwargs)?))
            },
        ))
    }

    /// Build one instance.
    pub fn build(&self, kwargs: &EnvKwargs) -> Result<Box<dyn Env>, EnvError> {
        (self.0)(kwargs)
    }

    /// Whether both factories are handles to the same constructor.
    pub fn same_task(&self, other: &EnvFactory) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for EnvFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EnvFactory")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_core::Value;
    use herd_test_utils::{CountingEnv, RandomWalkEnv};

    #[test]
    fn clones_share_a_task() {
        let a = EnvFactory::new(|| CountingEnv::new(3, &[]));
        let b = a.clone();
        let c = EnvFactory::new(|| CountingEnv::new(3, &[]));
        assert!(a.same_task(&b));
        assert!(!a.same_task(&c));
    }

    #[test]
    fn kwargs_reach_the_constructor() {
        let factory = EnvFactory::with_kwargs(RandomWalkEnv::from_kwargs);
        let mut kwargs = EnvKwargs::new();
        kwargs.insert("dim".to_string(), Value::Int(5));
        let env = factory.build(&kwargs).unwrap();
        assert_eq!(env.get_attr("dim").unwrap(), Value::Int(5));
    }
}
