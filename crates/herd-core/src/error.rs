//! Error types for the herd batched-environment engine.
//!
//! Organized by subsystem: [`RecordError`] for structural violations in
//! records and tensors, and [`EnvError`] for everything an environment
//! (single instance or batched driver) can report.

use std::error::Error;
use std::fmt;

use crate::device::Device;

/// Errors from record, tensor and spec operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordError {
    /// A buffer or nested record does not carry the batch-size prefix of
    /// the record containing it, or two shapes that must agree differ.
    ShapeMismatch {
        /// Key-path (dotted) at which the violation was detected.
        key: String,
        /// The shape that was required.
        expected: Vec<usize>,
        /// The shape that was supplied.
        got: Vec<usize>,
    },
    /// No entry exists at the requested key-path.
    KeyNotFound {
        /// The missing key-path (dotted).
        key: String,
    },
    /// The entry at the key-path is a nested record, not a tensor.
    NotATensor {
        /// The offending key-path (dotted).
        key: String,
    },
    /// The entry at the key-path is a tensor, not a nested record.
    NotARecord {
        /// The offending key-path (dotted).
        key: String,
    },
    /// Two tensors that must share an element type do not.
    DTypeMismatch {
        /// Key-path (dotted) of the offending entry, empty at the root.
        key: String,
    },
    /// Records being stacked or merged do not share the same key set or
    /// entry kinds.
    SchemaMismatch {
        /// Key-path (dotted) at which the schemas diverge.
        key: String,
    },
    /// A stack was requested over zero inputs.
    EmptyStack,
    /// An index or stacking dimension is out of range.
    InvalidIndex {
        /// The requested index or dimension.
        index: usize,
        /// The exclusive upper bound.
        bound: usize,
    },
    /// A buffer's element count does not match its declared shape.
    LengthMismatch {
        /// Number of elements the shape requires.
        expected: usize,
        /// Number of elements supplied.
        got: usize,
    },
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { key, expected, got } => {
                write!(
                    f,
                    "shape mismatch at '{key}': expected leading dims {expected:?}, got {got:?}"
                )
            }
            Self::KeyNotFound { key } => write!(f, "key '{key}' not found"),
            Self::NotATensor { key } => write!(f, "entry '{key}' is not a tensor"),
            Self::NotARecord { key } => write!(f, "entry '{key}' is not a record"),
            Self::DTypeMismatch { key } => write!(f, "dtype mismatch at '{key}'"),
            Self::SchemaMismatch { key } => write!(f, "schemas diverge at '{key}'"),
            Self::EmptyStack => write!(f, "cannot stack zero records"),
            Self::InvalidIndex { index, bound } => {
                write!(f, "index {index} out of range (bound {bound})")
            }
            Self::LengthMismatch { expected, got } => {
                write!(f, "buffer holds {got} elements, shape requires {expected}")
            }
        }
    }
}

impl Error for RecordError {}

/// Errors from environment instances and batched drivers.
#[derive(Clone, Debug, PartialEq)]
pub enum EnvError {
    /// A record operation failed.
    Record(RecordError),
    /// The input's batch size violates the environment's shape contract.
    BatchSizeMismatch {
        /// The environment's batch size.
        expected: Vec<usize>,
        /// The batch size of the supplied record.
        got: Vec<usize>,
    },
    /// The record handed to the transition step has no `next` sub-record.
    MissingNext,
    /// The record handed to `step` carries no action at the action key.
    MissingAction {
        /// The action key-path (dotted).
        key: String,
    },
    /// A full reset (no `_reset` mask) produced done elements.
    DoneAfterReset,
    /// An attempt was made to set a read-only property.
    ReadOnlyProperty {
        /// Name of the property.
        name: String,
    },
    /// A proxied method call named a method the instance does not expose.
    UnknownMethod {
        /// Name of the method.
        name: String,
    },
    /// A proxied attribute read named an attribute the instance does not
    /// expose.
    UnknownAttribute {
        /// Name of the attribute.
        name: String,
    },
    /// Instances produced outputs that cannot be merged into one record.
    SchemaMismatch {
        /// Description of the divergence.
        reason: String,
    },
    /// The operation requires a started driver.
    NotStarted,
    /// The environment has been closed.
    Closed,
    /// An instance reported an error.
    WorkerFailed {
        /// Position of the failing instance in the batch.
        worker_index: usize,
        /// The instance's error.
        source: Box<EnvError>,
    },
    /// A worker did not answer within the configured timeout. The driver
    /// is closed when this is reported.
    WorkerTimeout {
        /// Position of the silent worker in the batch.
        worker_index: usize,
    },
    /// A worker's channel closed unexpectedly. The driver is closed when
    /// this is reported.
    WorkerDisconnected {
        /// Position of the worker in the batch.
        worker_index: usize,
    },
    /// An instance panicked while handling a command.
    WorkerPanicked {
        /// Panic payload, when it was a string.
        reason: String,
    },
    /// The environment cannot be relocated to the requested device.
    UnsupportedDevice {
        /// The requested device.
        device: Device,
    },
    /// Driver or rollout configuration is invalid.
    InvalidConfig {
        /// Human-readable description.
        reason: String,
    },
    /// The wrapped simulator failed.
    Simulation {
        /// Human-readable description.
        reason: String,
    },
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(e) => write!(f, "record error: {e}"),
            Self::BatchSizeMismatch { expected, got } => write!(
                f,
                "Expected a record with batch size {expected:?} (env.batch_size), got {got:?}"
            ),
            Self::MissingNext => write!(f, "record has no 'next' entry"),
            Self::MissingAction { key } => write!(f, "record has no action at '{key}'"),
            Self::DoneAfterReset => {
                write!(f, "environment reported done right after a full reset")
            }
            Self::ReadOnlyProperty { name } => write!(f, "property '{name}' is read-only"),
            Self::UnknownMethod { name } => write!(f, "unknown method '{name}'"),
            Self::UnknownAttribute { name } => write!(f, "unknown attribute '{name}'"),
            Self::SchemaMismatch { reason } => write!(f, "schema mismatch: {reason}"),
            Self::NotStarted => write!(f, "environment has not been started"),
            Self::Closed => write!(f, "environment is closed"),
            Self::WorkerFailed {
                worker_index,
                source,
            } => write!(f, "worker {worker_index} failed: {source}"),
            Self::WorkerTimeout { worker_index } => {
                write!(f, "worker {worker_index} timed out")
            }
            Self::WorkerDisconnected { worker_index } => {
                write!(f, "worker {worker_index} disconnected")
            }
            Self::WorkerPanicked { reason } => write!(f, "instance panicked: {reason}"),
            Self::UnsupportedDevice { device } => {
                write!(f, "cannot relocate environment to device {device}")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid configuration: {reason}"),
            Self::Simulation { reason } => write!(f, "simulation failed: {reason}"),
        }
    }
}

impl Error for EnvError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Record(e) => Some(e),
            Self::WorkerFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<RecordError> for EnvError {
    fn from(e: RecordError) -> Self {
        Self::Record(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_failure_chains_source() {
        let err = EnvError::WorkerFailed {
            worker_index: 2,
            source: Box::new(EnvError::Simulation {
                reason: "boom".into(),
            }),
        };
        assert_eq!(err.to_string(), "worker 2 failed: simulation failed: boom");
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("simulation failed: boom"));
    }

    #[test]
    fn record_errors_convert() {
        let err: EnvError = RecordError::EmptyStack.into();
        assert!(matches!(err, EnvError::Record(RecordError::EmptyStack)));
        assert!(err.source().is_some());
    }
}
