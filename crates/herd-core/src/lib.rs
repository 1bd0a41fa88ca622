//! Core types for the herd batched-environment engine.
//!
//! This is the leaf crate with no internal dependencies. It defines the
//! data model shared by every environment and driver: dense tensors,
//! nested structured records, key-paths, shape/dtype specs, dynamic
//! values for proxied calls, and the error taxonomy.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod device;
pub mod error;
pub mod key;
pub mod record;
pub mod spec;
pub mod tensor;
pub mod value;

pub use device::Device;
pub use error::{EnvError, RecordError};
pub use key::KeyPath;
pub use record::{Entry, Padded, Record};
pub use spec::{CompositeSpec, Domain, Spec, TensorSpec};
pub use tensor::{numel, DType, Shape, Tensor, TensorData};
pub use value::{Kwargs, Value};
