//! Declarative shape/dtype/domain specs for records.
//!
//! A [`TensorSpec`] declares one leaf; a [`CompositeSpec`] declares a
//! record. Environments publish specs for their observations, actions,
//! rewards and done flags; drivers expand them by the batch prefix and
//! the rollout loop samples random actions from them.

use std::f32::consts::PI;

use indexmap::IndexMap;
use rand_chacha::rand_core::RngCore;

use crate::device::Device;
use crate::error::RecordError;
use crate::key::KeyPath;
use crate::record::{Entry, Record};
use crate::tensor::{numel, DType, Shape, Tensor, TensorData};

/// The set of values a leaf may take.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Domain {
    /// Any value of the dtype.
    Unbounded,
    /// Values in `[low, high]`.
    Bounded {
        /// Inclusive lower bound.
        low: f64,
        /// Inclusive upper bound.
        high: f64,
    },
    /// Zero or one.
    Binary,
    /// Integers in `[0, n)`.
    Discrete {
        /// Number of categories.
        n: u64,
    },
}

/// Spec of a single leaf tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorSpec {
    shape: Shape,
    dtype: DType,
    device: Device,
    domain: Domain,
}

fn uniform(rng: &mut (impl RngCore + ?Sized)) -> f32 {
    (rng.next_u32() >> 8) as f32 / (1u32 << 24) as f32
}

fn normal(rng: &mut (impl RngCore + ?Sized)) -> f32 {
    let u1 = 1.0 - uniform(rng);
    let u2 = uniform(rng);
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

impl TensorSpec {
    /// A leaf spec.
    pub fn new(shape: &[usize], dtype: DType, domain: Domain) -> Self {
        Self {
            shape: Shape::from_slice(shape),
            dtype,
            device: Device::Cpu,
            domain,
        }
    }

    /// Any value of `dtype`.
    pub fn unbounded(shape: &[usize], dtype: DType) -> Self {
        Self::new(shape, dtype, Domain::Unbounded)
    }

    /// Floats in `[low, high]`.
    pub fn bounded(shape: &[usize], low: f64, high: f64) -> Self {
        Self::new(shape, DType::F32, Domain::Bounded { low, high })
    }

    /// Zeros and ones of `dtype`.
    pub fn binary(shape: &[usize], dtype: DType) -> Self {
        Self::new(shape, dtype, Domain::Binary)
    }

    /// Integer categories in `[0, n)`.
    pub fn discrete(shape: &[usize], n: u64) -> Self {
        Self::new(shape, DType::I64, Domain::Discrete { n })
    }

    /// Declared shape, batch dims included.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Declared element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Declared device.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Declared domain.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// A zero (or `false`) tensor of this spec.
    pub fn zero(&self) -> Tensor {
        Tensor::zeros(&self.shape, self.dtype).to(self.device)
    }

    /// A random tensor drawn from this spec's domain.
    ///
    /// Unbounded floats are standard normal; unbounded integers are
    /// drawn from `[-2^31, 2^31)`.
    pub fn rand<R: RngCore + ?Sized>(&self, rng: &mut R) -> Tensor {
        let n = numel(&self.shape);
        let data = match self.dtype {
            DType::F32 => TensorData::F32(
                (0..n)
                    .map(|_| match self.domain {
                        Domain::Unbounded => normal(rng),
                        Domain::Bounded { low, high } => {
                            low as f32 + uniform(rng) * (high - low) as f32
                        }
                        Domain::Binary => (rng.next_u32() & 1) as f32,
                        Domain::Discrete { n } => (rng.next_u64() % n.max(1)) as f32,
                    })
                    .collect(),
            ),
            DType::I64 => TensorData::I64(
                (0..n)
                    .map(|_| match self.domain {
                        Domain::Unbounded => i64::from(rng.next_u32() as i32),
                        Domain::Bounded { low, high } => {
                            let (low, high) = (low.ceil() as i64, high.floor() as i64);
                            let draw = rng.next_u64();
                            if high <= low {
                                low
                            } else {
                                // width in two's complement; None covers all of i64
                                match (high.wrapping_sub(low) as u64).checked_add(1) {
                                    Some(span) => low.wrapping_add((draw % span) as i64),
                                    None => draw as i64,
                                }
                            }
                        }
                        Domain::Binary => i64::from(rng.next_u32() & 1),
                        Domain::Discrete { n } => (rng.next_u64() % n.max(1)) as i64,
                    })
                    .collect(),
            ),
            DType::Bool => TensorData::Bool((0..n).map(|_| rng.next_u32() & 1 == 1).collect()),
        };
        Tensor::new(&self.shape, data)
            .map(|t| t.to(self.device))
            .unwrap_or_else(|_| self.zero())
    }

    /// Whether `tensor` has this spec's shape and dtype and every element
    /// lies in the domain.
    pub fn is_in(&self, tensor: &Tensor) -> bool {
        if tensor.shape() != self.shape.as_slice() || tensor.dtype() != self.dtype {
            return false;
        }
        (0..tensor.numel()).all(|i| {
            let Some(x) = tensor.get_f64(i) else {
                return false;
            };
            match self.domain {
                Domain::Unbounded => true,
                Domain::Bounded { low, high } => (low..=high).contains(&x),
                Domain::Binary => x == 0.0 || x == 1.0,
                Domain::Discrete { n } => x >= 0.0 && x.fract() == 0.0 && (x as u64) < n,
            }
        })
    }

    /// This spec under the leading dimensions `prefix`.
    pub fn expand(&self, prefix: &[usize]) -> Self {
        let mut shape = Shape::from_slice(prefix);
        shape.extend_from_slice(&self.shape);
        Self {
            shape,
            ..self.clone()
        }
    }

    /// This spec declared on `device`.
    pub fn to(&self, device: Device) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }
}

/// A spec entry: a leaf or a nested composite.
#[derive(Clone, Debug, PartialEq)]
pub enum Spec {
    /// A leaf.
    Tensor(TensorSpec),
    /// A nested record.
    Composite(CompositeSpec),
}

impl From<TensorSpec> for Spec {
    fn from(spec: TensorSpec) -> Self {
        Self::Tensor(spec)
    }
}

impl From<CompositeSpec> for Spec {
    fn from(spec: CompositeSpec) -> Self {
        Self::Composite(spec)
    }
}

impl Spec {
    fn leading_shape(&self) -> &[usize] {
        match self {
            Self::Tensor(t) => &t.shape,
            Self::Composite(c) => &c.shape,
        }
    }

    fn expand(&self, prefix: &[usize]) -> Self {
        match self {
            Self::Tensor(t) => Self::Tensor(t.expand(prefix)),
            Self::Composite(c) => Self::Composite(c.expand(prefix)),
        }
    }

    fn to(&self, device: Device) -> Self {
        match self {
            Self::Tensor(t) => Self::Tensor(t.to(device)),
            Self::Composite(c) => Self::Composite(c.to(device)),
        }
    }
}

/// Spec of a record: named leaf and composite specs under a shared
/// batch shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeSpec {
    shape: Shape,
    device: Device,
    entries: IndexMap<String, Spec>,
}

impl CompositeSpec {
    /// An empty composite with batch shape `shape`.
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: Shape::from_slice(shape),
            device: Device::Cpu,
            entries: IndexMap::new(),
        }
    }

    /// Builder-style insert of a root entry. Unchecked; use
    /// [`insert`](Self::insert) for validated, nested inserts.
    pub fn with(mut self, name: &str, spec: impl Into<Spec>) -> Self {
        self.entries.insert(name.to_string(), spec.into());
        self
    }

    /// Insert `spec` at `key`, creating missing nested composites with
    /// their parent's shape.
    pub fn insert(&mut self, key: impl Into<KeyPath>, spec: impl Into<Spec>) -> Result<(), RecordError> {
        let key: KeyPath = key.into();
        let spec = spec.into();
        let Some((last, parents)) = key.split_last() else {
            return Err(RecordError::KeyNotFound { key: String::new() });
        };
        let mut node = self;
        for (depth, name) in parents.iter().enumerate() {
            let shape = node.shape.clone();
            let device = node.device;
            node = match node.entries.entry(name.clone()).or_insert_with(|| {
                Spec::Composite(CompositeSpec {
                    shape,
                    device,
                    entries: IndexMap::new(),
                })
            }) {
                Spec::Composite(c) => c,
                Spec::Tensor(_) => {
                    return Err(RecordError::NotARecord {
                        key: key[..=depth].join("."),
                    })
                }
            };
        }
        if !spec.leading_shape().starts_with(&node.shape) {
            return Err(RecordError::ShapeMismatch {
                key: key.to_string(),
                expected: node.shape.to_vec(),
                got: spec.leading_shape().to_vec(),
            });
        }
        node.entries.insert(last.clone(), spec);
        Ok(())
    }

    /// Batch shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Declared device.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of root entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Root entries, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Spec)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The entry at `key`.
    pub fn get(&self, key: impl Into<KeyPath>) -> Option<&Spec> {
        let key: KeyPath = key.into();
        let (last, parents) = key.split_last()?;
        let mut node = self;
        for name in parents {
            node = match node.entries.get(name)? {
                Spec::Composite(c) => c,
                Spec::Tensor(_) => return None,
            };
        }
        node.entries.get(last)
    }

    /// The leaf spec at `key`.
    pub fn get_leaf(&self, key: impl Into<KeyPath>) -> Option<&TensorSpec> {
        match self.get(key)? {
            Spec::Tensor(t) => Some(t),
            Spec::Composite(_) => None,
        }
    }

    /// Every leaf key-path, depth first.
    pub fn leaf_paths(&self) -> Vec<KeyPath> {
        let mut out = Vec::new();
        for (name, spec) in &self.entries {
            match spec {
                Spec::Tensor(_) => out.push(KeyPath::from(name)),
                Spec::Composite(c) => {
                    out.extend(c.leaf_paths().into_iter().map(|p| p.prefixed(name)));
                }
            }
        }
        out
    }

    fn build(&self, leaf: &mut dyn FnMut(&TensorSpec) -> Tensor) -> Result<Record, RecordError> {
        let mut out = Record::with_device(&self.shape, self.device);
        for (name, spec) in &self.entries {
            let path = [name.clone()];
            let entry = match spec {
                Spec::Tensor(t) => Entry::Tensor(leaf(t)),
                Spec::Composite(c) => Entry::Record(c.build(leaf)?),
            };
            out.insert_path(&path, entry)?;
        }
        Ok(out)
    }

    /// A record of zeros matching this spec.
    pub fn zero(&self) -> Result<Record, RecordError> {
        self.build(&mut |t: &TensorSpec| t.zero())
    }

    /// A random record drawn from this spec.
    pub fn rand<R: RngCore + ?Sized>(&self, rng: &mut R) -> Result<Record, RecordError> {
        self.build(&mut |t: &TensorSpec| t.rand(rng))
    }

    /// Whether every leaf of this spec is present in `record` and in its
    /// domain. Extra entries in `record` are ignored.
    pub fn is_in(&self, record: &Record) -> bool {
        self.leaf_paths().iter().all(|path| {
            match (self.get_leaf(path), record.tensor(path)) {
                (Some(spec), Some(tensor)) => spec.is_in(tensor),
                _ => false,
            }
        })
    }

    /// Add every root entry of `other` not already declared here.
    pub fn merge(&mut self, other: &CompositeSpec) {
        for (name, spec) in &other.entries {
            if !self.entries.contains_key(name) {
                self.entries.insert(name.clone(), spec.clone());
            }
        }
    }

    /// This composite, and everything in it, under the leading
    /// dimensions `prefix`.
    pub fn expand(&self, prefix: &[usize]) -> Self {
        let mut shape = Shape::from_slice(prefix);
        shape.extend_from_slice(&self.shape);
        Self {
            shape,
            device: self.device,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.expand(prefix)))
                .collect(),
        }
    }

    /// This composite declared on `device`.
    pub fn to(&self, device: Device) -> Self {
        Self {
            shape: self.shape.clone(),
            device,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to(device)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn nested_spec() -> CompositeSpec {
        let data = CompositeSpec::new(&[4, 3])
            .with("states", TensorSpec::unbounded(&[4, 3, 1], DType::F32));
        CompositeSpec::new(&[4])
            .with("observation", TensorSpec::bounded(&[4, 2], -1.0, 1.0))
            .with("data", data)
    }

    #[test]
    fn rand_samples_are_in_spec() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let specs = [
            TensorSpec::bounded(&[16], -2.0, 3.0),
            TensorSpec::binary(&[16], DType::I64),
            TensorSpec::binary(&[16], DType::Bool),
            TensorSpec::discrete(&[16], 5),
            TensorSpec::new(&[16], DType::I64, Domain::Bounded { low: 1.0, high: 3.0 }),
        ];
        for spec in &specs {
            for _ in 0..8 {
                assert!(spec.is_in(&spec.rand(&mut rng)), "{spec:?}");
            }
        }
    }

    #[test]
    fn integer_bounds_beyond_i64_saturate() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let full = TensorSpec::new(&[32], DType::I64, Domain::Bounded { low: -1e19, high: 1e19 });
        let lower = TensorSpec::new(&[32], DType::I64, Domain::Bounded { low: -1e19, high: 0.0 });
        let upper = TensorSpec::new(&[32], DType::I64, Domain::Bounded { low: 0.0, high: 1e19 });
        for spec in [&full, &lower, &upper] {
            for _ in 0..4 {
                assert!(spec.is_in(&spec.rand(&mut rng)), "{spec:?}");
            }
        }

        let empty = TensorSpec::new(&[4], DType::I64, Domain::Bounded { low: 5.0, high: 2.0 });
        assert_eq!(empty.rand(&mut rng), Tensor::full_i64(&[4], 5));
    }

    #[test]
    fn rand_is_deterministic_per_seed() {
        let spec = TensorSpec::unbounded(&[8], DType::F32);
        let a = spec.rand(&mut ChaCha8Rng::seed_from_u64(1));
        let b = spec.rand(&mut ChaCha8Rng::seed_from_u64(1));
        let c = spec.rand(&mut ChaCha8Rng::seed_from_u64(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn is_in_rejects_shape_dtype_and_domain() {
        let spec = TensorSpec::discrete(&[2], 3);
        assert!(!spec.is_in(&Tensor::full_i64(&[3], 0)));
        assert!(!spec.is_in(&Tensor::full_f32(&[2], 0.0)));
        assert!(!spec.is_in(&Tensor::full_i64(&[2], 3)));
        assert!(spec.is_in(&Tensor::full_i64(&[2], 2)));
    }

    #[test]
    fn composite_zero_matches_layout() {
        let spec = nested_spec();
        let zero = spec.zero().unwrap();
        assert_eq!(zero.batch_size(), &[4]);
        assert_eq!(zero.record("data").unwrap().batch_size(), &[4, 3]);
        assert!(spec.is_in(&zero));
        assert_eq!(
            spec.leaf_paths(),
            vec![KeyPath::from("observation"), KeyPath::from(("data", "states"))]
        );
    }

    #[test]
    fn composite_expand_prefixes_every_shape() {
        let spec = nested_spec().expand(&[2]);
        assert_eq!(spec.shape(), &[2, 4]);
        assert_eq!(spec.get_leaf(("data", "states")).unwrap().shape(), &[2, 4, 3, 1]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!(spec.is_in(&spec.rand(&mut rng).unwrap()));
    }

    #[test]
    fn insert_validates_leading_shape() {
        let mut spec = CompositeSpec::new(&[4]);
        spec.insert(("data", "action"), TensorSpec::binary(&[4, 1], DType::I64))
            .unwrap();
        assert!(matches!(spec.get("data"), Some(Spec::Composite(_))));
        assert!(spec.get_leaf(("data", "action")).is_some());
        assert!(spec
            .insert("bad", TensorSpec::binary(&[3, 1], DType::I64))
            .is_err());
    }

    #[test]
    fn to_relabels_leaves() {
        let spec = nested_spec().to(Device::Cuda(0));
        let leaf = spec.get_leaf(("data", "states")).unwrap();
        assert_eq!(leaf.device(), Device::Cuda(0));
        assert_eq!(leaf.zero().device(), Device::Cuda(0));
    }
}
