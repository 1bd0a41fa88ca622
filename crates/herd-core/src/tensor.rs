//! Dense row-major tensors, the leaf buffers of a [`Record`](crate::Record).

use smallvec::SmallVec;

use crate::device::Device;
use crate::error::RecordError;

/// Tensor and batch shapes. Almost always four dims or fewer.
pub type Shape = SmallVec<[usize; 4]>;

/// Number of elements of a shape (1 for the empty shape).
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Element type of a [`Tensor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit float.
    F32,
    /// 64-bit signed integer.
    I64,
    /// Boolean.
    Bool,
}

/// Typed element storage.
#[derive(Clone, Debug)]
pub enum TensorData {
    /// 32-bit floats.
    F32(Vec<f32>),
    /// 64-bit signed integers.
    I64(Vec<i64>),
    /// Booleans.
    Bool(Vec<bool>),
}

impl TensorData {
    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::I64 => Self::I64(vec![0; len]),
            DType::Bool => Self::Bool(vec![false; len]),
        }
    }

    fn with_capacity(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Self::F32(Vec::with_capacity(len)),
            DType::I64 => Self::I64(Vec::with_capacity(len)),
            DType::Bool => Self::Bool(Vec::with_capacity(len)),
        }
    }

    /// Element type of the storage.
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
        }
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    /// Whether the storage holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `src[start..end]`. Both sides must share a dtype.
    fn extend_range(&mut self, src: &TensorData, start: usize, end: usize) {
        match (self, src) {
            (Self::F32(d), Self::F32(s)) => d.extend_from_slice(&s[start..end]),
            (Self::I64(d), Self::I64(s)) => d.extend_from_slice(&s[start..end]),
            (Self::Bool(d), Self::Bool(s)) => d.extend_from_slice(&s[start..end]),
            _ => {}
        }
    }

    /// Overwrite `self[at..at + len]` with `src[at..at + len]`.
    fn copy_range(&mut self, src: &TensorData, at: usize, len: usize) {
        let range = at..at + len;
        match (self, src) {
            (Self::F32(d), Self::F32(s)) => d[range.clone()].copy_from_slice(&s[range]),
            (Self::I64(d), Self::I64(s)) => d[range.clone()].copy_from_slice(&s[range]),
            (Self::Bool(d), Self::Bool(s)) => d[range.clone()].copy_from_slice(&s[range]),
            _ => {}
        }
    }

    fn is_nonzero(&self, i: usize) -> bool {
        match self {
            Self::F32(v) => v[i] != 0.0,
            Self::I64(v) => v[i] != 0,
            Self::Bool(v) => v[i],
        }
    }
}

impl PartialEq for TensorData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::F32(a), Self::F32(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            _ => false,
        }
    }
}

/// A dense, row-major tensor with a device tag.
///
/// Equality is exact: float elements compare by bit pattern, so two
/// rollouts are equal only when they are bit-identical.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
    device: Device,
}

impl Tensor {
    /// Build a tensor from a shape and matching storage.
    pub fn new(shape: &[usize], data: TensorData) -> Result<Self, RecordError> {
        let expected = numel(shape);
        if data.len() != expected {
            return Err(RecordError::LengthMismatch {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape: Shape::from_slice(shape),
            data,
            device: Device::Cpu,
        })
    }

    /// A tensor of 32-bit floats.
    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self, RecordError> {
        Self::new(shape, TensorData::F32(data))
    }

    /// A tensor of 64-bit integers.
    pub fn from_i64(shape: &[usize], data: Vec<i64>) -> Result<Self, RecordError> {
        Self::new(shape, TensorData::I64(data))
    }

    /// A tensor of booleans.
    pub fn from_bool(shape: &[usize], data: Vec<bool>) -> Result<Self, RecordError> {
        Self::new(shape, TensorData::Bool(data))
    }

    /// A zero-filled tensor (`false` for booleans).
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: Shape::from_slice(shape),
            data: TensorData::zeros(dtype, numel(shape)),
            device: Device::Cpu,
        }
    }

    /// A float tensor filled with `value`.
    pub fn full_f32(shape: &[usize], value: f32) -> Self {
        Self {
            shape: Shape::from_slice(shape),
            data: TensorData::F32(vec![value; numel(shape)]),
            device: Device::Cpu,
        }
    }

    /// An integer tensor filled with `value`.
    pub fn full_i64(shape: &[usize], value: i64) -> Self {
        Self {
            shape: Shape::from_slice(shape),
            data: TensorData::I64(vec![value; numel(shape)]),
            device: Device::Cpu,
        }
    }

    /// A boolean tensor filled with `value`.
    pub fn full_bool(shape: &[usize], value: bool) -> Self {
        Self {
            shape: Shape::from_slice(shape),
            data: TensorData::Bool(vec![value; numel(shape)]),
            device: Device::Cpu,
        }
    }

    /// The shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Device tag.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Raw storage.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Float elements, if this is an `F32` tensor.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable float elements, if this is an `F32` tensor.
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Integer elements, if this is an `I64` tensor.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable integer elements, if this is an `I64` tensor.
    pub fn as_i64_mut(&mut self) -> Option<&mut [i64]> {
        match &mut self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean elements, if this is a `Bool` tensor.
    pub fn as_bool(&self) -> Option<&[bool]> {
        match &self.data {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable boolean elements, if this is a `Bool` tensor.
    pub fn as_bool_mut(&mut self) -> Option<&mut [bool]> {
        match &mut self.data {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Element `i` (flat index) widened to `f64`, booleans as 0/1.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match &self.data {
            TensorData::F32(v) => v.get(i).map(|x| f64::from(*x)),
            TensorData::I64(v) => v.get(i).map(|x| *x as f64),
            TensorData::Bool(v) => v.get(i).map(|x| if *x { 1.0 } else { 0.0 }),
        }
    }

    /// Whether any element is non-zero (or `true`).
    pub fn any(&self) -> bool {
        (0..self.numel()).any(|i| self.data.is_nonzero(i))
    }

    /// Whether every element is non-zero (or `true`).
    pub fn all(&self) -> bool {
        (0..self.numel()).all(|i| self.data.is_nonzero(i))
    }

    /// Elements as booleans (non-zero is `true`), whatever the dtype.
    pub fn to_mask(&self) -> Vec<bool> {
        (0..self.numel()).map(|i| self.data.is_nonzero(i)).collect()
    }

    /// A copy tagged with `device`.
    pub fn to(&self, device: Device) -> Self {
        let mut moved = self.clone();
        moved.device = device;
        moved
    }

    /// Retag in place.
    pub fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    /// Row `index` along the first dimension.
    pub fn select(&self, index: usize) -> Result<Self, RecordError> {
        let rows = self.shape.first().copied().unwrap_or(0);
        if index >= rows {
            return Err(RecordError::InvalidIndex { index, bound: rows });
        }
        let row = numel(&self.shape[1..]);
        let mut data = TensorData::with_capacity(self.dtype(), row);
        data.extend_range(&self.data, index * row, (index + 1) * row);
        Ok(Self {
            shape: Shape::from_slice(&self.shape[1..]),
            data,
            device: self.device,
        })
    }

    /// Stack same-shaped tensors along a new dimension `dim`.
    ///
    /// `dim` may equal the common rank, appending a trailing dimension.
    pub fn stack(tensors: &[&Tensor], dim: usize) -> Result<Self, RecordError> {
        let first = tensors.first().ok_or(RecordError::EmptyStack)?;
        if dim > first.ndim() {
            return Err(RecordError::InvalidIndex {
                index: dim,
                bound: first.ndim() + 1,
            });
        }
        for t in &tensors[1..] {
            if t.shape != first.shape {
                return Err(RecordError::ShapeMismatch {
                    key: String::new(),
                    expected: first.shape.to_vec(),
                    got: t.shape.to_vec(),
                });
            }
            if t.dtype() != first.dtype() {
                return Err(RecordError::DTypeMismatch { key: String::new() });
            }
        }

        let outer = numel(&first.shape[..dim]);
        let inner = numel(&first.shape[dim..]);
        let mut data = TensorData::with_capacity(first.dtype(), outer * inner * tensors.len());
        for o in 0..outer {
            for t in tensors {
                data.extend_range(&t.data, o * inner, (o + 1) * inner);
            }
        }

        let mut shape = Shape::with_capacity(first.ndim() + 1);
        shape.extend_from_slice(&first.shape[..dim]);
        shape.push(tensors.len());
        shape.extend_from_slice(&first.shape[dim..]);
        Ok(Self {
            shape,
            data,
            device: first.device,
        })
    }

    /// Repeat this tensor under the leading dimensions `prefix`.
    pub fn expand(&self, prefix: &[usize]) -> Self {
        let copies = numel(prefix);
        let mut data = TensorData::with_capacity(self.dtype(), copies * self.numel());
        for _ in 0..copies {
            data.extend_range(&self.data, 0, self.numel());
        }
        let mut shape = Shape::from_slice(prefix);
        shape.extend_from_slice(&self.shape);
        Self {
            shape,
            data,
            device: self.device,
        }
    }

    /// Overwrite the blocks of `self` selected by `mask` with the same
    /// blocks of `src`.
    ///
    /// After dropping trailing unit dims, `mask`'s shape must be a prefix
    /// of `self`'s shape; each mask element selects the block of trailing
    /// elements below it. `src` must match `self` in shape and dtype.
    pub fn assign_rows(&mut self, mask: &Tensor, src: &Tensor) -> Result<(), RecordError> {
        if src.shape != self.shape {
            return Err(RecordError::ShapeMismatch {
                key: String::new(),
                expected: self.shape.to_vec(),
                got: src.shape.to_vec(),
            });
        }
        if src.dtype() != self.dtype() {
            return Err(RecordError::DTypeMismatch { key: String::new() });
        }
        let mut prefix = mask.shape();
        while let Some((&1, rest)) = prefix.split_last() {
            if self.shape.starts_with(prefix) {
                break;
            }
            prefix = rest;
        }
        if !self.shape.starts_with(prefix) {
            return Err(RecordError::ShapeMismatch {
                key: String::new(),
                expected: self.shape.to_vec(),
                got: mask.shape.to_vec(),
            });
        }
        let block = numel(&self.shape[prefix.len()..]);
        for (j, selected) in mask.to_mask().into_iter().enumerate() {
            if selected {
                self.data.copy_range(&src.data, j * block, block);
            }
        }
        Ok(())
    }

    /// Copy `src`'s elements into `self` in place.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<(), RecordError> {
        if src.shape != self.shape {
            return Err(RecordError::ShapeMismatch {
                key: String::new(),
                expected: self.shape.to_vec(),
                got: src.shape.to_vec(),
            });
        }
        if src.dtype() != self.dtype() {
            return Err(RecordError::DTypeMismatch { key: String::new() });
        }
        let len = self.numel();
        self.data.copy_range(&src.data, 0, len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: &[usize]) -> Tensor {
        let n = numel(shape);
        Tensor::from_i64(shape, (0..n as i64).collect()).unwrap()
    }

    #[test]
    fn new_rejects_wrong_length() {
        match Tensor::from_f32(&[2, 3], vec![0.0; 5]) {
            Err(RecordError::LengthMismatch {
                expected: 6,
                got: 5,
            }) => {}
            other => panic!("expected LengthMismatch, got {other:?}"),
        }
    }

    #[test]
    fn select_takes_one_row() {
        let t = iota(&[3, 2]);
        let row = t.select(1).unwrap();
        assert_eq!(row.shape(), &[2]);
        assert_eq!(row.as_i64().unwrap(), &[2, 3]);
        assert!(t.select(3).is_err());
    }

    #[test]
    fn stack_dim0_concatenates_rows() {
        let a = Tensor::full_i64(&[2], 1);
        let b = Tensor::full_i64(&[2], 2);
        let s = Tensor::stack(&[&a, &b], 0).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.as_i64().unwrap(), &[1, 1, 2, 2]);
    }

    #[test]
    fn stack_trailing_dim_interleaves() {
        let a = iota(&[2]);
        let b = Tensor::full_i64(&[2], 9);
        let s = Tensor::stack(&[&a, &b], 1).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.as_i64().unwrap(), &[0, 9, 1, 9]);
    }

    #[test]
    fn stack_rejects_mismatched_shapes() {
        let a = iota(&[2]);
        let b = iota(&[3]);
        assert!(Tensor::stack(&[&a, &b], 0).is_err());
        assert!(matches!(
            Tensor::stack(&[], 0),
            Err(RecordError::EmptyStack)
        ));
    }

    #[test]
    fn expand_repeats_under_prefix() {
        let t = iota(&[2]);
        let e = t.expand(&[3]);
        assert_eq!(e.shape(), &[3, 2]);
        assert_eq!(e.as_i64().unwrap(), &[0, 1, 0, 1, 0, 1]);
        assert_eq!(e.select(2).unwrap(), t);
    }

    #[test]
    fn assign_rows_respects_mask_with_trailing_unit_dim() {
        let mut t = Tensor::full_i64(&[3, 1], 4);
        let src = Tensor::zeros(&[3, 1], DType::I64);
        let mask = Tensor::from_bool(&[3, 1], vec![true, false, true]).unwrap();
        t.assign_rows(&mask, &src).unwrap();
        assert_eq!(t.as_i64().unwrap(), &[0, 4, 0]);
    }

    #[test]
    fn assign_rows_with_row_mask_over_blocks() {
        let mut t = Tensor::full_f32(&[2, 3], 1.0);
        let src = Tensor::zeros(&[2, 3], DType::F32);
        let mask = Tensor::from_bool(&[2, 1], vec![false, true]).unwrap();
        t.assign_rows(&mask, &src).unwrap();
        assert_eq!(t.as_f32().unwrap(), &[1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn float_equality_is_bitwise() {
        let a = Tensor::full_f32(&[1], 0.0);
        let b = Tensor::full_f32(&[1], -0.0);
        assert_ne!(a, b);
        let nan = Tensor::full_f32(&[1], f32::NAN);
        assert_eq!(nan, nan.clone());
    }

    #[test]
    fn any_and_all_across_dtypes() {
        assert!(!Tensor::zeros(&[4], DType::Bool).any());
        assert!(Tensor::full_i64(&[4], 2).all());
        assert!(Tensor::from_f32(&[2], vec![0.0, 0.5]).unwrap().any());
    }
}
