//! Structured records: nested, ordered mappings with a shared batch-size
//! prefix.
//!
//! A [`Record`] maps names to [`Entry`] values: dense tensors, nested
//! records, or padded tensors produced when stacking heterogeneous
//! records. Every entry's leading dimensions equal the batch size of the
//! record that directly contains it; every mutating operation checks
//! this before touching the tree.

use indexmap::{IndexMap, IndexSet};

use crate::device::Device;
use crate::error::RecordError;
use crate::key::{dotted, KeyPath};
use crate::tensor::{Shape, Tensor};

// ── Entries ─────────────────────────────────────────────────────

/// A tensor with a per-row presence mask along its first dimension.
///
/// Rows whose mask bit is `false` are zero-filled placeholders for
/// records that lacked the key when they were stacked.
#[derive(Clone, Debug, PartialEq)]
pub struct Padded {
    tensor: Tensor,
    present: Vec<bool>,
}

impl Padded {
    /// Pair a stacked tensor with its presence mask.
    pub fn new(tensor: Tensor, present: Vec<bool>) -> Result<Self, RecordError> {
        let rows = tensor.shape().first().copied().unwrap_or(0);
        if rows != present.len() {
            return Err(RecordError::LengthMismatch {
                expected: rows,
                got: present.len(),
            });
        }
        Ok(Self { tensor, present })
    }

    /// The stacked buffer, absent rows zero-filled.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Presence mask, one bit per row.
    pub fn present(&self) -> &[bool] {
        &self.present
    }

    /// Whether row `index` holds real data.
    pub fn is_present(&self, index: usize) -> bool {
        self.present.get(index).copied().unwrap_or(false)
    }
}

/// A value stored in a [`Record`].
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    /// A dense leaf buffer.
    Tensor(Tensor),
    /// A nested record.
    Record(Record),
    /// A leaf buffer present only in some rows.
    Padded(Padded),
}

impl Entry {
    /// The tensor, when this entry is a dense leaf.
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// The nested record, when this entry is one.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }

    /// The padded tensor, when this entry is one.
    pub fn as_padded(&self) -> Option<&Padded> {
        match self {
            Self::Padded(p) => Some(p),
            _ => None,
        }
    }

    /// Whether this entry is a leaf (anything but a nested record).
    pub fn is_leaf(&self) -> bool {
        !matches!(self, Self::Record(_))
    }

    fn leading_shape(&self) -> &[usize] {
        match self {
            Self::Tensor(t) => t.shape(),
            Self::Record(r) => r.batch_size(),
            Self::Padded(p) => p.tensor.shape(),
        }
    }

    fn to(&self, device: Device) -> Self {
        match self {
            Self::Tensor(t) => Self::Tensor(t.to(device)),
            Self::Record(r) => Self::Record(r.to(device)),
            Self::Padded(p) => Self::Padded(Padded {
                tensor: p.tensor.to(device),
                present: p.present.clone(),
            }),
        }
    }
}

// ── Record ──────────────────────────────────────────────────────

/// A nested, ordered mapping from names to [`Entry`] values with a
/// batch-size prefix shared by every entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    batch_size: Shape,
    device: Device,
    entries: IndexMap<String, Entry>,
}

impl Record {
    /// An empty record on the CPU.
    pub fn new(batch_size: &[usize]) -> Self {
        Self::with_device(batch_size, Device::Cpu)
    }

    /// An empty record on `device`.
    pub fn with_device(batch_size: &[usize], device: Device) -> Self {
        Self {
            batch_size: Shape::from_slice(batch_size),
            device,
            entries: IndexMap::new(),
        }
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: impl Into<KeyPath>, tensor: Tensor) -> Result<Self, RecordError> {
        self.set(key, tensor)?;
        Ok(self)
    }

    /// Builder-style [`set_record`](Self::set_record).
    pub fn with_record(
        mut self,
        key: impl Into<KeyPath>,
        record: Record,
    ) -> Result<Self, RecordError> {
        self.set_record(key, record)?;
        Ok(self)
    }

    /// The batch-size prefix.
    pub fn batch_size(&self) -> &[usize] {
        &self.batch_size
    }

    /// Number of batch dimensions.
    pub fn batch_dims(&self) -> usize {
        self.batch_size.len()
    }

    /// Device tag.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of root entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the record has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Root entry names, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Root entries, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    // ── Lookup ──────────────────────────────────────────────────

    /// The entry at `path`.
    pub fn get_path(&self, path: &[String]) -> Option<&Entry> {
        let (last, parents) = path.split_last()?;
        self.node(parents)?.entries.get(last)
    }

    /// Mutable entry at `path`.
    pub fn get_path_mut(&mut self, path: &[String]) -> Option<&mut Entry> {
        let (last, parents) = path.split_last()?;
        self.node_mut(parents)?.entries.get_mut(last)
    }

    /// The record at `path`; the empty path is `self`.
    pub fn node(&self, path: &[String]) -> Option<&Record> {
        let mut node = self;
        for name in path {
            node = node.entries.get(name)?.as_record()?;
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &[String]) -> Option<&mut Record> {
        let mut node = self;
        for name in path {
            node = match node.entries.get_mut(name)? {
                Entry::Record(r) => r,
                _ => return None,
            };
        }
        Some(node)
    }

    /// The entry at `key`.
    pub fn get(&self, key: impl Into<KeyPath>) -> Option<&Entry> {
        let key: KeyPath = key.into();
        self.get_path(&key)
    }

    /// The dense tensor at `key`. Padded entries are not returned.
    pub fn tensor(&self, key: impl Into<KeyPath>) -> Option<&Tensor> {
        self.get(key)?.as_tensor()
    }

    /// Mutable dense tensor at `key`.
    pub fn tensor_mut(&mut self, key: impl Into<KeyPath>) -> Option<&mut Tensor> {
        let key: KeyPath = key.into();
        match self.get_path_mut(&key)? {
            Entry::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// The nested record at `key`.
    pub fn record(&self, key: impl Into<KeyPath>) -> Option<&Record> {
        self.get(key)?.as_record()
    }

    /// Mutable nested record at `key`.
    pub fn record_mut(&mut self, key: impl Into<KeyPath>) -> Option<&mut Record> {
        let key: KeyPath = key.into();
        match self.get_path_mut(&key)? {
            Entry::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Whether any entry exists at `key`.
    pub fn contains(&self, key: impl Into<KeyPath>) -> bool {
        self.get(key).is_some()
    }

    /// Every leaf key-path, depth first, in insertion order.
    pub fn leaf_paths(&self) -> Vec<KeyPath> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.collect_leaves(&mut prefix, &mut out);
        out
    }

    fn collect_leaves(&self, prefix: &mut Vec<String>, out: &mut Vec<KeyPath>) {
        for (name, entry) in &self.entries {
            prefix.push(name.clone());
            match entry {
                Entry::Record(r) => r.collect_leaves(prefix, out),
                _ => out.push(KeyPath::new(prefix.iter().cloned())),
            }
            prefix.pop();
        }
    }

    // ── Mutation ────────────────────────────────────────────────

    /// Store `tensor` at `key`, creating missing intermediate records
    /// with the batch size of their parent.
    pub fn set(&mut self, key: impl Into<KeyPath>, tensor: Tensor) -> Result<(), RecordError> {
        let key: KeyPath = key.into();
        self.insert_path(&key, Entry::Tensor(tensor))
    }

    /// Store a nested record at `key`.
    pub fn set_record(
        &mut self,
        key: impl Into<KeyPath>,
        record: Record,
    ) -> Result<(), RecordError> {
        let key: KeyPath = key.into();
        self.insert_path(&key, Entry::Record(record))
    }

    /// Store any entry at `path`, replacing what was there.
    ///
    /// Validation happens before any intermediate record is created, so
    /// a rejected insert leaves the record untouched.
    pub fn insert_path(&mut self, path: &[String], entry: Entry) -> Result<(), RecordError> {
        let Some((last, parents)) = path.split_last() else {
            return Err(RecordError::KeyNotFound { key: String::new() });
        };

        let mut batch: &[usize] = &self.batch_size;
        let mut node = Some(&*self);
        for (depth, name) in parents.iter().enumerate() {
            node = match node.and_then(|n| n.entries.get(name)) {
                Some(Entry::Record(r)) => {
                    batch = &r.batch_size;
                    Some(r)
                }
                Some(_) => {
                    return Err(RecordError::NotARecord {
                        key: dotted(&path[..=depth]),
                    })
                }
                None => None,
            };
        }
        check_leading(path, batch, &entry)?;

        let mut node = self;
        for (depth, name) in parents.iter().enumerate() {
            let batch = node.batch_size.clone();
            let device = node.device;
            node = match node
                .entries
                .entry(name.clone())
                .or_insert_with(|| Entry::Record(Record::with_device(&batch, device)))
            {
                Entry::Record(r) => r,
                _ => {
                    return Err(RecordError::NotARecord {
                        key: dotted(&path[..=depth]),
                    })
                }
            };
        }
        node.entries.insert(last.clone(), entry);
        Ok(())
    }

    /// Remove and return the entry at `key`, keeping the order of the
    /// remaining entries.
    pub fn remove(&mut self, key: impl Into<KeyPath>) -> Option<Entry> {
        let key: KeyPath = key.into();
        let (last, parents) = key.split_last()?;
        self.node_mut(parents)?.entries.shift_remove(last)
    }

    /// Copy the entry at `path` of `source` into `self`.
    ///
    /// Missing ancestors are created once, each taking the batch size of
    /// the corresponding record in `source`; existing ancestors are
    /// reused.
    pub fn insert_from(&mut self, source: &Record, path: &[String]) -> Result<(), RecordError> {
        let entry = source
            .get_path(path)
            .ok_or_else(|| RecordError::KeyNotFound { key: dotted(path) })?
            .clone();
        for depth in 1..path.len() {
            let prefix = &path[..depth];
            match self.get_path(prefix) {
                Some(Entry::Record(_)) => {}
                Some(_) => {
                    return Err(RecordError::NotARecord {
                        key: dotted(prefix),
                    })
                }
                None => {
                    let src = source.node(prefix).ok_or_else(|| RecordError::NotARecord {
                        key: dotted(prefix),
                    })?;
                    let ancestor = Record::with_device(src.batch_size(), src.device());
                    self.insert_path(prefix, Entry::Record(ancestor))?;
                }
            }
        }
        self.insert_path(path, entry)
    }

    /// Merge every leaf of `other` into `self`.
    ///
    /// Dense tensors already present with the same shape and dtype are
    /// overwritten in place; everything else is inserted.
    pub fn update(&mut self, other: &Record) -> Result<(), RecordError> {
        for path in other.leaf_paths() {
            let in_place = matches!(
                (self.get_path(&path), other.get_path(&path)),
                (Some(Entry::Tensor(dst)), Some(Entry::Tensor(src)))
                    if dst.shape() == src.shape() && dst.dtype() == src.dtype()
            );
            if in_place {
                if let (Some(Entry::Tensor(dst)), Some(Entry::Tensor(src))) =
                    (self.get_path_mut(&path), other.get_path(&path))
                {
                    dst.copy_from(src)?;
                }
            } else {
                self.insert_from(other, &path)?;
            }
        }
        Ok(())
    }

    /// Make `self` equal to `src`, reusing buffers when both share the
    /// same leaf layout.
    pub fn assign(&mut self, src: &Record) -> Result<(), RecordError> {
        if self.batch_size == src.batch_size && self.leaf_paths() == src.leaf_paths() {
            self.update(src)
        } else {
            *self = src.clone();
            Ok(())
        }
    }

    // ── Batch operations ────────────────────────────────────────

    /// The sub-record at row `index` of the first batch dimension.
    ///
    /// Padded entries appear only when row `index` is present, and nested
    /// records left empty by that rule are dropped.
    pub fn index(&self, index: usize) -> Result<Record, RecordError> {
        let rows = self.batch_size.first().copied().unwrap_or(0);
        if index >= rows {
            return Err(RecordError::InvalidIndex { index, bound: rows });
        }
        let mut out = Record::with_device(&self.batch_size[1..], self.device);
        for (name, entry) in &self.entries {
            let row = match entry {
                Entry::Tensor(t) => Entry::Tensor(t.select(index)?),
                Entry::Record(r) => {
                    let row = r.index(index)?;
                    // every leaf below was absent at this row
                    if row.is_empty() && !r.is_empty() {
                        continue;
                    }
                    Entry::Record(row)
                }
                Entry::Padded(p) if p.is_present(index) => Entry::Tensor(p.tensor.select(index)?),
                Entry::Padded(_) => continue,
            };
            out.entries.insert(name.clone(), row);
        }
        Ok(out)
    }

    /// Stack records with identical batch sizes and key sets along a new
    /// batch dimension `dim`.
    pub fn stack(records: &[&Record], dim: usize) -> Result<Record, RecordError> {
        let first = records.first().ok_or(RecordError::EmptyStack)?;
        if dim > first.batch_dims() {
            return Err(RecordError::InvalidIndex {
                index: dim,
                bound: first.batch_dims() + 1,
            });
        }
        let mut prefix = Vec::new();
        stack_at(records, dim, &mut prefix)
    }

    /// Stack records along a new first dimension, tolerating divergent
    /// key sets.
    ///
    /// Keys missing from some records become [`Padded`] entries whose
    /// absent rows are zero-filled. Keys present everywhere stack
    /// densely. Batch sizes must agree.
    pub fn stack_padded(records: &[&Record]) -> Result<Record, RecordError> {
        if records.is_empty() {
            return Err(RecordError::EmptyStack);
        }
        let mut prefix = Vec::new();
        stack_padded_at(records, &mut prefix)
    }

    /// Repeat every entry under the leading dimensions `prefix`.
    ///
    /// Padded entries are expanded as dense tensors; their presence mask
    /// does not survive a change of the first dimension.
    pub fn expand(&self, prefix: &[usize]) -> Record {
        let mut batch = Shape::from_slice(prefix);
        batch.extend_from_slice(&self.batch_size);
        let mut out = Record::with_device(&batch, self.device);
        for (name, entry) in &self.entries {
            let expanded = match entry {
                Entry::Tensor(t) => Entry::Tensor(t.expand(prefix)),
                Entry::Record(r) => Entry::Record(r.expand(prefix)),
                Entry::Padded(p) => Entry::Tensor(p.tensor.expand(prefix)),
            };
            out.entries.insert(name.clone(), expanded);
        }
        out
    }

    /// A copy with every field relocated to `device`.
    pub fn to(&self, device: Device) -> Record {
        Record {
            batch_size: self.batch_size.clone(),
            device,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to(device)))
                .collect(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────

fn check_leading(path: &[String], batch: &[usize], entry: &Entry) -> Result<(), RecordError> {
    let leading = entry.leading_shape();
    if !leading.starts_with(batch) {
        return Err(RecordError::ShapeMismatch {
            key: dotted(path),
            expected: batch.to_vec(),
            got: leading.to_vec(),
        });
    }
    if let Entry::Padded(p) = entry {
        if batch.first() != Some(&p.present.len()) {
            return Err(RecordError::ShapeMismatch {
                key: dotted(path),
                expected: batch.to_vec(),
                got: vec![p.present.len()],
            });
        }
    }
    Ok(())
}

fn keyed(err: RecordError, path: &[String]) -> RecordError {
    match err {
        RecordError::ShapeMismatch { key, expected, got } if key.is_empty() => {
            RecordError::ShapeMismatch {
                key: dotted(path),
                expected,
                got,
            }
        }
        RecordError::DTypeMismatch { key } if key.is_empty() => {
            RecordError::DTypeMismatch { key: dotted(path) }
        }
        other => other,
    }
}

fn stacked_batch(batch: &[usize], dim: usize, count: usize) -> Shape {
    let mut out = Shape::with_capacity(batch.len() + 1);
    out.extend_from_slice(&batch[..dim]);
    out.push(count);
    out.extend_from_slice(&batch[dim..]);
    out
}

fn stack_at(records: &[&Record], dim: usize, path: &mut Vec<String>) -> Result<Record, RecordError> {
    let first = records[0];
    for r in &records[1..] {
        if r.batch_size != first.batch_size {
            return Err(RecordError::ShapeMismatch {
                key: dotted(path),
                expected: first.batch_size.to_vec(),
                got: r.batch_size.to_vec(),
            });
        }
        let divergent = first
            .entries
            .keys()
            .find(|name| !r.entries.contains_key(*name))
            .or_else(|| r.entries.keys().find(|name| !first.entries.contains_key(*name)));
        if let Some(name) = divergent {
            path.push(name.clone());
            let key = dotted(path);
            path.pop();
            return Err(RecordError::SchemaMismatch { key });
        }
    }

    let batch = stacked_batch(&first.batch_size, dim, records.len());
    let mut out = Record::with_device(&batch, first.device);
    for (name, entry) in &first.entries {
        path.push(name.clone());
        let column: Vec<&Entry> = records
            .iter()
            .map(|r| r.entries.get(name))
            .collect::<Option<_>>()
            .ok_or_else(|| RecordError::SchemaMismatch { key: dotted(path) })?;
        let stacked = match entry {
            Entry::Tensor(_) => {
                let tensors = column
                    .iter()
                    .map(|e| e.as_tensor())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| RecordError::SchemaMismatch { key: dotted(path) })?;
                Entry::Tensor(Tensor::stack(&tensors, dim).map_err(|e| keyed(e, path))?)
            }
            Entry::Record(_) => {
                let nested = column
                    .iter()
                    .map(|e| e.as_record())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| RecordError::SchemaMismatch { key: dotted(path) })?;
                Entry::Record(stack_at(&nested, dim, path)?)
            }
            Entry::Padded(p) => {
                let padded = column
                    .iter()
                    .map(|e| e.as_padded())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| RecordError::SchemaMismatch { key: dotted(path) })?;
                if dim == 0 || padded.iter().any(|q| q.present != p.present) {
                    return Err(RecordError::SchemaMismatch { key: dotted(path) });
                }
                let tensors: Vec<&Tensor> = padded.iter().map(|q| &q.tensor).collect();
                Entry::Padded(Padded {
                    tensor: Tensor::stack(&tensors, dim).map_err(|e| keyed(e, path))?,
                    present: p.present.clone(),
                })
            }
        };
        out.entries.insert(name.clone(), stacked);
        path.pop();
    }
    Ok(out)
}

fn stack_padded_at(records: &[&Record], path: &mut Vec<String>) -> Result<Record, RecordError> {
    let first = records[0];
    for r in &records[1..] {
        if r.batch_size != first.batch_size {
            return Err(RecordError::ShapeMismatch {
                key: dotted(path),
                expected: first.batch_size.to_vec(),
                got: r.batch_size.to_vec(),
            });
        }
    }

    let names: IndexSet<&String> = records.iter().flat_map(|r| r.entries.keys()).collect();
    let batch = stacked_batch(&first.batch_size, 0, records.len());
    let mut out = Record::with_device(&batch, first.device);
    for name in names {
        path.push(name.clone());
        let column: Vec<Option<&Entry>> = records.iter().map(|r| r.entries.get(name)).collect();
        let template = column
            .iter()
            .flatten()
            .next()
            .copied()
            .ok_or_else(|| RecordError::KeyNotFound { key: dotted(path) })?;
        let stacked = match template {
            Entry::Tensor(t) => {
                let zeros = Tensor::zeros(t.shape(), t.dtype()).to(first.device);
                let tensors = column
                    .iter()
                    .map(|e| match e {
                        Some(Entry::Tensor(x)) => Some(x),
                        Some(_) => None,
                        None => Some(&zeros),
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| RecordError::SchemaMismatch { key: dotted(path) })?;
                let tensor = Tensor::stack(&tensors, 0).map_err(|e| keyed(e, path))?;
                if column.iter().all(Option::is_some) {
                    Entry::Tensor(tensor)
                } else {
                    Entry::Padded(Padded {
                        tensor,
                        present: column.iter().map(Option::is_some).collect(),
                    })
                }
            }
            Entry::Record(r) => {
                let empty = Record::with_device(r.batch_size(), first.device);
                let nested = column
                    .iter()
                    .map(|e| match e {
                        Some(Entry::Record(x)) => Some(x),
                        Some(_) => None,
                        None => Some(&empty),
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| RecordError::SchemaMismatch { key: dotted(path) })?;
                Entry::Record(stack_padded_at(&nested, path)?)
            }
            Entry::Padded(_) => return Err(RecordError::SchemaMismatch { key: dotted(path) }),
        };
        out.entries.insert(name.clone(), stacked);
        path.pop();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use proptest::prelude::*;

    fn obs(batch: &[usize], value: f32) -> Tensor {
        let mut shape = batch.to_vec();
        shape.push(1);
        Tensor::full_f32(&shape, value)
    }

    fn sample(batch: &[usize], value: f32) -> Record {
        Record::new(batch)
            .with("observation", obs(batch, value))
            .unwrap()
            .with(("data", "states"), obs(batch, value + 1.0))
            .unwrap()
    }

    #[test]
    fn set_rejects_wrong_leading_dims() {
        let mut r = Record::new(&[3]);
        match r.set("x", Tensor::zeros(&[2, 1], DType::F32)) {
            Err(RecordError::ShapeMismatch { key, .. }) => assert_eq!(key, "x"),
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
        assert!(r.is_empty());
    }

    #[test]
    fn rejected_nested_insert_creates_no_ancestors() {
        let mut r = Record::new(&[3]);
        assert!(r.set(("a", "b"), Tensor::zeros(&[4], DType::F32)).is_err());
        assert!(!r.contains("a"));
    }

    #[test]
    fn set_creates_intermediate_records_with_parent_batch() {
        let r = sample(&[4], 0.0);
        assert_eq!(r.record("data").unwrap().batch_size(), &[4]);
        assert_eq!(
            r.leaf_paths(),
            vec![KeyPath::from("observation"), KeyPath::from(("data", "states"))]
        );
    }

    #[test]
    fn nested_record_may_extend_batch() {
        let mut r = Record::new(&[4]);
        let inner = Record::new(&[4, 3])
            .with("states", Tensor::zeros(&[4, 3, 1], DType::F32))
            .unwrap();
        r.set_record("data", inner).unwrap();
        assert!(r.set_record("bad", Record::new(&[3])).is_err());
        assert_eq!(r.index(0).unwrap().record("data").unwrap().batch_size(), &[3]);
    }

    #[test]
    fn set_through_a_tensor_fails() {
        let mut r = sample(&[2], 0.0);
        match r.set(("observation", "x"), obs(&[2], 0.0)) {
            Err(RecordError::NotARecord { key }) => assert_eq!(key, "observation"),
            other => panic!("expected NotARecord, got {other:?}"),
        }
    }

    #[test]
    fn remove_keeps_order() {
        let mut r = Record::new(&[1])
            .with("a", obs(&[1], 0.0))
            .unwrap()
            .with("b", obs(&[1], 0.0))
            .unwrap()
            .with("c", obs(&[1], 0.0))
            .unwrap();
        assert!(r.remove("b").is_some());
        assert_eq!(r.keys().collect::<Vec<_>>(), vec!["a", "c"]);
        assert!(r.remove(("a", "x")).is_none());
    }

    #[test]
    fn stack_then_index_recovers_rows() {
        let rows: Vec<Record> = (0..3).map(|i| sample(&[], i as f32)).collect();
        let refs: Vec<&Record> = rows.iter().collect();
        let stacked = Record::stack(&refs, 0).unwrap();
        assert_eq!(stacked.batch_size(), &[3]);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(&stacked.index(i).unwrap(), row);
        }
    }

    #[test]
    fn stack_trailing_dim_is_time() {
        let frames: Vec<Record> = (0..5).map(|t| sample(&[2], t as f32)).collect();
        let refs: Vec<&Record> = frames.iter().collect();
        let stacked = Record::stack(&refs, 1).unwrap();
        assert_eq!(stacked.batch_size(), &[2, 5]);
        assert_eq!(stacked.tensor("observation").unwrap().shape(), &[2, 5, 1]);
        assert_eq!(stacked.record("data").unwrap().batch_size(), &[2, 5]);
    }

    #[test]
    fn stack_rejects_divergent_keys() {
        let a = sample(&[], 0.0);
        let mut b = sample(&[], 0.0);
        b.remove("observation");
        b.set("other", obs(&[], 0.0)).unwrap();
        match Record::stack(&[&a, &b], 0) {
            Err(RecordError::SchemaMismatch { key }) => assert_eq!(key, "observation"),
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn stack_names_extra_and_missing_keys() {
        let a = sample(&[], 0.0);
        let b = sample(&[], 1.0).with("truncated", obs(&[], 0.0)).unwrap();
        match Record::stack(&[&a, &b], 0) {
            Err(RecordError::SchemaMismatch { key }) => assert_eq!(key, "truncated"),
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
        match Record::stack(&[&b, &a], 0) {
            Err(RecordError::SchemaMismatch { key }) => assert_eq!(key, "truncated"),
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }

        let mut c = sample(&[], 2.0);
        c.remove(("data", "states"));
        c.set(("data", "extra"), obs(&[], 0.0)).unwrap();
        c.set(("data", "more"), obs(&[], 0.0)).unwrap();
        match Record::stack(&[&a, &c], 0) {
            Err(RecordError::SchemaMismatch { key }) => assert_eq!(key, "data.states"),
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn stack_padded_marks_absent_rows() {
        let a = Record::new(&[])
            .with("shared", obs(&[], 1.0))
            .unwrap()
            .with("only_a", obs(&[], 2.0))
            .unwrap();
        let b = Record::new(&[])
            .with("shared", obs(&[], 3.0))
            .unwrap()
            .with(("nested", "only_b"), obs(&[], 4.0))
            .unwrap();
        let stacked = Record::stack_padded(&[&a, &b]).unwrap();
        assert!(stacked.tensor("shared").is_some());
        let only_a = stacked.get("only_a").and_then(Entry::as_padded).unwrap();
        assert_eq!(only_a.present(), &[true, false]);
        assert_eq!(only_a.tensor().as_f32().unwrap(), &[2.0, 0.0]);

        let row0 = stacked.index(0).unwrap();
        let row1 = stacked.index(1).unwrap();
        assert_eq!(row0, a);
        assert!(!row1.contains("only_a"));
        assert_eq!(row1.tensor(("nested", "only_b")), b.tensor(("nested", "only_b")));
    }

    #[test]
    fn update_copies_in_place_and_inserts_new() {
        let mut dst = sample(&[2], 0.0);
        let src = Record::new(&[2])
            .with("observation", obs(&[2], 5.0))
            .unwrap()
            .with(("extra", "x"), obs(&[2], 6.0))
            .unwrap();
        dst.update(&src).unwrap();
        assert_eq!(dst.tensor("observation"), src.tensor("observation"));
        assert_eq!(dst.tensor(("extra", "x")), src.tensor(("extra", "x")));
        assert!(dst.contains(("data", "states")));
    }

    #[test]
    fn to_relabels_every_field() {
        let r = sample(&[2], 0.0).to(Device::Cuda(0));
        assert_eq!(r.device(), Device::Cuda(0));
        assert_eq!(r.record("data").unwrap().device(), Device::Cuda(0));
        assert_eq!(r.tensor(("data", "states")).unwrap().device(), Device::Cuda(0));
    }

    #[test]
    fn expand_prefixes_batch() {
        let r = sample(&[2], 1.0).expand(&[3]);
        assert_eq!(r.batch_size(), &[3, 2]);
        assert_eq!(r.tensor("observation").unwrap().shape(), &[3, 2, 1]);
        assert_eq!(r.record("data").unwrap().batch_size(), &[3, 2]);
    }

    proptest! {
        #[test]
        fn leaves_always_carry_batch_prefix(
            batch in proptest::collection::vec(1usize..4, 0..3),
            count in 1usize..5,
            dim_seed in 0usize..8,
        ) {
            let rows: Vec<Record> = (0..count).map(|i| sample(&batch, i as f32)).collect();
            let refs: Vec<&Record> = rows.iter().collect();
            let dim = dim_seed % (batch.len() + 1);
            let stacked = Record::stack(&refs, dim).unwrap();
            for path in stacked.leaf_paths() {
                let t = stacked.get_path(&path).and_then(Entry::as_tensor).unwrap();
                prop_assert!(t.shape().starts_with(stacked.batch_size()));
            }
            prop_assert_eq!(stacked.batch_size()[dim], count);
        }
    }
}
