//! Result buffers: declarations, partial results and the aggregate result set.

use crate::error::EngineError;

use ndarray::{ArrayD, ArrayViewMutD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use strum_macros::Display;

/// How partial values of a field combine into the aggregate.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeKind {
    /// Element-wise addition. The aggregate has the field's extra shape.
    Sum,
    /// Each partition writes its own rows of a navigation-shaped aggregate.
    ReplaceLast,
    /// Partials are kept un-merged, keyed by partition id.
    PerPartition,
}

/// Numerical data types of result buffers.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BufferDType {
    /// [i64]
    Int64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

/// Declaration of one named result field of a UDF.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BufferDecl {
    /// Name of the field, unique within a declaration
    pub name: String,
    /// Combination law
    pub kind: MergeKind,
    /// Element type
    pub dtype: BufferDType,
    /// Shape of the field per position (for [MergeKind::ReplaceLast] and
    /// [MergeKind::PerPartition]) or of the whole field (for [MergeKind::Sum])
    pub extra_shape: Vec<usize>,
}

impl BufferDecl {
    /// Declare a field summed over all partitions.
    pub fn sum(name: &str, dtype: BufferDType, shape: &[usize]) -> Self {
        Self::new(name, MergeKind::Sum, dtype, shape)
    }

    /// Declare a navigation-shaped field written slice by slice.
    pub fn replace_last(name: &str, dtype: BufferDType, extra_shape: &[usize]) -> Self {
        Self::new(name, MergeKind::ReplaceLast, dtype, extra_shape)
    }

    /// Declare a field kept per partition.
    pub fn per_partition(name: &str, dtype: BufferDType, extra_shape: &[usize]) -> Self {
        Self::new(name, MergeKind::PerPartition, dtype, extra_shape)
    }

    fn new(name: &str, kind: MergeKind, dtype: BufferDType, extra_shape: &[usize]) -> Self {
        BufferDecl {
            name: name.to_string(),
            kind,
            dtype,
            extra_shape: extra_shape.to_vec(),
        }
    }

    /// Shape of a partial value produced for a partition of `partition_len` positions.
    pub fn partial_shape(&self, partition_len: usize) -> Vec<usize> {
        match self.kind {
            MergeKind::Sum => self.extra_shape.clone(),
            MergeKind::ReplaceLast | MergeKind::PerPartition => {
                positions_shape(partition_len, &self.extra_shape)
            }
        }
    }

    /// Shape of the aggregate of a [MergeKind::Sum] or [MergeKind::ReplaceLast] field over
    /// `nav_size` positions.
    pub fn aggregate_shape(&self, nav_size: usize) -> Vec<usize> {
        match self.kind {
            MergeKind::Sum => self.extra_shape.clone(),
            MergeKind::ReplaceLast | MergeKind::PerPartition => {
                positions_shape(nav_size, &self.extra_shape)
            }
        }
    }
}

fn positions_shape(positions: usize, extra_shape: &[usize]) -> Vec<usize> {
    std::iter::once(positions)
        .chain(extra_shape.iter().copied())
        .collect()
}

/// Check that a UDF declaration is non-empty and its field names are unique.
pub fn validate_decls(decls: &[BufferDecl]) -> Result<(), EngineError> {
    if decls.is_empty() {
        return Err(EngineError::configuration("UDF declares no result buffers"));
    }
    let mut names = HashSet::new();
    for decl in decls {
        if decl.name.is_empty() {
            return Err(EngineError::configuration("result buffer name is empty"));
        }
        if !names.insert(decl.name.as_str()) {
            return Err(EngineError::configuration(format!(
                "result buffer {} declared more than once",
                decl.name
            )));
        }
    }
    Ok(())
}

/// Typed numeric array of one of the [BufferDType] element types.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "dtype", content = "data", rename_all = "lowercase")]
pub enum BufferData {
    Int64(ArrayD<i64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

impl BufferData {
    /// Return a zero-filled buffer.
    pub fn zeros(dtype: BufferDType, shape: &[usize]) -> Self {
        let shape = IxDyn(shape);
        match dtype {
            BufferDType::Int64 => BufferData::Int64(ArrayD::zeros(shape)),
            BufferDType::Float32 => BufferData::Float32(ArrayD::zeros(shape)),
            BufferDType::Float64 => BufferData::Float64(ArrayD::zeros(shape)),
        }
    }

    /// Element type of the buffer.
    pub fn dtype(&self) -> BufferDType {
        match self {
            BufferData::Int64(_) => BufferDType::Int64,
            BufferData::Float32(_) => BufferDType::Float32,
            BufferData::Float64(_) => BufferDType::Float64,
        }
    }

    /// Shape of the buffer.
    pub fn shape(&self) -> &[usize] {
        match self {
            BufferData::Int64(array) => array.shape(),
            BufferData::Float32(array) => array.shape(),
            BufferData::Float64(array) => array.shape(),
        }
    }

    /// Typed view of the buffer, if its element type is `T`.
    pub fn as_array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::array(self)
    }

    /// Typed mutable view of the buffer, if its element type is `T`.
    pub fn as_array_mut<T: Element>(&mut self) -> Option<&mut ArrayD<T>> {
        T::array_mut(self)
    }
}

/// Trait for result buffer elements.
pub trait Element:
    Clone
    + Copy
    + PartialOrd
    + num_traits::FromPrimitive
    + num_traits::Zero
    + std::fmt::Debug
    + std::ops::AddAssign
    + Send
    + Sync
    + 'static
{
    /// Runtime data type corresponding to this element type.
    const DTYPE: BufferDType;

    /// Return the array of a buffer if it holds this element type.
    fn array(buffer: &BufferData) -> Option<&ArrayD<Self>>;

    /// Return the mutable array of a buffer if it holds this element type.
    fn array_mut(buffer: &mut BufferData) -> Option<&mut ArrayD<Self>>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: BufferDType = BufferDType::$variant;

            fn array(buffer: &BufferData) -> Option<&ArrayD<Self>> {
                match buffer {
                    BufferData::$variant(array) => Some(array),
                    _ => None,
                }
            }

            fn array_mut(buffer: &mut BufferData) -> Option<&mut ArrayD<Self>> {
                match buffer {
                    BufferData::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(i64, Int64);
impl_element!(f32, Float32);
impl_element!(f64, Float64);

/// Result buffers produced by one task attempt for one partition.
///
/// Workers own their partial results exclusively and hand them back to the runner, which is the
/// only writer of the aggregate.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PartialResult {
    /// Partition the buffers belong to
    pub partition: usize,
    /// One buffer per declared field
    pub buffers: BTreeMap<String, BufferData>,
}

impl PartialResult {
    /// Allocate zeroed partial buffers for a partition of `partition_len` positions.
    ///
    /// Zero is the identity of [MergeKind::Sum] and the unwritten value of the other kinds, so an
    /// unprocessed partial contributes nothing.
    pub fn zeros(partition: usize, decls: &[BufferDecl], partition_len: usize) -> Self {
        let buffers = decls
            .iter()
            .map(|decl| {
                (
                    decl.name.clone(),
                    BufferData::zeros(decl.dtype, &decl.partial_shape(partition_len)),
                )
            })
            .collect();
        PartialResult { partition, buffers }
    }

    /// Typed mutable view of a field.
    ///
    /// # Arguments
    ///
    /// * `name`: Name of the declared field
    pub fn field_mut<T: Element>(
        &mut self,
        name: &str,
    ) -> Result<ArrayViewMutD<'_, T>, EngineError> {
        self.buffers
            .get_mut(name)
            .and_then(BufferData::as_array_mut::<T>)
            .map(|array| array.view_mut())
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "no result buffer {} of type {}",
                    name,
                    T::DTYPE
                ))
            })
    }

    /// Typed view of a field, if present with element type `T`.
    pub fn field<T: Element>(&self, name: &str) -> Option<&ArrayD<T>> {
        self.buffers.get(name).and_then(BufferData::as_array::<T>)
    }
}

/// Aggregate value of one field.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateBuffer {
    /// [MergeKind::Sum] and [MergeKind::ReplaceLast] fields
    Dense(BufferData),
    /// [MergeKind::PerPartition] fields, keyed by partition id
    PerPartition(BTreeMap<usize, BufferData>),
}

/// Aggregate result of a run: one entry per declared field.
///
/// Created zero-initialised at run start and mutated in place by the merge engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultSet {
    /// Declaration captured at run start
    decls: Vec<BufferDecl>,
    /// Aggregate per field name
    fields: BTreeMap<String, AggregateBuffer>,
}

impl ResultSet {
    /// Return a zero-initialised ResultSet.
    ///
    /// # Arguments
    ///
    /// * `decls`: Validated UDF declaration
    /// * `nav_size`: Number of navigation positions in the dataset
    pub fn new(decls: &[BufferDecl], nav_size: usize) -> Self {
        let fields = decls
            .iter()
            .map(|decl| {
                let aggregate = match decl.kind {
                    MergeKind::Sum | MergeKind::ReplaceLast => AggregateBuffer::Dense(
                        BufferData::zeros(decl.dtype, &decl.aggregate_shape(nav_size)),
                    ),
                    MergeKind::PerPartition => AggregateBuffer::PerPartition(BTreeMap::new()),
                };
                (decl.name.clone(), aggregate)
            })
            .collect();
        ResultSet {
            decls: decls.to_vec(),
            fields,
        }
    }

    /// Declaration the result set was created from.
    pub fn decls(&self) -> &[BufferDecl] {
        &self.decls
    }

    /// Aggregate of a field.
    pub fn get(&self, name: &str) -> Option<&AggregateBuffer> {
        self.fields.get(name)
    }

    /// Typed aggregate of a [MergeKind::Sum] or [MergeKind::ReplaceLast] field.
    pub fn dense<T: Element>(&self, name: &str) -> Option<&ArrayD<T>> {
        match self.fields.get(name) {
            Some(AggregateBuffer::Dense(data)) => data.as_array::<T>(),
            _ => None,
        }
    }

    /// Per-partition aggregate of a [MergeKind::PerPartition] field.
    pub fn per_partition(&self, name: &str) -> Option<&BTreeMap<usize, BufferData>> {
        match self.fields.get(name) {
            Some(AggregateBuffer::PerPartition(map)) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut AggregateBuffer> {
        self.fields.get_mut(name)
    }
}
