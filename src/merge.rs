//! Merge engine: applies partial results to the aggregate result set.
//!
//! Every field of a partial result is checked against its declaration before any field of the
//! aggregate is written, so a rejected partial never leaves the aggregate half-merged.

use crate::buffers::{
    AggregateBuffer, BufferData, BufferDecl, MergeKind, PartialResult, ResultSet,
};
use crate::error::EngineError;

use ndarray::{Axis, Slice};
use std::ops::Range;

/// Merge one field's partial value into its aggregate.
///
/// # Arguments
///
/// * `decl`: Declaration of the field
/// * `partial`: Partial value produced for the partition
/// * `partition`: Id of the partition
/// * `range`: Navigation range of the partition
/// * `aggregate`: Aggregate of the field
pub fn merge(
    decl: &BufferDecl,
    partial: &BufferData,
    partition: usize,
    range: &Range<usize>,
    aggregate: &mut AggregateBuffer,
) -> Result<(), EngineError> {
    check_field(decl, partial, partition, range.len(), aggregate)?;
    apply(decl, partial, partition, range, aggregate)
}

/// Merge every field of a partial result into the aggregate result set.
///
/// # Arguments
///
/// * `decls`: Declaration captured at run start
/// * `partial`: Partial result of one task attempt
/// * `range`: Navigation range of the partition the partial belongs to
/// * `results`: Aggregate result set
pub fn merge_partial(
    decls: &[BufferDecl],
    partial: &PartialResult,
    range: &Range<usize>,
    results: &mut ResultSet,
) -> Result<(), EngineError> {
    let partition = partial.partition;
    if let Some(name) = partial
        .buffers
        .keys()
        .find(|name| !decls.iter().any(|decl| &decl.name == *name))
    {
        return Err(EngineError::MergeShapeMismatch {
            field: name.clone(),
            partition,
            expected: vec![],
            actual: partial.buffers[name].shape().to_vec(),
        });
    }
    for decl in decls {
        let (value, aggregate) = field_pair(decl, partial, results)?;
        check_field(decl, value, partition, range.len(), aggregate)?;
    }
    for decl in decls {
        let value = &partial.buffers[&decl.name];
        let aggregate = results
            .get_mut(&decl.name)
            .ok_or_else(|| missing_aggregate(decl))?;
        apply(decl, value, partition, range, aggregate)?;
    }
    Ok(())
}

/// Look up a declared field in a partial result and in the aggregate.
fn field_pair<'a>(
    decl: &BufferDecl,
    partial: &'a PartialResult,
    results: &'a ResultSet,
) -> Result<(&'a BufferData, &'a AggregateBuffer), EngineError> {
    let value = partial
        .buffers
        .get(&decl.name)
        .ok_or_else(|| EngineError::MergeShapeMismatch {
            field: decl.name.clone(),
            partition: partial.partition,
            expected: decl.extra_shape.clone(),
            actual: vec![],
        })?;
    let aggregate = results
        .get(&decl.name)
        .ok_or_else(|| missing_aggregate(decl))?;
    Ok((value, aggregate))
}

fn missing_aggregate(decl: &BufferDecl) -> EngineError {
    EngineError::configuration(format!(
        "result set has no field {} declared as {}",
        decl.name, decl.kind
    ))
}

/// Check a partial value against the declaration and the aggregate without writing anything.
fn check_field(
    decl: &BufferDecl,
    partial: &BufferData,
    partition: usize,
    partition_len: usize,
    aggregate: &AggregateBuffer,
) -> Result<(), EngineError> {
    let expected = decl.partial_shape(partition_len);
    // A dtype disagreement is reported as a mismatch as well; both are UDF defects.
    if partial.shape() != expected.as_slice() || partial.dtype() != decl.dtype {
        return Err(EngineError::MergeShapeMismatch {
            field: decl.name.clone(),
            partition,
            expected,
            actual: partial.shape().to_vec(),
        });
    }
    match (decl.kind, aggregate) {
        (MergeKind::Sum | MergeKind::ReplaceLast, AggregateBuffer::Dense(data))
            if data.dtype() == decl.dtype =>
        {
            Ok(())
        }
        (MergeKind::PerPartition, AggregateBuffer::PerPartition(_)) => Ok(()),
        _ => Err(missing_aggregate(decl)),
    }
}

/// Write a checked partial value into the aggregate.
fn apply(
    decl: &BufferDecl,
    partial: &BufferData,
    partition: usize,
    range: &Range<usize>,
    aggregate: &mut AggregateBuffer,
) -> Result<(), EngineError> {
    match (decl.kind, aggregate) {
        (MergeKind::Sum, AggregateBuffer::Dense(data)) => {
            add_assign(decl, partition, data, partial)
        }
        (MergeKind::ReplaceLast, AggregateBuffer::Dense(data)) => {
            assign_rows(decl, partition, data, partial, range)
        }
        (MergeKind::PerPartition, AggregateBuffer::PerPartition(map)) => {
            map.insert(partition, partial.clone());
            Ok(())
        }
        _ => Err(missing_aggregate(decl)),
    }
}

fn dtype_mismatch(decl: &BufferDecl, partition: usize, partial: &BufferData) -> EngineError {
    EngineError::MergeShapeMismatch {
        field: decl.name.clone(),
        partition,
        expected: decl.extra_shape.clone(),
        actual: partial.shape().to_vec(),
    }
}

/// Element-wise `aggregate += partial`.
fn add_assign(
    decl: &BufferDecl,
    partition: usize,
    aggregate: &mut BufferData,
    partial: &BufferData,
) -> Result<(), EngineError> {
    match (aggregate, partial) {
        (BufferData::Int64(aggregate), BufferData::Int64(partial)) => *aggregate += partial,
        (BufferData::Float32(aggregate), BufferData::Float32(partial)) => *aggregate += partial,
        (BufferData::Float64(aggregate), BufferData::Float64(partial)) => *aggregate += partial,
        (_, partial) => return Err(dtype_mismatch(decl, partition, partial)),
    }
    Ok(())
}

/// Write `partial` into rows `range` of `aggregate`.
fn assign_rows(
    decl: &BufferDecl,
    partition: usize,
    aggregate: &mut BufferData,
    partial: &BufferData,
    range: &Range<usize>,
) -> Result<(), EngineError> {
    let rows = Slice::from(range.clone());
    match (aggregate, partial) {
        (BufferData::Int64(aggregate), BufferData::Int64(partial)) => {
            aggregate.slice_axis_mut(Axis(0), rows).assign(partial)
        }
        (BufferData::Float32(aggregate), BufferData::Float32(partial)) => {
            aggregate.slice_axis_mut(Axis(0), rows).assign(partial)
        }
        (BufferData::Float64(aggregate), BufferData::Float64(partial)) => {
            aggregate.slice_axis_mut(Axis(0), rows).assign(partial)
        }
        (_, partial) => return Err(dtype_mismatch(decl, partition, partial)),
    }
    Ok(())
}
