//! Binary encoding of partial results crossing a worker boundary.
//!
//! A message is a little-endian `u32` header length, a JSON header describing the partition and
//! each field's name, data type and shape, then the raw elements of each field in header order
//! and native byte order. Raw elements survive the round trip exactly, including NaN and
//! infinities which JSON cannot represent.

use crate::buffers::{BufferDType, BufferData, PartialResult};
use crate::error::EngineError;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
// Bring traits into scope to use as_bytes and as_bytes_mut methods.
use zerocopy::{AsBytes, FromBytes};

#[derive(Debug, Deserialize, Serialize)]
struct Header {
    partition: usize,
    fields: Vec<FieldHeader>,
}

#[derive(Debug, Deserialize, Serialize)]
struct FieldHeader {
    name: String,
    dtype: BufferDType,
    shape: Vec<usize>,
}

/// Encode a partial result.
pub fn encode(partial: &PartialResult) -> Result<Bytes, EngineError> {
    let header = Header {
        partition: partial.partition,
        fields: partial
            .buffers
            .iter()
            .map(|(name, buffer)| FieldHeader {
                name: name.clone(),
                dtype: buffer.dtype(),
                shape: buffer.shape().to_vec(),
            })
            .collect(),
    };
    let header = serde_json::to_vec(&header)
        .map_err(|err| EngineError::configuration(format!("cannot encode header: {}", err)))?;
    let mut message = BytesMut::new();
    message.put_u32_le(header.len().try_into()?);
    message.put_slice(&header);
    for buffer in partial.buffers.values() {
        match buffer {
            BufferData::Int64(array) => put_array(&mut message, array),
            BufferData::Float32(array) => put_array(&mut message, array),
            BufferData::Float64(array) => put_array(&mut message, array),
        }
    }
    Ok(message.freeze())
}

fn put_array<T: AsBytes + Copy>(message: &mut BytesMut, array: &ArrayD<T>) {
    match array.as_slice() {
        Some(values) => message.put_slice(values.as_bytes()),
        None => {
            let values: Vec<T> = array.iter().copied().collect();
            message.put_slice(values.as_bytes());
        }
    }
}

/// Decode a partial result.
pub fn decode(mut message: Bytes) -> Result<PartialResult, EngineError> {
    if message.remaining() < 4 {
        return Err(EngineError::FromBytes {
            type_name: "message header length",
        });
    }
    let header_len = usize::try_from(message.get_u32_le())?;
    if message.remaining() < header_len {
        return Err(EngineError::FromBytes {
            type_name: "message header",
        });
    }
    let header: Header =
        serde_json::from_slice(&message.split_to(header_len)).map_err(|_| {
            EngineError::FromBytes {
                type_name: "message header",
            }
        })?;
    let mut buffers = BTreeMap::new();
    for field in header.fields {
        let buffer = match field.dtype {
            BufferDType::Int64 => BufferData::Int64(take_array(&mut message, &field.shape)?),
            BufferDType::Float32 => BufferData::Float32(take_array(&mut message, &field.shape)?),
            BufferDType::Float64 => BufferData::Float64(take_array(&mut message, &field.shape)?),
        };
        buffers.insert(field.name, buffer);
    }
    if message.has_remaining() {
        return Err(EngineError::FromBytes {
            type_name: "partial result",
        });
    }
    Ok(PartialResult {
        partition: header.partition,
        buffers,
    })
}

fn take_array<T: AsBytes + FromBytes + Copy + Default>(
    message: &mut Bytes,
    shape: &[usize],
) -> Result<ArrayD<T>, EngineError> {
    let error = || EngineError::FromBytes {
        type_name: std::any::type_name::<T>(),
    };
    let count = shape
        .iter()
        .try_fold(1_usize, |count, length| count.checked_mul(*length))
        .ok_or_else(error)?;
    let len = count
        .checked_mul(std::mem::size_of::<T>())
        .ok_or_else(error)?;
    if message.remaining() < len {
        return Err(error());
    }
    let mut values = vec![T::default(); count];
    // Copy into an aligned vector rather than reinterpreting the message in place.
    values
        .as_bytes_mut()
        .copy_from_slice(&message.split_to(len));
    Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?)
}
