//! Functions and utilities for decoding raw detector data into [ndarray] frame stacks.

use crate::models::DType;
use crate::types::ByteOrder;

use ndarray::prelude::*;
use std::io::Read;
// Bring trait into scope to use as_bytes_mut method.
use zerocopy::AsBytes;

/// Trait for raw sample types stored in detector data.
pub trait RawElement:
    Clone + Copy + Default + num_traits::ToPrimitive + zerocopy::AsBytes + zerocopy::FromBytes
{
}

/// Blanket implementation of RawElement.
impl<T> RawElement for T where
    T: Clone + Copy + Default + num_traits::ToPrimitive + zerocopy::AsBytes + zerocopy::FromBytes
{
}

/// Reverse the byte order of each element in a slice in place.
pub fn reverse_byte_order<T: RawElement>(values: &mut [T]) {
    let size = std::mem::size_of::<T>();
    if size > 1 {
        values
            .as_bytes_mut()
            .chunks_exact_mut(size)
            .for_each(|element| element.reverse());
    }
}

/// Read `count` samples of type `T` and convert them to `f32`.
///
/// The samples are read directly into a correctly aligned `Vec<T>`, so no unaligned access takes
/// place.
///
/// # Arguments
///
/// * `reader`: Source of the raw bytes
/// * `count`: Number of samples to read
/// * `byte_order`: Byte order of the raw samples
fn read_samples<T: RawElement, R: Read>(
    reader: &mut R,
    count: usize,
    byte_order: ByteOrder,
) -> std::io::Result<Vec<f32>> {
    let mut values = vec![T::default(); count];
    reader.read_exact(values.as_bytes_mut())?;
    if !byte_order.is_native() {
        reverse_byte_order(&mut values);
    }
    Ok(values
        .iter()
        .map(|value| value.to_f32().unwrap_or(f32::NAN))
        .collect())
}

/// Decode a block of frames from a reader into an `f32` array of the given shape.
///
/// The shape is typically `(positions, signal...)`. The number of samples read is the product of
/// the shape.
///
/// # Arguments
///
/// * `reader`: Source of the raw bytes, positioned at the first sample
/// * `dtype`: Data type of the raw samples
/// * `byte_order`: Byte order of the raw samples
/// * `shape`: Shape of the decoded array
pub fn decode_frames<R: Read>(
    reader: &mut R,
    dtype: DType,
    byte_order: ByteOrder,
    shape: &[usize],
) -> std::io::Result<ArrayD<f32>> {
    let count = shape.iter().product::<usize>();
    // Convert runtime data type into concrete types.
    let samples = match dtype {
        DType::Uint8 => read_samples::<u8, _>(reader, count, byte_order)?,
        DType::Uint16 => read_samples::<u16, _>(reader, count, byte_order)?,
        DType::Uint32 => read_samples::<u32, _>(reader, count, byte_order)?,
        DType::Uint64 => read_samples::<u64, _>(reader, count, byte_order)?,
        DType::Int32 => read_samples::<i32, _>(reader, count, byte_order)?,
        DType::Int64 => read_samples::<i64, _>(reader, count, byte_order)?,
        DType::Float32 => read_samples::<f32, _>(reader, count, byte_order)?,
        DType::Float64 => read_samples::<f64, _>(reader, count, byte_order)?,
    };
    ArrayD::from_shape_vec(IxDyn(shape), samples)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::byte_order::{NATIVE_BYTE_ORDER, NON_NATIVE_BYTE_ORDER};
    use std::io::Cursor;

    #[test]
    fn reverse_byte_order_u8_is_noop() {
        let mut data = [1_u8, 2, 3];
        reverse_byte_order(&mut data);
        assert_eq!([1, 2, 3], data);
    }

    #[test]
    fn reverse_byte_order_u32() {
        let mut data = [0x01020304_u32, 0x05060708_u32];
        reverse_byte_order(&mut data);
        assert_eq!([0x04030201_u32, 0x08070605_u32], data);
    }

    #[test]
    fn reverse_byte_order_f64() {
        let mut data = [42.0_f64];
        reverse_byte_order(&mut data);
        reverse_byte_order(&mut data);
        assert_eq!([42.0], data);
    }

    #[test]
    fn decode_frames_u16_native() {
        let data: Vec<u16> = (0..8).collect();
        let mut cursor = Cursor::new(data.as_bytes().to_vec());
        let frames = decode_frames(&mut cursor, DType::Uint16, NATIVE_BYTE_ORDER, &[2, 2, 2]).unwrap();
        assert_eq!(
            array![[[0_f32, 1.], [2., 3.]], [[4., 5.], [6., 7.]]].into_dyn(),
            frames
        );
    }

    #[test]
    fn decode_frames_u16_non_native() {
        let mut data: Vec<u16> = vec![1, 256];
        reverse_byte_order(&mut data);
        let mut cursor = Cursor::new(data.as_bytes().to_vec());
        let frames = decode_frames(&mut cursor, DType::Uint16, NON_NATIVE_BYTE_ORDER, &[1, 2]).unwrap();
        assert_eq!(array![[1_f32, 256.]].into_dyn(), frames);
    }

    #[test]
    fn decode_frames_big_endian_i32() {
        let bytes = vec![0xff, 0xff, 0xff, 0xfe, 0x00, 0x00, 0x00, 0x03];
        let mut cursor = Cursor::new(bytes);
        let frames = decode_frames(&mut cursor, DType::Int32, ByteOrder::Big, &[2, 1]).unwrap();
        assert_eq!(array![[-2_f32], [3.]].into_dyn(), frames);
    }

    #[test]
    fn decode_frames_little_endian_f64() {
        let data = [1.5_f64, -0.25];
        let mut bytes = Vec::new();
        for value in data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let mut cursor = Cursor::new(bytes);
        let frames = decode_frames(&mut cursor, DType::Float64, ByteOrder::Little, &[1, 2]).unwrap();
        assert_eq!(array![[1.5_f32, -0.25]].into_dyn(), frames);
    }

    #[test]
    fn decode_frames_short_read() {
        let mut cursor = Cursor::new(vec![0_u8; 3]);
        let err = decode_frames(&mut cursor, DType::Uint16, ByteOrder::Little, &[2]).unwrap_err();
        assert_eq!(std::io::ErrorKind::UnexpectedEof, err.kind());
    }
}
