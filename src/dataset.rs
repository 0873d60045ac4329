//! Datasets: the source of frames that partitions read from.
//!
//! A dataset has a navigation shape (the scan positions) and a signal shape (the detector frame).
//! Navigation positions are addressed by their row-major linear index, and reads are keyed by a
//! contiguous range of those indices.

use crate::array;
use crate::error::EngineError;
use crate::models::{DType, RawDatasetSpec};
use crate::types::ByteOrder;

use ndarray::{ArrayD, Axis, Dimension, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::ops::Range;
use std::path::PathBuf;

/// Frames of a contiguous range of navigation positions, shaped `(positions, signal...)`.
pub type PartitionData = ArrayD<f32>;

/// Navigation and signal shape of a dataset.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DatasetShape {
    /// Shape of the navigation axes
    pub nav: Vec<usize>,
    /// Shape of each frame
    pub sig: Vec<usize>,
}

impl DatasetShape {
    /// Return a new DatasetShape.
    pub fn new(nav: &[usize], sig: &[usize]) -> Self {
        DatasetShape {
            nav: nav.to_vec(),
            sig: sig.to_vec(),
        }
    }

    /// Total number of navigation positions.
    pub fn nav_size(&self) -> usize {
        self.nav.iter().product()
    }

    /// Number of samples in one frame.
    pub fn sig_size(&self) -> usize {
        self.sig.iter().product()
    }

    /// Size in bytes of the whole dataset with `sample_size` bytes per sample.
    ///
    /// Returns `None` if the size does not fit in a `usize`.
    pub fn checked_bytes(&self, sample_size: usize) -> Option<usize> {
        self.nav
            .iter()
            .chain(self.sig.iter())
            .try_fold(sample_size, |size, length| size.checked_mul(*length))
    }

    /// Shape of the frames of `positions` navigation positions.
    pub fn frames_shape(&self, positions: usize) -> Vec<usize> {
        std::iter::once(positions)
            .chain(self.sig.iter().copied())
            .collect()
    }
}

/// Dataset collaborator.
///
/// Implementations must be immutable for the duration of a run and safe to read concurrently.
pub trait Dataset: Send + Sync + std::fmt::Debug {
    /// Shape of the dataset.
    fn shape(&self) -> &DatasetShape;

    /// Data type of the stored samples.
    fn dtype(&self) -> DType;

    /// Size in bytes of one navigation position in storage.
    fn bytes_per_position(&self) -> usize {
        self.shape().sig_size() * self.dtype().size_of()
    }

    /// Read the frames of a range of navigation positions.
    ///
    /// Returns an array shaped `(range.len(), signal...)`.
    fn read(&self, range: Range<usize>) -> std::io::Result<PartitionData>;

    /// Names of the workers that can read a range, or `None` if any worker can.
    fn locations(&self, _range: &Range<usize>) -> Option<Vec<String>> {
        None
    }
}

/// Check that a navigation range lies within a dataset.
fn check_range(shape: &DatasetShape, range: &Range<usize>) -> std::io::Result<()> {
    if range.start > range.end || range.end > shape.nav_size() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "navigation range {:?} outside dataset of {} positions",
                range,
                shape.nav_size()
            ),
        ));
    }
    Ok(())
}

/// A dataset held in memory.
#[derive(Debug)]
pub struct MemoryDataset {
    shape: DatasetShape,
    /// Frames shaped `(nav_size, signal...)`
    data: ArrayD<f32>,
}

impl MemoryDataset {
    /// Create a dataset from an array shaped `(nav..., signal...)` or `(nav_size, signal...)`.
    ///
    /// # Arguments
    ///
    /// * `nav`: Navigation shape
    /// * `sig`: Signal shape
    /// * `data`: Frame data
    pub fn new(nav: &[usize], sig: &[usize], data: ArrayD<f32>) -> Result<Self, EngineError> {
        let shape = DatasetShape::new(nav, sig);
        let data = data
            .into_shape(IxDyn(&shape.frames_shape(shape.nav_size())))
            .map_err(EngineError::ShapeInvalid)?;
        Ok(MemoryDataset { shape, data })
    }

    /// Create a dataset whose frames are produced by a function of the linear navigation index
    /// and the linear signal index.
    pub fn from_fn<F>(nav: &[usize], sig: &[usize], f: F) -> Self
    where
        F: Fn(usize, usize) -> f32,
    {
        let shape = DatasetShape::new(nav, sig);
        let sig_size = shape.sig_size();
        let frames_shape = shape.frames_shape(shape.nav_size());
        let data = ArrayD::from_shape_fn(IxDyn(&frames_shape), |index| {
            let position = index[0];
            let sample = (1..index.ndim())
                .fold(0, |offset, axis| offset * frames_shape[axis] + index[axis]);
            debug_assert!(sample < sig_size.max(1));
            f(position, sample)
        });
        MemoryDataset { shape, data }
    }
}

impl Dataset for MemoryDataset {
    fn shape(&self) -> &DatasetShape {
        &self.shape
    }

    fn dtype(&self) -> DType {
        DType::Float32
    }

    fn read(&self, range: Range<usize>) -> std::io::Result<PartitionData> {
        check_range(&self.shape, &range)?;
        Ok(self
            .data
            .slice_axis(Axis(0), Slice::from(range))
            .to_owned())
    }
}

/// A dataset backed by a raw binary file of contiguous frames.
#[derive(Debug)]
pub struct RawFileDataset {
    path: PathBuf,
    dtype: DType,
    byte_order: ByteOrder,
    offset: u64,
    shape: DatasetShape,
}

impl RawFileDataset {
    /// Open a raw file dataset, checking that the file holds every frame.
    ///
    /// # Arguments
    ///
    /// * `spec`: Description of the raw file
    pub fn open(spec: &RawDatasetSpec) -> Result<Self, EngineError> {
        let dataset = RawFileDataset {
            path: PathBuf::from(&spec.path),
            dtype: spec.dtype,
            byte_order: spec.byte_order.unwrap_or_default(),
            offset: spec.offset.unwrap_or(0),
            shape: DatasetShape::new(&spec.nav_shape, &spec.sig_shape),
        };
        let required = dataset
            .shape
            .checked_bytes(dataset.dtype.size_of())
            .and_then(|bytes| u64::try_from(bytes).ok())
            .and_then(|bytes| bytes.checked_add(dataset.offset))
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "dataset shape {:?} x {:?} is too large",
                    dataset.shape.nav, dataset.shape.sig
                ))
            })?;
        let file_size = std::fs::metadata(&dataset.path)
            .map_err(|err| {
                EngineError::configuration(format!(
                    "cannot open dataset {}: {}",
                    dataset.path.display(),
                    err
                ))
            })?
            .len();
        if file_size < required {
            return Err(EngineError::configuration(format!(
                "dataset {} holds {} bytes but {} are required",
                dataset.path.display(),
                file_size,
                required
            )));
        }
        Ok(dataset)
    }
}

impl Dataset for RawFileDataset {
    fn shape(&self) -> &DatasetShape {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    #[tracing::instrument(level = "DEBUG", skip(self), fields(path = %self.path.display()))]
    fn read(&self, range: Range<usize>) -> std::io::Result<PartitionData> {
        check_range(&self.shape, &range)?;
        let start = u64::try_from(range.start * self.bytes_per_position())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(self.offset + start))?;
        array::decode_frames(
            &mut reader,
            self.dtype,
            self.byte_order,
            &self.shape.frames_shape(range.len()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;
    use ndarray::array;
    use zerocopy::AsBytes;

    #[test]
    fn shape_sizes() {
        let shape = DatasetShape::new(&[4, 5], &[8, 8]);
        assert_eq!(20, shape.nav_size());
        assert_eq!(64, shape.sig_size());
        assert_eq!(vec![3, 8, 8], shape.frames_shape(3));
        assert_eq!(Some(20 * 64 * 2), shape.checked_bytes(2));
        assert_eq!(None, DatasetShape::new(&[1 << 32, 1 << 32], &[1]).checked_bytes(1));
    }

    #[test]
    fn memory_dataset_read() {
        let dataset = MemoryDataset::from_fn(&[2, 3], &[2], |position, sample| {
            (position * 10 + sample) as f32
        });
        assert_eq!(DType::Float32, dataset.dtype());
        assert_eq!(8, dataset.bytes_per_position());
        let frames = dataset.read(2..4).unwrap();
        assert_eq!(array![[20_f32, 21.], [30., 31.]].into_dyn(), frames);
    }

    #[test]
    fn memory_dataset_from_nav_shaped_array() {
        let data = ArrayD::from_shape_fn(IxDyn(&[2, 2, 3]), |index| index[2] as f32);
        let dataset = MemoryDataset::new(&[2, 2], &[3], data).unwrap();
        assert_eq!(vec![3, 3], dataset.read(1..4).unwrap().shape());
    }

    #[test]
    fn memory_dataset_wrong_shape() {
        let data = ArrayD::zeros(IxDyn(&[5, 3]));
        match MemoryDataset::new(&[2, 2], &[3], data).unwrap_err() {
            EngineError::ShapeInvalid(_) => (),
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn memory_dataset_read_out_of_range() {
        let dataset = MemoryDataset::from_fn(&[4], &[1], |_, _| 0.0);
        let err = dataset.read(2..5).unwrap_err();
        assert_eq!(std::io::ErrorKind::InvalidInput, err.kind());
    }

    #[test]
    fn raw_file_dataset_read_with_offset() {
        let data: Vec<u16> = (0..24).collect();
        let mut bytes = vec![0xaa_u8; 4];
        bytes.extend_from_slice(data.as_bytes());
        let file = test_utils::TempFile::new("raw_offset", &bytes);
        let mut spec = test_utils::get_test_dataset_spec(file.path());
        spec.offset = Some(4);
        spec.byte_order = Some(crate::types::byte_order::NATIVE_BYTE_ORDER);
        let dataset = RawFileDataset::open(&spec).unwrap();
        let frames = dataset
            .read(1..3)
            .unwrap()
            .into_dimensionality::<ndarray::Ix3>()
            .unwrap();
        assert_eq!(&[2, 2, 3], frames.shape());
        assert_eq!(6.0, frames[[0, 0, 0]]);
        assert_eq!(17.0, frames[[1, 1, 2]]);
    }

    #[test]
    fn raw_file_dataset_big_endian() {
        let mut bytes = Vec::new();
        for value in 0..24_u16 {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        let file = test_utils::TempFile::new("raw_big_endian", &bytes);
        let mut spec = test_utils::get_test_dataset_spec(file.path());
        spec.byte_order = Some(ByteOrder::Big);
        let dataset = RawFileDataset::open(&spec).unwrap();
        let frames = dataset.read(3..4).unwrap();
        assert_eq!(
            array![[[18_f32, 19., 20.], [21., 22., 23.]]].into_dyn(),
            frames
        );
    }

    #[test]
    fn raw_file_dataset_too_small() {
        let file = test_utils::TempFile::new("raw_too_small", &[0_u8; 10]);
        let spec = test_utils::get_test_dataset_spec(file.path());
        match RawFileDataset::open(&spec).unwrap_err() {
            EngineError::Configuration { reason } => {
                assert!(reason.contains("48 are required"), "{}", reason)
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn raw_file_dataset_shape_overflow() {
        let file = test_utils::TempFile::new("raw_overflow", &[0_u8; 48]);
        let mut spec = test_utils::get_test_dataset_spec(file.path());
        spec.nav_shape = vec![1 << 32, 1 << 32];
        match RawFileDataset::open(&spec).unwrap_err() {
            EngineError::Configuration { reason } => {
                assert!(reason.ends_with("is too large"), "{}", reason)
            }
            err => panic!("unexpected error {:?}", err),
        }
        spec.nav_shape = vec![4];
        spec.offset = Some(u64::MAX);
        assert!(matches!(
            RawFileDataset::open(&spec).unwrap_err(),
            EngineError::Configuration { .. }
        ));
    }

    #[test]
    fn raw_file_dataset_missing() {
        let spec = test_utils::get_test_dataset_spec(std::path::Path::new(
            "/nonexistent/stackmerge/scan.raw",
        ));
        match RawFileDataset::open(&spec).unwrap_err() {
            EngineError::Configuration { reason } => {
                assert!(reason.starts_with("cannot open dataset"), "{}", reason)
            }
            err => panic!("unexpected error {:?}", err),
        }
    }
}
