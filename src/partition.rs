//! Partitioning of a dataset's navigation range.
//!
//! Partitions are contiguous, non-overlapping ranges of linear navigation indices. Together they
//! cover the whole navigation range in ascending order without gaps. Partition sizes are balanced:
//! they differ by at most one position, with the larger partitions first.

use crate::dataset::{Dataset, PartitionData};
use crate::error::EngineError;

use std::ops::Range;
use std::sync::Arc;

/// Target size in bytes of a partition when the size is chosen automatically.
pub const DEFAULT_PARTITION_BYTES: usize = 512 * 1024 * 1024;

/// Sizing hint for the partitioner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionHint {
    /// Desired number of partitions, clamped to the number of navigation positions
    Count(usize),
    /// Maximum size of a partition in bytes; a partition always holds at least one position
    MaxBytes(usize),
    /// [DEFAULT_PARTITION_BYTES] per partition, and at least one partition per worker
    Auto { workers: usize },
}

/// A contiguous range of navigation positions of a dataset.
#[derive(Clone, Debug)]
pub struct Partition {
    /// Index of the partition in the ordered partition sequence
    pub id: usize,
    /// Navigation range covered
    pub range: Range<usize>,
    /// Workers the partition must run on, if restricted
    pub locations: Option<Vec<String>>,
    dataset: Arc<dyn Dataset>,
    prefetched: Option<Arc<PartitionData>>,
}

impl Partition {
    /// Return a new Partition.
    pub fn new(id: usize, range: Range<usize>, dataset: Arc<dyn Dataset>) -> Self {
        Partition {
            id,
            range,
            locations: None,
            dataset,
            prefetched: None,
        }
    }

    /// Restrict the partition to a set of workers.
    pub fn with_locations(mut self, locations: Option<Vec<String>>) -> Self {
        self.locations = locations;
        self
    }

    /// Attach frames that were read ahead of time.
    ///
    /// The frames must have the shape `(len, signal...)` of this partition.
    pub fn with_prefetched(mut self, data: PartitionData) -> Self {
        self.prefetched = Some(Arc::new(data));
        self
    }

    /// Number of navigation positions.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the partition covers no positions.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Size in bytes of the decoded frames of the partition.
    pub fn bytes(&self) -> usize {
        self.len()
            .saturating_mul(self.dataset.shape().sig_size())
            .saturating_mul(std::mem::size_of::<f32>())
    }

    /// Read the frames of the partition, or return the prefetched frames.
    pub fn read(&self) -> Result<Arc<PartitionData>, EngineError> {
        if let Some(data) = &self.prefetched {
            return Ok(data.clone());
        }
        self.dataset
            .read(self.range.clone())
            .map(Arc::new)
            .map_err(|source| EngineError::PartitionRead {
                partition: self.id,
                source,
            })
    }
}

/// Compute balanced partition ranges.
///
/// Pure; performs no I/O.
///
/// # Arguments
///
/// * `nav_size`: Number of navigation positions
/// * `bytes_per_position`: Size in bytes of one navigation position
/// * `hint`: Sizing hint
pub fn partition_ranges(
    nav_size: usize,
    bytes_per_position: usize,
    hint: PartitionHint,
) -> Result<Vec<Range<usize>>, EngineError> {
    if nav_size == 0 {
        return Err(EngineError::configuration("navigation extent is zero"));
    }
    let count = match hint {
        PartitionHint::Count(0)
        | PartitionHint::MaxBytes(0)
        | PartitionHint::Auto { workers: 0 } => {
            return Err(EngineError::configuration(format!(
                "partition hint {:?} must be positive",
                hint
            )))
        }
        PartitionHint::Count(count) => count,
        PartitionHint::MaxBytes(max_bytes) => {
            count_for_bytes(nav_size, bytes_per_position, max_bytes)
        }
        PartitionHint::Auto { workers } => std::cmp::max(
            count_for_bytes(nav_size, bytes_per_position, DEFAULT_PARTITION_BYTES),
            workers,
        ),
    };
    let count = count.min(nav_size);
    let base = nav_size / count;
    let remainder = nav_size % count;
    let mut start = 0;
    Ok((0..count)
        .map(|index| {
            let len = if index < remainder { base + 1 } else { base };
            let range = start..start + len;
            start += len;
            range
        })
        .collect())
}

/// Smallest partition count such that no partition exceeds `max_bytes`.
fn count_for_bytes(nav_size: usize, bytes_per_position: usize, max_bytes: usize) -> usize {
    let positions_per_partition = match bytes_per_position {
        0 => nav_size,
        bytes => std::cmp::max(1, max_bytes / bytes),
    };
    nav_size.div_ceil(positions_per_partition)
}

/// Split a dataset into partitions.
///
/// # Arguments
///
/// * `dataset`: Dataset to partition
/// * `hint`: Sizing hint
#[tracing::instrument(level = "DEBUG", skip(dataset))]
pub fn partition(
    dataset: &Arc<dyn Dataset>,
    hint: PartitionHint,
) -> Result<Vec<Partition>, EngineError> {
    let ranges = partition_ranges(
        dataset.shape().nav_size(),
        dataset.bytes_per_position(),
        hint,
    )?;
    tracing::debug!("{} partitions", ranges.len());
    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(id, range)| {
            let locations = dataset.locations(&range);
            Partition::new(id, range, dataset.clone()).with_locations(locations)
        })
        .collect())
}
