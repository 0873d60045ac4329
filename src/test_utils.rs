use crate::buffers::{BufferDecl, PartialResult};
use crate::cancel::CancelToken;
use crate::dataset::{Dataset, DatasetShape, MemoryDataset, PartitionData};
use crate::error::EngineError;
use crate::models::*;
use crate::partition::{self, PartitionHint};
use crate::roi::RoiSlice;
use crate::task::{RunId, Task};
use crate::udf::{FramePosition, Udf, UdfMeta};
use crate::udfs;

use ndarray::ArrayViewD;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Create a RunRequest object with only required fields set.
pub(crate) fn get_test_run_request() -> RunRequest {
    RunRequest {
        run_id: None,
        dataset: RawDatasetSpec {
            path: "/data/scan.raw".to_string(),
            dtype: DType::Uint16,
            byte_order: None,
            offset: None,
            nav_shape: vec![4, 5],
            sig_shape: vec![8, 8],
        },
        roi: None,
        partitions: None,
    }
}

/// Create a RawDatasetSpec for a file of 4 frames of 2x3 `u16` samples.
pub(crate) fn get_test_dataset_spec(path: &Path) -> RawDatasetSpec {
    RawDatasetSpec {
        path: path.to_string_lossy().into_owned(),
        dtype: DType::Uint16,
        byte_order: None,
        offset: None,
        nav_shape: vec![4],
        sig_shape: vec![2, 3],
    }
}

/// A file in the temporary directory, removed on drop.
pub(crate) struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub(crate) fn new(name: &str, contents: &[u8]) -> Self {
        let path = std::env::temp_dir().join(format!("stackmerge-{}-{}", name, RunId::new_v4()));
        std::fs::write(&path, contents).unwrap();
        TempFile { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// In-memory dataset whose frames hold their navigation position in every sample.
pub(crate) fn memory_dataset(nav: &[usize], sig: &[usize]) -> Arc<dyn Dataset> {
    Arc::new(MemoryDataset::from_fn(nav, sig, |position, _| position as f32))
}

/// First attempts of the `count` UDF over a dataset split into `partitions` partitions.
pub(crate) fn tasks_for(dataset: Arc<dyn Dataset>, partitions: usize) -> Vec<Task> {
    let udf = udfs::by_name("count").unwrap();
    let meta = UdfMeta {
        shape: dataset.shape().clone(),
        dtype: dataset.dtype(),
    };
    let decls = Arc::new(udf.result_buffers(&meta));
    partition::partition(&dataset, PartitionHint::Count(partitions))
        .unwrap()
        .into_iter()
        .map(|partition| {
            let roi = RoiSlice::all(partition.range.clone());
            Task::new(RunId::nil(), partition, udf.clone(), decls.clone(), roi)
        })
        .collect()
}

/// First attempts of the `count` UDF over an in-memory dataset with one-sample frames.
pub(crate) fn count_tasks(nav: &[usize], partitions: usize) -> Vec<Task> {
    tasks_for(memory_dataset(nav, &[1]), partitions)
}

/// In-memory dataset whose reads covering one position fail a number of times.
#[derive(Debug)]
pub(crate) struct FlakyDataset {
    inner: MemoryDataset,
    position: usize,
    failures: AtomicU32,
    reads: Mutex<Vec<Range<usize>>>,
}

impl FlakyDataset {
    /// Return a dataset whose first `failures` reads covering `position` fail.
    pub(crate) fn new(nav: &[usize], sig: &[usize], position: usize, failures: u32) -> Arc<Self> {
        Arc::new(FlakyDataset {
            inner: MemoryDataset::from_fn(nav, sig, |position, _| position as f32),
            position,
            failures: AtomicU32::new(failures),
            reads: Mutex::new(Vec::new()),
        })
    }

    /// Number of reads, failed or not, covering `position`.
    pub(crate) fn reads_of(&self, position: usize) -> usize {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|range| range.contains(&position))
            .count()
    }
}

impl Dataset for FlakyDataset {
    fn shape(&self) -> &DatasetShape {
        self.inner.shape()
    }

    fn dtype(&self) -> DType {
        self.inner.dtype()
    }

    fn read(&self, range: Range<usize>) -> std::io::Result<PartitionData> {
        self.reads.lock().unwrap().push(range.clone());
        if range.contains(&self.position)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "flaky read",
            ));
        }
        self.inner.read(range)
    }
}

/// In-memory dataset whose partitions can only be read on the given workers.
#[derive(Debug)]
pub(crate) struct PinnedDataset {
    inner: MemoryDataset,
    locations: Option<Vec<String>>,
}

impl PinnedDataset {
    pub(crate) fn new(nav: &[usize], sig: &[usize], locations: Option<&[&str]>) -> Arc<Self> {
        Arc::new(PinnedDataset {
            inner: MemoryDataset::from_fn(nav, sig, |position, _| position as f32),
            locations: locations
                .map(|workers| workers.iter().map(|worker| worker.to_string()).collect()),
        })
    }
}

impl Dataset for PinnedDataset {
    fn shape(&self) -> &DatasetShape {
        self.inner.shape()
    }

    fn dtype(&self) -> DType {
        self.inner.dtype()
    }

    fn read(&self, range: Range<usize>) -> std::io::Result<PartitionData> {
        self.inner.read(range)
    }

    fn locations(&self, _range: &Range<usize>) -> Option<Vec<String>> {
        self.locations.clone()
    }
}

/// Wraps a UDF and raises a cancel token once it has processed `after` partitions.
#[derive(Debug)]
pub(crate) struct CancelAfter {
    inner: Arc<dyn Udf>,
    after: usize,
    processed: AtomicUsize,
    token: CancelToken,
}

impl CancelAfter {
    pub(crate) fn new(name: &str, after: usize, token: CancelToken) -> Self {
        Self::wrap(udfs::by_name(name).unwrap(), after, token)
    }

    pub(crate) fn wrap(inner: Arc<dyn Udf>, after: usize, token: CancelToken) -> Self {
        CancelAfter {
            inner,
            after,
            processed: AtomicUsize::new(0),
            token,
        }
    }

    /// Number of partitions processed so far.
    pub(crate) fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}

impl Udf for CancelAfter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn result_buffers(&self, meta: &UdfMeta) -> Vec<BufferDecl> {
        self.inner.result_buffers(meta)
    }

    fn process_frame(
        &self,
        frame: ArrayViewD<f32>,
        position: FramePosition,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError> {
        self.inner.process_frame(frame, position, buffers)
    }

    fn process_partition(
        &self,
        data: &PartitionData,
        roi: &RoiSlice,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError> {
        self.inner.process_partition(data, roi, buffers)?;
        if self.processed.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(())
    }
}
