//! Built-in UDFs.
//!
//! Each UDF is implemented as a struct that implements the [Udf](crate::udf::Udf) trait.

use crate::buffers::{BufferDType, BufferDecl, PartialResult};
use crate::error::EngineError;
use crate::udf::{FramePosition, Udf, UdfMeta};

use ndarray::{ArrayViewD, Zip};
use ndarray_stats::QuantileExt;
use std::sync::Arc;

/// Names of the built-in UDFs.
pub const NAMES: [&str; 4] = ["count", "sum", "sum_sig", "partition_max"];

/// Return a built-in UDF by name.
pub fn by_name(name: &str) -> Result<Arc<dyn Udf>, EngineError> {
    match name {
        "count" => Ok(Arc::new(Count {})),
        "sum" => Ok(Arc::new(Sum {})),
        "sum_sig" => Ok(Arc::new(SumSig {})),
        "partition_max" => Ok(Arc::new(PartitionMax {})),
        _ => Err(EngineError::UnsupportedUdf {
            name: name.to_string(),
        }),
    }
}

/// Count the processed navigation positions.
#[derive(Debug)]
pub struct Count {}

impl Udf for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn result_buffers(&self, _meta: &UdfMeta) -> Vec<BufferDecl> {
        vec![BufferDecl::sum("count", BufferDType::Int64, &[1])]
    }

    fn process_frame(
        &self,
        _frame: ArrayViewD<f32>,
        _position: FramePosition,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError> {
        buffers
            .field_mut::<i64>("count")?
            .map_inplace(|count| *count += 1);
        Ok(())
    }
}

/// Sum of the processed frames.
#[derive(Debug)]
pub struct Sum {}

impl Udf for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn result_buffers(&self, meta: &UdfMeta) -> Vec<BufferDecl> {
        vec![BufferDecl::sum(
            "intensity",
            BufferDType::Float64,
            &meta.shape.sig,
        )]
    }

    fn process_frame(
        &self,
        frame: ArrayViewD<f32>,
        _position: FramePosition,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError> {
        let mut intensity = buffers.field_mut::<f64>("intensity")?;
        if intensity.shape() != frame.shape() {
            return Err(EngineError::configuration(format!(
                "frame shape {:?} does not match declared signal shape {:?}",
                frame.shape(),
                intensity.shape()
            )));
        }
        Zip::from(&mut intensity)
            .and(&frame)
            .for_each(|total, value| *total += f64::from(*value));
        Ok(())
    }
}

/// Sum over the signal axes of each frame, one value per navigation position.
#[derive(Debug)]
pub struct SumSig {}

impl Udf for SumSig {
    fn name(&self) -> &str {
        "sum_sig"
    }

    fn result_buffers(&self, _meta: &UdfMeta) -> Vec<BufferDecl> {
        vec![BufferDecl::replace_last("intensity", BufferDType::Float64, &[])]
    }

    fn process_frame(
        &self,
        frame: ArrayViewD<f32>,
        position: FramePosition,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError> {
        let mut intensity = buffers.field_mut::<f64>("intensity")?;
        intensity[[position.local].as_slice()] = frame.iter().map(|value| f64::from(*value)).sum();
        Ok(())
    }
}

/// Maximum of each frame, kept per partition.
#[derive(Debug)]
pub struct PartitionMax {}

impl Udf for PartitionMax {
    fn name(&self) -> &str {
        "partition_max"
    }

    fn result_buffers(&self, _meta: &UdfMeta) -> Vec<BufferDecl> {
        vec![BufferDecl::per_partition("max", BufferDType::Float32, &[])]
    }

    fn process_frame(
        &self,
        frame: ArrayViewD<f32>,
        position: FramePosition,
        buffers: &mut PartialResult,
    ) -> Result<(), EngineError> {
        // Empty frames and NaN comparisons have no maximum.
        let max = frame.max().copied().unwrap_or(f32::NAN);
        buffers.field_mut::<f32>("max")?[[position.local].as_slice()] = max;
        Ok(())
    }
}
