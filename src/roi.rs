//! Region of interest: a boolean mask over navigation positions.

use crate::dataset::DatasetShape;
use crate::error::EngineError;

use ndarray::{s, Array1, ArrayD, ArrayView1};
use std::ops::Range;

/// Boolean mask with one flag per navigation position, flattened in row-major order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Roi {
    nav_shape: Vec<usize>,
    mask: Array1<bool>,
}

impl Roi {
    /// Return a ROI from a flattened mask.
    ///
    /// # Arguments
    ///
    /// * `nav_shape`: Navigation shape the mask applies to
    /// * `mask`: One flag per navigation position in row-major order
    pub fn new(nav_shape: &[usize], mask: Vec<bool>) -> Result<Self, EngineError> {
        let nav_size = nav_shape.iter().product::<usize>();
        if mask.len() != nav_size {
            return Err(EngineError::configuration(format!(
                "ROI has {} entries but navigation shape {:?} has {} positions",
                mask.len(),
                nav_shape,
                nav_size
            )));
        }
        Ok(Roi {
            nav_shape: nav_shape.to_vec(),
            mask: Array1::from(mask),
        })
    }

    /// Return a ROI from a navigation-shaped mask.
    pub fn from_array(mask: &ArrayD<bool>) -> Self {
        Roi {
            nav_shape: mask.shape().to_vec(),
            mask: mask.iter().copied().collect(),
        }
    }

    /// Navigation shape of the mask.
    pub fn nav_shape(&self) -> &[usize] {
        &self.nav_shape
    }

    /// Flattened mask.
    pub fn mask(&self) -> ArrayView1<'_, bool> {
        self.mask.view()
    }

    /// Number of selected positions.
    pub fn count(&self) -> usize {
        self.mask.iter().filter(|selected| **selected).count()
    }

    /// Check that the ROI has the navigation shape of a dataset.
    pub fn validate(&self, shape: &DatasetShape) -> Result<(), EngineError> {
        if self.nav_shape != shape.nav {
            return Err(EngineError::configuration(format!(
                "ROI shape {:?} does not match navigation shape {:?}",
                self.nav_shape, shape.nav
            )));
        }
        Ok(())
    }

    /// Restrict the ROI to a partition's navigation range.
    ///
    /// The range must lie within the navigation range.
    pub fn slice(&self, range: Range<usize>) -> RoiSlice {
        RoiSlice {
            start: range.start,
            mask: self.mask.slice(s![range]).to_owned(),
        }
    }
}

/// A ROI restricted to one partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoiSlice {
    start: usize,
    mask: Array1<bool>,
}

impl RoiSlice {
    /// Slice selecting every position of a range, used when a run has no ROI.
    pub fn all(range: Range<usize>) -> Self {
        RoiSlice {
            start: range.start,
            mask: Array1::from_elem(range.len(), true),
        }
    }

    /// Global index of the first position.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Mask over the covered positions.
    pub fn mask(&self) -> ArrayView1<'_, bool> {
        self.mask.view()
    }

    /// Whether no position of the slice is selected.
    pub fn is_empty(&self) -> bool {
        !self.mask.iter().any(|selected| *selected)
    }

    /// Number of selected positions.
    pub fn count(&self) -> usize {
        self.mask.iter().filter(|selected| **selected).count()
    }

    /// Whether the position at partition-local index `local` is selected.
    pub fn is_selected(&self, local: usize) -> bool {
        self.mask.get(local).copied().unwrap_or(false)
    }
}
