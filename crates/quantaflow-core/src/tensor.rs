//! Minimal N-dimensional tensor storage.
//!
//! This is deliberately the consumed surface of the engine and nothing more:
//! construction from shape plus flat data, shape/data access, and the handful
//! of bulk operations in [`crate::ops`]. CPU only.

use crate::arith::Arithmetic;
use crate::{Result, Shape, TensorError};
use ndarray::{ArrayD, IxDyn};

/// Core tensor structure holding data and its shape.
#[derive(Debug, Clone)]
pub struct Tensor<T> {
    storage: ArrayD<T>,
    shape: Shape,
}

impl<T: Arithmetic> Tensor<T> {
    /// Create a tensor filled with the additive identity.
    pub fn zeros(dims: &[usize]) -> Self {
        Self::filled(T::zero(), dims)
    }

    /// Create a tensor filled with the multiplicative identity.
    pub fn ones(dims: &[usize]) -> Self {
        Self::filled(T::one(), dims)
    }

    pub fn filled(value: T, dims: &[usize]) -> Self {
        Self {
            storage: ArrayD::from_elem(IxDyn(dims), value),
            shape: Shape::from_slice(dims),
        }
    }

    /// Build a tensor from flat row-major data.
    pub fn from_vec(data: Vec<T>, dims: &[usize]) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(TensorError::shape_mismatch(
                "from_vec",
                format!("{expected} elements for shape {:?}", dims),
                format!("{} elements", data.len()),
            ));
        }
        let storage = ArrayD::from_shape_vec(IxDyn(dims), data).map_err(|e| {
            TensorError::invalid_argument("from_vec", format!("invalid shape: {e}"))
        })?;
        Ok(Self {
            shape: Shape::from_slice(dims),
            storage,
        })
    }

    /// Wrap an existing array.
    pub fn from_array(array: ArrayD<T>) -> Self {
        let shape = Shape::from_slice(array.shape());
        Self {
            storage: array,
            shape,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat row-major view of the data, if contiguous.
    pub fn as_slice(&self) -> Option<&[T]> {
        self.storage.as_slice()
    }

    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.storage.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.storage.iter()
    }

    /// Address of the first element; distinguishes tensor instances that are
    /// numerically equal but separately allocated.
    pub fn data_ptr(&self) -> *const T {
        self.storage.as_ptr()
    }

    pub(crate) fn array(&self) -> &ArrayD<T> {
        &self.storage
    }
}
