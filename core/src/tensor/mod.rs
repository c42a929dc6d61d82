//! Tensors and tensor views.
//!
//! # Owned tensors and borrowed views
//!
//! A **Tensor** here is a flat, row-major buffer plus the shape needed to interpret it. Two
//! flavours exist:
//!
//! - [`Tensor`]: owns its `Vec`. Used for small, long-lived tables such as the RoPE frequencies.
//! - [`View`] / [`ViewMut`]: borrow a slice of some larger allocation (the parameter buffer, the
//!   activation buffer, a scratch slot) and carry its shape and strides with them.
//!
//! Every kernel in [`crate::kernels`] receives views, never a bare slice plus an out-of-band
//! shape tuple. Building a view checks that the slice length matches the shape product, so an
//! offset mistake in the orchestrator surfaces as a `TensorError::ShapeMismatch` at the call site
//! instead of as silently corrupted memory somewhere downstream.
//!
//! ## Example
//!
//! ```rust
//! use gqa_train::tensor::{Tensor, View};
//!
//! let tensor = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(tensor.shape(), &[2, 3]);
//!
//! // Zero-copy view over the second row.
//! let row = View::new(&tensor.data()[3..], [3]).unwrap();
//! assert_eq!(row.at([1]), 5.0);
//! ```
//!
//! > [!TIP]
//! > **Expert Note: Strides and Memory Layout**
//! > Row-major means the last dimension changes fastest in memory. For a `(B, NH, T, HS)` view the
//! > strides are `(NH·T·HS, T·HS, HS, 1)`, so one head of one batch element is a contiguous
//! > `T × HS` matrix. That is exactly the layout the attention GEMMs want.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod view;

pub use view::{View, ViewMut};

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Essential for efficient storage in contiguous memory (e.g., `Vec<T>`) and fast element access.
/// - `Num + ...`: Provides necessary numeric operations for tensor math.
/// - `Send + Sync`: Required for parallel execution via `rayon`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// A dynamically ranked shape.
///
/// The declarative parameter/activation tables evaluate their shape formulas into `Shape`s; the
/// rank differs per entry (`(C)` for the final norm, `(L, B, NH, T, T)` for attention weights), so
/// a const-generic array does not fit there.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of elements described by the shape.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// [`Shape::numel`], or `None` if the product does not fit a `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

/// An owned, row-major N-dimensional array.
///
/// # Generics
///
/// - `T`: The element type (must implement `TensorElem`).
/// - `RANK`: The number of dimensions (const generic).
///
/// The rank is part of the type but the extents are not: batch size and sequence length are only
/// known once the first batch arrives, so shapes are checked at runtime.
#[derive(Clone)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![T::zero(); size],
        }
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Computes row-major strides for a given shape.
///
/// Strides represent the number of elements to skip in memory to move to the next element
/// along a specific dimension.
pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        // Positive case
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let tensor = Tensor::<f32, 2>::new(data.clone(), [2, 2]).unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.data(), &data[..]);

        // Negative case: Size mismatch
        let err = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zeros() {
        let zeros = Tensor::<f32, 2>::zeros([2, 3]);
        assert_eq!(zeros.data(), &[0.0; 6]);
        assert_eq!(zeros.strides(), &[3, 1]);
    }

    #[test]
    fn test_compute_strides() {
        let shape = [2, 3, 4];
        let strides = compute_strides(&shape);
        // Stride for dim 2 (last) is 1
        // Stride for dim 1 is 4
        // Stride for dim 0 is 3 * 4 = 12
        assert_eq!(strides, [12, 4, 1]);
    }

    #[test]
    fn test_shape_numel() {
        assert_eq!(Shape::new(vec![2, 3, 4]).numel(), 24);
        assert_eq!(Shape::from(&[7usize][..]).dims(), &[7]);
        // A rank-0 shape describes a scalar.
        assert_eq!(Shape::new(vec![]).numel(), 1);
        assert_eq!(Shape::new(vec![2, 3, 4]).checked_numel(), Some(24));
        assert_eq!(Shape::new(vec![1 << 40, 1 << 40]).checked_numel(), None);
    }

    #[test]
    fn test_tensor_error_display() {
        let err = TensorError::ShapeMismatch {
            expected: vec![2, 2],
            got: vec![4],
        };
        assert_eq!(
            format!("{}", err),
            "Shape mismatch: expected [2, 2], got [4]"
        );
    }
}
