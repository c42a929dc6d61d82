//! Borrowed, self-describing tensor views.
//!
//! A view is `(base slice, shape, strides)`. It never owns memory, so many views can be carved out
//! of one flat allocation (see `split_mut` on the tensor tables) and handed to kernels without a
//! copy.

use super::{Result, TensorError, compute_strides};

/// An immutable N-dimensional view over a borrowed slice.
#[derive(Debug, Clone, Copy)]
pub struct View<'a, T, const RANK: usize> {
    data: &'a [T],
    shape: [usize; RANK],
    strides: [usize; RANK],
}

/// A mutable N-dimensional view over a borrowed slice.
#[derive(Debug)]
pub struct ViewMut<'a, T, const RANK: usize> {
    data: &'a mut [T],
    shape: [usize; RANK],
    strides: [usize; RANK],
}

fn check_len(len: usize, shape: &[usize]) -> Result<()> {
    let size: usize = shape.iter().product();
    if len != size {
        return Err(TensorError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![len],
        });
    }
    Ok(())
}

fn linear_offset<const RANK: usize>(
    index: [usize; RANK],
    shape: &[usize; RANK],
    strides: &[usize; RANK],
) -> usize {
    let mut offset = 0;
    for d in 0..RANK {
        debug_assert!(
            index[d] < shape[d],
            "index {index:?} out of bounds for shape {shape:?}"
        );
        offset += index[d] * strides[d];
    }
    offset
}

impl<'a, T, const RANK: usize> View<'a, T, RANK> {
    /// Views `data` as a row-major tensor of the given shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `data.len()` differs from the shape product.
    pub fn new(data: &'a [T], shape: [usize; RANK]) -> Result<Self> {
        check_len(data.len(), &shape)?;
        Ok(Self::from_parts(data, shape, compute_strides(&shape)))
    }

    pub(crate) fn from_parts(data: &'a [T], shape: [usize; RANK], strides: [usize; RANK]) -> Self {
        Self {
            data,
            shape,
            strides,
        }
    }

    pub fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    pub fn data(&self) -> &'a [T] {
        self.data
    }

    /// Flat offset of a multi-dimensional index.
    pub fn offset(&self, index: [usize; RANK]) -> usize {
        linear_offset(index, &self.shape, &self.strides)
    }

    /// Checked element access.
    pub fn get(&self, index: [usize; RANK]) -> Result<&'a T> {
        if index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return Err(TensorError::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape.to_vec(),
            });
        }
        Ok(&self.data[self.offset(index)])
    }
}

impl<T: Copy, const RANK: usize> View<'_, T, RANK> {
    pub fn at(&self, index: [usize; RANK]) -> T {
        self.data[self.offset(index)]
    }
}

impl<'a, T, const RANK: usize> ViewMut<'a, T, RANK> {
    /// Views `data` mutably as a row-major tensor of the given shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `data.len()` differs from the shape product.
    pub fn new(data: &'a mut [T], shape: [usize; RANK]) -> Result<Self> {
        check_len(data.len(), &shape)?;
        Ok(Self::from_parts(data, shape, compute_strides(&shape)))
    }

    pub(crate) fn from_parts(
        data: &'a mut [T],
        shape: [usize; RANK],
        strides: [usize; RANK],
    ) -> Self {
        Self {
            data,
            shape,
            strides,
        }
    }

    pub fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    pub fn data(&self) -> &[T] {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut *self.data
    }

    /// Consumes the view, returning the borrowed slice with its full lifetime.
    pub fn into_data(self) -> &'a mut [T] {
        self.data
    }

    pub fn offset(&self, index: [usize; RANK]) -> usize {
        linear_offset(index, &self.shape, &self.strides)
    }

    pub fn at_mut(&mut self, index: [usize; RANK]) -> &mut T {
        let offset = self.offset(index);
        &mut self.data[offset]
    }

    /// Shortens the borrow so the view can be passed on without giving it up.
    pub fn reborrow(&mut self) -> ViewMut<'_, T, RANK> {
        ViewMut {
            data: &mut *self.data,
            shape: self.shape,
            strides: self.strides,
        }
    }

    /// A read-only view of the same elements.
    pub fn as_view(&self) -> View<'_, T, RANK> {
        View::from_parts(&*self.data, self.shape, self.strides)
    }
}

impl<T: Copy, const RANK: usize> ViewMut<'_, T, RANK> {
    pub fn at(&self, index: [usize; RANK]) -> T {
        self.data[self.offset(index)]
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }
}
