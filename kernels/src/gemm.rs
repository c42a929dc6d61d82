use crate::{KernelElem, KernelError, PARALLEL_THRESHOLD, Result};
use rayon::prelude::*;
use std::borrow::Cow;

/// Whether an operand is read as stored or as its transpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

/// A read-only, row-major matrix operand of a (batched) GEMM.
///
/// `ld` is the distance between consecutive stored rows and `batch_stride` the distance between
/// consecutive matrices of the batch. With `trans == Transpose::Yes` the logical `[rows, cols]`
/// matrix is stored as `[cols, rows]`.
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a, T> {
    pub data: &'a [T],
    pub trans: Transpose,
    pub ld: usize,
    pub batch_stride: usize,
}

impl<'a, T: KernelElem> MatRef<'a, T> {
    /// A single dense matrix read as stored.
    pub fn new(data: &'a [T], ld: usize) -> Self {
        Self {
            data,
            trans: Transpose::No,
            ld,
            batch_stride: 0,
        }
    }

    /// A single dense matrix read as its transpose.
    pub fn transposed(data: &'a [T], ld: usize) -> Self {
        Self {
            data,
            trans: Transpose::Yes,
            ld,
            batch_stride: 0,
        }
    }

    pub fn with_batch_stride(mut self, batch_stride: usize) -> Self {
        self.batch_stride = batch_stride;
        self
    }

    /// Element `(row, col)` of the logical (possibly transposed) matrix `batch`.
    #[inline]
    fn at(&self, batch: usize, row: usize, col: usize) -> T {
        let base = batch * self.batch_stride;
        match self.trans {
            Transpose::No => self.data[base + row * self.ld + col],
            Transpose::Yes => self.data[base + col * self.ld + row],
        }
    }

    /// Logical row `row` of matrix `batch`, borrowed when it is contiguous in storage.
    fn row(&self, batch: usize, row: usize, len: usize) -> Cow<'a, [T]> {
        let base = batch * self.batch_stride;
        match self.trans {
            Transpose::No => {
                let start = base + row * self.ld;
                Cow::Borrowed(&self.data[start..start + len])
            }
            Transpose::Yes => Cow::Owned((0..len).map(|c| self.at(batch, row, c)).collect()),
        }
    }

    /// Number of elements the operand must hold for `batch` logical `[rows, cols]` matrices.
    fn required_len(&self, batch: usize, rows: usize, cols: usize) -> usize {
        if batch == 0 || rows == 0 || cols == 0 {
            return 0;
        }
        let (stored_rows, stored_cols) = match self.trans {
            Transpose::No => (rows, cols),
            Transpose::Yes => (cols, rows),
        };
        (batch - 1) * self.batch_stride + (stored_rows - 1) * self.ld + stored_cols
    }
}

/// Strided batched matrix multiplication on the CPU.
///
/// Computes, for every matrix `i` of the batch,
///
/// ```text
/// C[i] = alpha * op(A[i]) * op(B[i]) + beta * C[i]
/// ```
///
/// where `op(A)` is `[m, k]`, `op(B)` is `[k, n]` and `C[i]` is an `[m, n]` block with row
/// stride `ldc`, the blocks packed back to back (`m * ldc` apart).
///
/// `beta == 0` overwrites the destination without reading it, so the destination may hold
/// garbage (including NaN). Any other `beta` accumulates. Non-finite values in `A` and `B`
/// propagate as in a naive triple loop: a zero times NaN still yields NaN.
///
/// Work is split over rows of `C`; every row is owned by exactly one worker, so the result does
/// not depend on scheduling.
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: KernelElem>(
    m: usize,
    n: usize,
    k: usize,
    batch: usize,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    c: &mut [T],
    ldc: usize,
) -> Result<()> {
    if ldc < n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![n],
            got: vec![ldc],
        });
    }
    let needed_a = a.required_len(batch, m, k);
    if a.data.len() < needed_a {
        return Err(KernelError::BufferTooSmall {
            operand: "A",
            needed: needed_a,
            len: a.data.len(),
        });
    }
    let needed_b = b.required_len(batch, k, n);
    if b.data.len() < needed_b {
        return Err(KernelError::BufferTooSmall {
            operand: "B",
            needed: needed_b,
            len: b.data.len(),
        });
    }
    let rows = batch * m;
    if rows == 0 || n == 0 {
        return Ok(());
    }
    let needed_c = (rows - 1) * ldc + n;
    if c.len() < needed_c {
        return Err(KernelError::BufferTooSmall {
            operand: "C",
            needed: needed_c,
            len: c.len(),
        });
    }

    let row_fn = |(global_row, c_row): (usize, &mut [T])| {
        let bi = global_row / m;
        let i = global_row % m;
        let c_row = &mut c_row[..n];

        if beta == T::zero() {
            c_row.iter_mut().for_each(|x| *x = T::zero());
        } else if beta != T::one() {
            c_row.iter_mut().for_each(|x| *x *= beta);
        }
        if k == 0 {
            return;
        }

        let a_row = a.row(bi, i, k);
        match b.trans {
            // Rows of op(B) are contiguous: accumulate scaled rows of B (axpy form).
            Transpose::No => {
                for (p, &a_ip) in a_row.iter().enumerate() {
                    let scale = alpha * a_ip;
                    let start = bi * b.batch_stride + p * b.ld;
                    let b_row = &b.data[start..start + n];
                    for (out, &val_b) in c_row.iter_mut().zip(b_row) {
                        *out += scale * val_b;
                    }
                }
            }
            // Columns of op(B) are contiguous: one dot product per output element.
            Transpose::Yes => {
                for (j, out) in c_row.iter_mut().enumerate() {
                    let start = bi * b.batch_stride + j * b.ld;
                    let b_col = &b.data[start..start + k];
                    let mut sum = T::zero();
                    for (&val_a, &val_b) in a_row.iter().zip(b_col) {
                        sum += val_a * val_b;
                    }
                    *out += alpha * sum;
                }
            }
        }
    };

    if rows * n * k >= PARALLEL_THRESHOLD {
        c.par_chunks_mut(ldc)
            .take(rows)
            .enumerate()
            .for_each(row_fn);
    } else {
        c.chunks_mut(ldc).take(rows).enumerate().for_each(row_fn);
    }

    Ok(())
}
