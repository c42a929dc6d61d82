//! Numeric primitives shared by the `gqa-train` core.
//!
//! The kernels here know nothing about transformers: they operate on flat slices plus the
//! geometry needed to interpret them. Keeping them in a separate crate lets the GEMM be swapped
//! for a BLAS binding without touching the model code.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod gemm;

pub use gemm::{MatRef, Transpose, gemm};

/// Below this many multiply-adds a kernel runs on the calling thread.
pub const PARALLEL_THRESHOLD: usize = 4096;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Operand {operand} needs {needed} elements but the buffer holds {len}")]
    BufferTooSmall {
        operand: &'static str,
        needed: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the core crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
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
