//! Error types of the training core.
//!
//! Nothing in here is retried. A returned error means the caller handed the model something
//! inconsistent (a malformed checkpoint, a batch of the wrong size, an out-of-vocabulary token) and
//! the step must not go on, because continuing after a shape error would corrupt gradients without
//! any visible symptom.

use crate::model::arena::ArenaError;
use crate::tensor::TensorError;
use gqa_train_kernels::KernelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlamaError {
    /// Invalid hyper-parameters (e.g. heads not divisible by kv heads).
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Malformed or incompatible checkpoint file.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    /// A call's geometry does not match the geometry the buffers were allocated for.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    Shape {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Token {token} at index {index} is outside the vocabulary (size {vocab_size})")]
    TokenOutOfRange {
        index: usize,
        token: u32,
        vocab_size: usize,
    },
    /// An operation was called out of order (e.g. backward without a forward with targets).
    #[error("Invalid call order: {0}")]
    State(&'static str),
    /// Thread pool or memory could not be obtained.
    #[error("Resource error: {0}")]
    Resource(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, LlamaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LlamaError::TokenOutOfRange {
            index: 3,
            token: 70,
            vocab_size: 64,
        };
        assert_eq!(
            err.to_string(),
            "Token 70 at index 3 is outside the vocabulary (size 64)"
        );

        let err: LlamaError = TensorError::Unsupported("rank 0".into()).into();
        assert_eq!(err.to_string(), "Unsupported operation: rank 0");
    }
}
