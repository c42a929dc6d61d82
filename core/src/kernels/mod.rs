//! Forward and backward kernels of the transformer block.
//!
//! Every kernel takes [`View`](crate::tensor::View)s for its inputs and
//! [`ViewMut`](crate::tensor::ViewMut)s for its outputs, checks that the shapes agree, and runs to
//! completion before returning (rows are fanned out over the current rayon pool). None of them
//! allocate tensors: destinations are carved out of the model's parameter, activation and scratch
//! buffers by the caller.
//!
//! Shape disagreements here are programming errors in the orchestrator and panic; user-facing
//! validation happens in [`crate::model`].

pub mod attention;
pub mod classifier;
pub mod encoder;
pub mod gqa;
pub mod layout;
pub mod linear;
pub mod residual;
pub mod rmsnorm;
pub mod rope;
pub mod swiglu;

pub use attention::{attention_backward, attention_forward, attention_scale};
pub use classifier::{crossentropy_forward, crossentropy_softmax_backward};
pub use encoder::{encoder_backward, encoder_forward};
pub use gqa::{expand_kv, reduce_kv};
pub use layout::{permute_qkv, permute_qkv_backward, unpermute, unpermute_backward};
pub use linear::{linear_backward, linear_forward};
pub use residual::residual_forward;
pub use rmsnorm::{RMSNORM_EPS, rmsnorm_backward, rmsnorm_forward};
pub use rope::{FreqTable, rope_backward, rope_forward};
pub use swiglu::{silu, silu_grad, swiglu_backward, swiglu_forward};
