//! # gqa-train
//!
//! Forward and backward passes of a Llama-style decoder on the CPU: grouped-query attention with
//! rotary position embeddings, SwiGLU feed-forward blocks and RMSNorm, trained with AdamW.
//!
//! The backward pass reuses a fixed set of scratch buffers across all layers (see
//! [`model::arena`]), so its working memory does not grow with depth.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: owned tensors and the strided views every kernel takes.
//! - [`kernels`]: forward/backward kernels of one transformer block.
//! - [`model`]: configuration, parameter/activation tables, the scratch arena and [`Llama`].
//! - [`optim`]: AdamW and learning-rate schedules.
//! - [`checkpoint`]: binary checkpoints and safetensors export.
//!
//! ## Example
//!
//! ```rust
//! use gqa_train::{AdamW, ExecutionContext, Llama, LlamaConfig};
//!
//! let mut model = Llama::new_random(LlamaConfig::tiny_test(), 42, ExecutionContext::global())?;
//! let inputs: Vec<u32> = (0..16).collect();
//! let targets: Vec<u32> = (1..17).collect();
//!
//! let loss = model.forward(&inputs, Some(&targets), 2, 8)?;
//! assert!(loss.unwrap().is_finite());
//!
//! model.zero_grad();
//! model.backward()?;
//! model.update(&AdamW::new(1e-3), 1)?;
//! # Ok::<(), gqa_train::LlamaError>(())
//! ```

pub mod checkpoint;
pub mod context;
pub mod error;
pub mod kernels;
pub mod model;
pub mod optim;
pub mod tensor;

pub use context::ExecutionContext;
pub use error::{LlamaError, Result};
pub use model::{Llama, LlamaConfig, Phase};
pub use optim::{AdamW, CosineDecay, LRScheduler};
pub use tensor::{Tensor, TensorElem, TensorError, View, ViewMut};
