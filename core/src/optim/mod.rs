//! Optimisation: AdamW over flat parameter buffers and learning-rate schedules.

pub mod adamw;
pub mod scheduler;

pub use adamw::{AdamState, AdamW, global_norm};
pub use scheduler::{Constant, CosineDecay, LRScheduler};
