//! The execution context: which worker pool the kernels fan out on.
//!
//! Kernels are written against `rayon`'s parallel iterators and therefore run on whatever pool is
//! current. The model holds an `ExecutionContext` and issues every kernel from inside
//! [`ExecutionContext::install`], so two models built with different contexts never share workers
//! and nothing depends on process-wide state.

use crate::error::{LlamaError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pool: Option<Arc<ThreadPool>>,
}

impl ExecutionContext {
    /// Builds a dedicated pool with `num_threads` workers (`0` lets rayon pick).
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("gqa-train-{i}"))
            .build()
            .map_err(|e| LlamaError::Resource(format!("failed to build thread pool: {e}")))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Runs kernels on rayon's global pool.
    pub fn global() -> Self {
        Self { pool: None }
    }

    /// Runs `f` with this context's pool as the current one.
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedicated_pool_is_used() {
        let ctx = ExecutionContext::new(2).unwrap();
        assert_eq!(ctx.num_threads(), 2);
        let inside = ctx.install(rayon::current_num_threads);
        assert_eq!(inside, 2);
    }

    #[test]
    fn test_global_context_runs_inline() {
        let ctx = ExecutionContext::global();
        assert_eq!(ctx.install(|| 1 + 1), 2);
    }
}
