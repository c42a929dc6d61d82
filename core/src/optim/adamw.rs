use crate::error::{LlamaError, Result};
use crate::tensor::TensorError;
use rayon::prelude::*;
use tracing::warn;

/// Elements per partial sum in [`global_norm`].
const NORM_CHUNK: usize = 1 << 14;

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
///
/// The optimizer itself is stateless hyper-parameters; the moments live in an [`AdamState`] that
/// mirrors the flat parameter buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamW {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    /// Rescale gradients whose global L2 norm exceeds this value.
    pub grad_clip: Option<f32>,
}

/// First and second moments, one entry per parameter.
#[derive(Debug, Clone)]
pub struct AdamState {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl AdamState {
    pub fn new(num_parameters: usize) -> Self {
        Self {
            m: vec![0.0; num_parameters],
            v: vec![0.0; num_parameters],
        }
    }

    pub fn m(&self) -> &[f32] {
        &self.m
    }

    pub fn v(&self) -> &[f32] {
        &self.v
    }
}

impl AdamW {
    /// Creates a new AdamW optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The learning rate ($\eta$).
    ///
    /// Defaults: `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`, `weight_decay = 0.01`, no
    /// clipping.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            grad_clip: None,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_grad_clip(mut self, max_norm: f32) -> Self {
        self.grad_clip = Some(max_norm);
        self
    }

    /// Updates `params`, `state.m` and `state.v` in place for step `t` (1-based).
    ///
    /// Returns the global gradient norm (before clipping).
    pub fn step(
        &self,
        params: &mut [f32],
        grads: &[f32],
        state: &mut AdamState,
        t: usize,
    ) -> Result<f32> {
        if t == 0 {
            return Err(LlamaError::State("optimizer steps are counted from 1"));
        }
        if params.len() != grads.len() || params.len() != state.m.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![params.len()],
                got: vec![grads.len(), state.m.len()],
            }
            .into());
        }

        let norm = global_norm(grads);
        let grad_scale = match self.grad_clip {
            Some(max_norm) if norm > max_norm => {
                warn!(norm, max_norm, "clipping gradients");
                max_norm / norm
            }
            _ => 1.0,
        };

        let (lr, b1, b2, eps, lambda) = (
            self.learning_rate,
            self.beta1,
            self.beta2,
            self.epsilon,
            self.weight_decay,
        );
        let bias_correction1 = 1.0 - b1.powi(t as i32);
        let bias_correction2 = 1.0 - b2.powi(t as i32);

        params
            .par_iter_mut()
            .zip(grads.par_iter())
            .zip(state.m.par_iter_mut())
            .zip(state.v.par_iter_mut())
            .for_each(|(((p, &g), m), v)| {
                let g = g * grad_scale;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
            });

        Ok(norm)
    }
}

/// L2 norm of a flat gradient buffer.
///
/// Partial sums are taken over fixed-size chunks and combined in order, so the result does not
/// depend on the number of threads.
pub fn global_norm(grads: &[f32]) -> f32 {
    let partials: Vec<f64> = grads
        .par_chunks(NORM_CHUNK)
        .map(|chunk| chunk.iter().map(|&g| (g as f64) * (g as f64)).sum())
        .collect();
    partials.iter().sum::<f64>().sqrt() as f32
}
