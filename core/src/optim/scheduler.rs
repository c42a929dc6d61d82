//! Learning Rate Schedulers.
//!
//! The model's `update` uses whatever learning rate the [`AdamW`](super::AdamW) it is given
//! carries; a training loop asks a scheduler for the rate of the current step and builds the
//! optimizer from it.

use std::f32::consts::PI;

/// A trait for learning rate schedulers.
pub trait LRScheduler {
    /// Calculates the learning rate for a given step.
    fn get_lr(&self, step: usize) -> f32;
}

/// The same rate at every step.
#[derive(Debug, Clone, Copy)]
pub struct Constant(pub f32);

impl LRScheduler for Constant {
    fn get_lr(&self, _step: usize) -> f32 {
        self.0
    }
}

/// Cosine Decay with Warmup.
///
/// Increases LR from 0 to `max_lr` over `warmup_steps`.
/// Then decays following a cosine curve to `min_lr`.
#[derive(Debug, Clone, Copy)]
pub struct CosineDecay {
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineDecay {
    pub fn new(max_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            max_lr,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LRScheduler for CosineDecay {
    fn get_lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            self.max_lr * (step as f32 / self.warmup_steps as f32)
        } else if step < self.total_steps {
            let decay_steps = self.total_steps - self.warmup_steps;
            let current_decay_step = step - self.warmup_steps;
            let progress = current_decay_step as f32 / decay_steps as f32;
            let cosine_decay = 0.5 * (1.0 + (progress * PI).cos());
            self.min_lr + (self.max_lr - self.min_lr) * cosine_decay
        } else {
            self.min_lr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let scheduler = Constant(3e-4);
        assert_eq!(scheduler.get_lr(0), 3e-4);
        assert_eq!(scheduler.get_lr(10_000), 3e-4);
    }

    #[test]
    fn test_cosine_decay() {
        let scheduler = CosineDecay::new(1.0, 10, 20).with_min_lr(0.1);

        // Warmup
        assert_eq!(scheduler.get_lr(0), 0.0);
        assert_eq!(scheduler.get_lr(5), 0.5);

        // Peak
        assert_eq!(scheduler.get_lr(10), 1.0);

        // Decay
        // step 15: progress = 0.5. cos(0.5pi) = 0. 0.5 * (1+0) = 0.5.
        // LR = 0.1 + 0.9 * 0.5 = 0.55
        assert!((scheduler.get_lr(15) - 0.55).abs() < 1e-6);

        // End
        assert_eq!(scheduler.get_lr(20), 0.1);
        assert_eq!(scheduler.get_lr(100), 0.1);
    }
}
