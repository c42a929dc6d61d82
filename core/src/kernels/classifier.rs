//! Softmax cross-entropy over a padded vocabulary.
//!
//! Logit rows are `Vp` wide but only the first `V` entries are real tokens; the padded tail is
//! never part of the softmax and always receives a zero gradient.

use crate::tensor::{View, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

/// Returns `(max, Σ exp(x - max))` over the real vocabulary.
fn log_sum_exp_parts(row: &[f32]) -> (f32, f32) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum = row.iter().map(|&x| (x - max).exp()).sum();
    (max, sum)
}

/// Per-position loss `-log softmax(logits)[target]`.
pub fn crossentropy_forward(
    logits: View<'_, f32, 3>,
    targets: &[u32],
    vocab_size: usize,
    mut losses: ViewMut<'_, f32, 2>,
) {
    let [b, t, vp] = *logits.shape();
    assert!(vocab_size > 0 && vocab_size <= vp, "vocab {vocab_size} vs padded {vp}");
    assert_eq!(losses.shape(), &[b, t], "losses must be [B, T]");
    assert_eq!(targets.len(), b * t, "one target per (b, t) position");

    let row_loss = |((loss, row), &target): ((&mut f32, &[f32]), &u32)| {
        let row = &row[..vocab_size];
        let (max, sum) = log_sum_exp_parts(row);
        *loss = max + sum.ln() - row[target as usize];
    };

    let logits = logits.data();
    if logits.len() >= PARALLEL_THRESHOLD {
        losses
            .data_mut()
            .par_iter_mut()
            .zip(logits.par_chunks(vp))
            .zip(targets.par_iter())
            .for_each(row_loss);
    } else {
        losses
            .data_mut()
            .iter_mut()
            .zip(logits.chunks(vp))
            .zip(targets.iter())
            .for_each(row_loss);
    }
}

/// Backward of softmax + cross-entropy, written over the logits in place:
/// `dlogits = (softmax(logits) - onehot(target)) · dloss`, zero on the padded tail.
pub fn crossentropy_softmax_backward(
    mut logits: ViewMut<'_, f32, 3>,
    targets: &[u32],
    vocab_size: usize,
    dloss: f32,
) {
    let [b, t, vp] = *logits.shape();
    assert!(vocab_size > 0 && vocab_size <= vp, "vocab {vocab_size} vs padded {vp}");
    assert_eq!(targets.len(), b * t, "one target per (b, t) position");

    let row_grad = |(row, &target): (&mut [f32], &u32)| {
        let (real, padded) = row.split_at_mut(vocab_size);
        let (max, sum) = log_sum_exp_parts(real);
        let inv_sum = 1.0 / sum;
        for (i, x) in real.iter_mut().enumerate() {
            let p = (*x - max).exp() * inv_sum;
            let indicator = if i == target as usize { 1.0 } else { 0.0 };
            *x = (p - indicator) * dloss;
        }
        padded.fill(0.0);
    };

    let data = logits.data_mut();
    if data.len() >= PARALLEL_THRESHOLD {
        data.par_chunks_mut(vp).zip(targets.par_iter()).for_each(row_grad);
    } else {
        data.chunks_mut(vp).zip(targets.iter()).for_each(row_grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_v() {
        // V = 4 real entries, Vp = 6; the padded tail must be ignored even if huge.
        let logits = vec![0.0, 0.0, 0.0, 0.0, 100.0, 100.0];
        let mut loss = vec![0.0];
        crossentropy_forward(
            View::new(&logits[..], [1, 1, 6]).unwrap(),
            &[1],
            4,
            ViewMut::new(&mut loss[..], [1, 1]).unwrap(),
        );
        assert!((loss[0] - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_backward_rows_sum_to_zero() {
        let mut logits = vec![1.0, 2.0, 3.0, 7.0, -1.0, 0.5, 0.0, 9.0];
        crossentropy_softmax_backward(
            ViewMut::new(&mut logits[..], [1, 2, 4]).unwrap(),
            &[2, 0],
            3,
            0.5,
        );
        for (row, target) in logits.chunks(4).zip([2usize, 0]) {
            assert_eq!(row[3], 0.0);
            let sum: f32 = row[..3].iter().sum();
            assert!(sum.abs() < 1e-6);
            // Only the target entry is negative.
            for (i, &g) in row[..3].iter().enumerate() {
                assert_eq!(g < 0.0, i == target);
            }
        }
    }
}
