use crate::tensor::{View, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

/// Token embedding lookup: `out[b, t, :] = wte[tokens[b, t], :]`.
///
/// Token ids must already be validated against the vocabulary.
pub fn encoder_forward(mut out: ViewMut<'_, f32, 3>, tokens: &[u32], wte: View<'_, f32, 2>) {
    let [b, t, c] = *out.shape();
    assert_eq!(tokens.len(), b * t, "one token per (b, t) position");
    assert_eq!(wte.shape()[1], c, "embedding width mismatch");
    if c == 0 {
        return;
    }
    let table = wte.data();

    let gather = |(row, &tok): (&mut [f32], &u32)| {
        let start = tok as usize * c;
        row.copy_from_slice(&table[start..start + c]);
    };

    let out = out.data_mut();
    if out.len() >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(c).zip(tokens.par_iter()).for_each(gather);
    } else {
        out.chunks_mut(c).zip(tokens.iter()).for_each(gather);
    }
}

/// Backward of [`encoder_forward`]: `dwte[v] += Σ_{(b,t): tokens[b,t] == v} dout[b, t]`.
///
/// Positions are bucketed by token id (counting sort, stable) and every embedding row sums its
/// own bucket in position order. No two workers touch the same row.
pub fn encoder_backward(mut dwte: ViewMut<'_, f32, 2>, dout: View<'_, f32, 3>, tokens: &[u32]) {
    let [b, t, c] = *dout.shape();
    let vocab = dwte.shape()[0];
    assert_eq!(tokens.len(), b * t, "one token per (b, t) position");
    assert_eq!(dwte.shape()[1], c, "embedding width mismatch");
    if c == 0 {
        return;
    }

    let mut starts = vec![0usize; vocab + 1];
    for &tok in tokens {
        starts[tok as usize + 1] += 1;
    }
    for v in 0..vocab {
        starts[v + 1] += starts[v];
    }
    let mut fill = starts.clone();
    let mut order = vec![0usize; tokens.len()];
    for (pos, &tok) in tokens.iter().enumerate() {
        order[fill[tok as usize]] = pos;
        fill[tok as usize] += 1;
    }

    let grads = dout.data();
    let accumulate = |(v, row): (usize, &mut [f32])| {
        for &pos in &order[starts[v]..starts[v + 1]] {
            for (d, &g) in row.iter_mut().zip(&grads[pos * c..(pos + 1) * c]) {
                *d += g;
            }
        }
    };

    let dwte = dwte.data_mut();
    if grads.len() >= PARALLEL_THRESHOLD {
        dwte.par_chunks_mut(c).enumerate().for_each(accumulate);
    } else {
        dwte.chunks_mut(c).enumerate().for_each(accumulate);
    }
}
