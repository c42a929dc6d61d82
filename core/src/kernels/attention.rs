//! Causal scaled dot-product attention, forward and backward.
//!
//! All tensors are per-head: `q`, `k`, `v`, `out` are `[B, NH, T, HS]` and the score/weight
//! matrices are `[B, NH, T, T]`. Each (batch, head) pair is an independent `T × HS` problem.
//!
//! The forward pass works one query row at a time and never touches a score beyond the causal
//! boundary. The backward pass uses strided batched GEMMs over `B·NH` matrices; the weights and
//! their gradients are exact zeros beyond the boundary, so the dense products add nothing there.
//!
//! # Softmax
//!
//! Row `i` only covers keys `0..=i`. The row maximum and normaliser are computed in one pass with
//! the streaming ("online") update
//!
//! ```text
//! m' = max(m, x_j)
//! s' = s · exp(m - m') + exp(x_j - m')
//! ```
//!
//! so no exponent ever sees a positive argument. The diagonal is always in range, hence `s >= 1`.
//! Weights beyond the causal boundary are written as exact zeros.

use crate::tensor::{View, ViewMut};
use gqa_train_kernels::{MatRef, PARALLEL_THRESHOLD, Result, gemm};
use rayon::prelude::*;

fn check_qkv(q: &[usize; 4], other: &[usize; 4], label: &str) {
    assert_eq!(q, other, "{label} must match the query shape");
}

fn check_scores(q: &[usize; 4], scores: &[usize; 4], label: &str) {
    let [b, nh, t, _] = *q;
    assert_eq!(
        scores,
        &[b, nh, t, t],
        "{label} must be [B, NH, T, T] for queries {q:?}"
    );
}

/// Softmax scale `1 / sqrt(HS)`.
pub fn attention_scale(head_size: usize) -> f32 {
    1.0 / (head_size as f32).sqrt()
}

/// Causal softmax of one score row in place: entries `0..=i` normalised, the rest zeroed.
fn causal_softmax_row(i: usize, scores: &[f32], weights: &mut [f32]) {
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f32;
    for &x in &scores[..=i] {
        if x > max {
            sum = sum * (max - x).exp() + 1.0;
            max = x;
        } else {
            sum += (x - max).exp();
        }
    }
    let inv_sum = 1.0 / sum;
    for (w, &x) in weights[..=i].iter_mut().zip(&scores[..=i]) {
        *w = (x - max).exp() * inv_sum;
    }
    weights[i + 1..].fill(0.0);
}

/// Forward attention.
///
/// - `preatt`: scratch for the raw scores. Row `i` gets entries `0..=i`; the rest is not touched.
/// - `att`: receives the causal softmax weights; the caller keeps it for the backward pass.
/// - `out`: receives `att · v`.
pub fn attention_forward(
    q: View<'_, f32, 4>,
    k: View<'_, f32, 4>,
    v: View<'_, f32, 4>,
    mut preatt: ViewMut<'_, f32, 4>,
    mut att: ViewMut<'_, f32, 4>,
    mut out: ViewMut<'_, f32, 4>,
) -> Result<()> {
    let [b, nh, t_len, hs] = *q.shape();
    check_qkv(q.shape(), k.shape(), "keys");
    check_qkv(q.shape(), v.shape(), "values");
    check_qkv(q.shape(), out.shape(), "output");
    check_scores(q.shape(), preatt.shape(), "preatt");
    check_scores(q.shape(), att.shape(), "att");
    let batch = b * nh;
    if batch == 0 || t_len == 0 || hs == 0 {
        return Ok(());
    }
    let head_stride = t_len * hs;
    let scale = attention_scale(hs);
    let (qd, kd, vd) = (q.data(), k.data(), v.data());

    let row_fn = |(row, ((o, w), s)): (usize, ((&mut [f32], &mut [f32]), &mut [f32]))| {
        let heads = (row / t_len) * head_stride;
        let i = row % t_len;
        let q_i = &qd[heads + i * hs..heads + (i + 1) * hs];
        for (j, s_j) in s[..=i].iter_mut().enumerate() {
            let k_j = &kd[heads + j * hs..heads + (j + 1) * hs];
            *s_j = scale * q_i.iter().zip(k_j).map(|(a, b)| a * b).sum::<f32>();
        }
        causal_softmax_row(i, s, w);

        o.fill(0.0);
        for (j, &w_j) in w[..=i].iter().enumerate() {
            let v_j = &vd[heads + j * hs..heads + (j + 1) * hs];
            for (x, &y) in o.iter_mut().zip(v_j) {
                *x += w_j * y;
            }
        }
    };

    if batch * t_len * t_len * hs >= PARALLEL_THRESHOLD {
        out.data_mut()
            .par_chunks_mut(hs)
            .zip(att.data_mut().par_chunks_mut(t_len))
            .zip(preatt.data_mut().par_chunks_mut(t_len))
            .enumerate()
            .for_each(row_fn);
    } else {
        out.data_mut()
            .chunks_mut(hs)
            .zip(att.data_mut().chunks_mut(t_len))
            .zip(preatt.data_mut().chunks_mut(t_len))
            .enumerate()
            .for_each(row_fn);
    }
    Ok(())
}

/// Backward attention.
///
/// Given `dout` (`[B, NH, T, HS]`) and the forward inputs and weights, overwrites `dq`, `dk` and
/// `dv`. `datt` is scratch (`[B, NH, T, T]`) and is fully overwritten.
#[allow(clippy::too_many_arguments)]
pub fn attention_backward(
    dout: View<'_, f32, 4>,
    q: View<'_, f32, 4>,
    k: View<'_, f32, 4>,
    v: View<'_, f32, 4>,
    att: View<'_, f32, 4>,
    mut datt: ViewMut<'_, f32, 4>,
    mut dq: ViewMut<'_, f32, 4>,
    mut dk: ViewMut<'_, f32, 4>,
    mut dv: ViewMut<'_, f32, 4>,
) -> Result<()> {
    let [b, nh, t_len, hs] = *q.shape();
    check_qkv(q.shape(), dout.shape(), "dout");
    check_qkv(q.shape(), k.shape(), "keys");
    check_qkv(q.shape(), v.shape(), "values");
    check_qkv(q.shape(), dq.shape(), "dq");
    check_qkv(q.shape(), dk.shape(), "dk");
    check_qkv(q.shape(), dv.shape(), "dv");
    check_scores(q.shape(), att.shape(), "att");
    check_scores(q.shape(), datt.shape(), "datt");
    let batch = b * nh;
    let head_stride = t_len * hs;
    let score_stride = t_len * t_len;
    let scale = attention_scale(hs);

    // dv = attᵀ · dout
    gemm(
        t_len,
        hs,
        t_len,
        batch,
        1.0,
        MatRef::transposed(att.data(), t_len).with_batch_stride(score_stride),
        MatRef::new(dout.data(), hs).with_batch_stride(head_stride),
        0.0,
        dv.data_mut(),
        hs,
    )?;

    // datt = dout · vᵀ
    gemm(
        t_len,
        t_len,
        hs,
        batch,
        1.0,
        MatRef::new(dout.data(), hs).with_batch_stride(head_stride),
        MatRef::transposed(v.data(), hs).with_batch_stride(head_stride),
        0.0,
        datt.data_mut(),
        t_len,
    )?;

    // Softmax backward in place: dpreatt[i, j] = att[i, j] · (datt[i, j] - Σ_j' att·datt) · scale
    let softmax_back = |(row, (d, w)): (usize, (&mut [f32], &[f32]))| {
        let i = row % t_len;
        let local_sum: f32 = w[..=i].iter().zip(&d[..=i]).map(|(w, d)| w * d).sum();
        for (dj, &wj) in d[..=i].iter_mut().zip(&w[..=i]) {
            *dj = wj * (*dj - local_sum) * scale;
        }
        d[i + 1..].fill(0.0);
    };
    let weights = att.data();
    if weights.len() >= PARALLEL_THRESHOLD {
        datt.data_mut()
            .par_chunks_mut(t_len)
            .zip(weights.par_chunks(t_len))
            .enumerate()
            .for_each(softmax_back);
    } else {
        datt.data_mut()
            .chunks_mut(t_len)
            .zip(weights.chunks(t_len))
            .enumerate()
            .for_each(softmax_back);
    }
    let dpreatt = datt.data();

    // dq = dpreatt · k
    gemm(
        t_len,
        hs,
        t_len,
        batch,
        1.0,
        MatRef::new(dpreatt, t_len).with_batch_stride(score_stride),
        MatRef::new(k.data(), hs).with_batch_stride(head_stride),
        0.0,
        dq.data_mut(),
        hs,
    )?;

    // dk = dpreattᵀ · q
    gemm(
        t_len,
        hs,
        t_len,
        batch,
        1.0,
        MatRef::transposed(dpreatt, t_len).with_batch_stride(score_stride),
        MatRef::new(q.data(), hs).with_batch_stride(head_stride),
        0.0,
        dk.data_mut(),
        hs,
    )
}
