//! Head layout transforms.
//!
//! The QKV projection produces one row per token: `[q_0 .. q_{NH-1} | k_0 .. k_{KVH-1} | v_0 ..
//! v_{KVH-1}]`, each head `HS` wide. The attention GEMMs want the opposite nesting, one contiguous
//! `[T, HS]` matrix per (batch, head). These functions move data between the two layouts by index
//! remapping only. Every destination element has exactly one source, so each direction is a pure
//! gather and can be split across workers by destination block.

use crate::tensor::{View, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

/// Copies heads `col_offset/HS ..` of every token row of `rows` into `heads` (`[B, H, T, HS]`).
fn rows_to_heads(rows: &[f32], row_width: usize, col_offset: usize, heads: ViewMut<'_, f32, 4>) {
    let [_, n_heads, t_len, hs] = *heads.shape();
    let data = heads.into_data();
    if data.is_empty() {
        return;
    }

    let fill_block = |(bh, block): (usize, &mut [f32])| {
        let (b, h) = (bh / n_heads, bh % n_heads);
        for (t, dst) in block.chunks_exact_mut(hs).enumerate() {
            let start = (b * t_len + t) * row_width + col_offset + h * hs;
            dst.copy_from_slice(&rows[start..start + hs]);
        }
    };

    if data.len() >= PARALLEL_THRESHOLD {
        data.par_chunks_mut(t_len * hs)
            .enumerate()
            .for_each(fill_block);
    } else {
        data.chunks_mut(t_len * hs).enumerate().for_each(fill_block);
    }
}

/// Writes every token row of `rows` (`[B, T, width]`) as the concatenation of `heads`' rows.
fn heads_to_rows(heads: &[View<'_, f32, 4>], rows: ViewMut<'_, f32, 3>) {
    let [_, t_len, width] = *rows.shape();
    let data = rows.into_data();
    if data.is_empty() {
        return;
    }

    let fill_row = |(bt, row): (usize, &mut [f32])| {
        let (b, t) = (bt / t_len, bt % t_len);
        let mut col = 0;
        for src in heads {
            let [_, n_heads, _, hs] = *src.shape();
            for h in 0..n_heads {
                let start = src.offset([b, h, t, 0]);
                row[col..col + hs].copy_from_slice(&src.data()[start..start + hs]);
                col += hs;
            }
        }
        debug_assert_eq!(col, width);
    };

    if data.len() >= PARALLEL_THRESHOLD {
        data.par_chunks_mut(width).enumerate().for_each(fill_row);
    } else {
        data.chunks_mut(width).enumerate().for_each(fill_row);
    }
}

fn check_heads(label: &str, rows: &[usize; 3], heads: &[usize; 4]) {
    assert!(
        rows[0] == heads[0] && rows[1] == heads[2],
        "{label}: rows {rows:?} and heads {heads:?} disagree on (B, T)"
    );
}

/// Splits the fused projection `qkv` (`[B, T, (NH + 2·KVH)·HS]`) into per-head `q`
/// (`[B, NH, T, HS]`), `k` and `v` (`[B, KVH, T, HS]`).
pub fn permute_qkv(
    qkv: View<'_, f32, 3>,
    q: ViewMut<'_, f32, 4>,
    k: ViewMut<'_, f32, 4>,
    v: ViewMut<'_, f32, 4>,
) {
    let width = qkv.shape()[2];
    let [_, nh, _, hs] = *q.shape();
    let kvh = k.shape()[1];
    check_heads("permute_qkv", qkv.shape(), q.shape());
    check_heads("permute_qkv", qkv.shape(), k.shape());
    assert_eq!(k.shape(), v.shape(), "k and v must have the same shape");
    assert_eq!(width, (nh + 2 * kvh) * hs, "fused row width mismatch");

    let rows = qkv.data();
    rows_to_heads(rows, width, 0, q);
    rows_to_heads(rows, width, nh * hs, k);
    rows_to_heads(rows, width, (nh + kvh) * hs, v);
}

/// Backward of [`permute_qkv`]: scatters the per-head gradients back into the fused layout.
pub fn permute_qkv_backward(
    dq: View<'_, f32, 4>,
    dk: View<'_, f32, 4>,
    dv: View<'_, f32, 4>,
    dqkv: ViewMut<'_, f32, 3>,
) {
    let [_, nh, _, hs] = *dq.shape();
    let kvh = dk.shape()[1];
    check_heads("permute_qkv_backward", dqkv.shape(), dq.shape());
    check_heads("permute_qkv_backward", dqkv.shape(), dk.shape());
    assert_eq!(dk.shape(), dv.shape(), "dk and dv must have the same shape");
    assert_eq!(dqkv.shape()[2], (nh + 2 * kvh) * hs, "fused row width mismatch");

    heads_to_rows(&[dq, dk, dv], dqkv);
}

/// Merges per-head attention outputs (`[B, NH, T, HS]`) back into token rows (`[B, T, C]`).
pub fn unpermute(heads: View<'_, f32, 4>, out: ViewMut<'_, f32, 3>) {
    let [_, nh, _, hs] = *heads.shape();
    check_heads("unpermute", out.shape(), heads.shape());
    assert_eq!(out.shape()[2], nh * hs, "channel count mismatch");

    heads_to_rows(&[heads], out);
}

/// Backward of [`unpermute`]: splits token-row gradients back into per-head blocks.
pub fn unpermute_backward(dout: View<'_, f32, 3>, dheads: ViewMut<'_, f32, 4>) {
    let [_, nh, _, hs] = *dheads.shape();
    check_heads("unpermute_backward", dout.shape(), dheads.shape());
    assert_eq!(dout.shape()[2], nh * hs, "channel count mismatch");

    rows_to_heads(dout.data(), dout.shape()[2], 0, dheads);
}
