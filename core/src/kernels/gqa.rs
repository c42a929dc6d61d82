//! Grouped-query attention: key/value head broadcast and its adjoint.
//!
//! With `KVH < NH` key/value heads, query head `h` attends with key/value head `h % KVH`. The
//! forward pass materialises that broadcast (`[B, KVH, T, HS]` -> `[B, NH, T, HS]`) so the attention
//! core only ever sees matching head counts.
//!
//! The adjoint of a broadcast is a sum. Rather than scatter-adding from every query head (a write
//! conflict whose result depends on scheduling), [`reduce_kv`] walks destinations: each KV head
//! gathers the gradients of its query heads in increasing head order and sums them. The result is
//! bitwise reproducible regardless of the worker count.

use crate::tensor::{View, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

/// The KV head read by query head `h`.
#[inline]
pub fn kv_head_for(h: usize, num_kv_heads: usize) -> usize {
    h % num_kv_heads
}

fn check(label: &str, kv: &[usize; 4], full: &[usize; 4]) {
    assert!(
        kv[0] == full[0] && kv[2] == full[2] && kv[3] == full[3],
        "{label}: kv {kv:?} and expanded {full:?} disagree on (B, T, HS)"
    );
    assert!(
        kv[1] > 0 && full[1] % kv[1] == 0,
        "{label}: {} query heads are not a multiple of {} kv heads",
        full[1],
        kv[1]
    );
}

/// Broadcasts `src` (`[B, KVH, T, HS]`) into `dst` (`[B, NH, T, HS]`).
pub fn expand_kv(src: View<'_, f32, 4>, dst: ViewMut<'_, f32, 4>) {
    check("expand_kv", src.shape(), dst.shape());
    let [_, kvh, t_len, hs] = *src.shape();
    let nh = dst.shape()[1];
    let block = t_len * hs;
    let data = dst.into_data();
    if data.is_empty() {
        return;
    }
    let src = src.data();

    let copy_head = |(bh, out): (usize, &mut [f32])| {
        let (b, h) = (bh / nh, bh % nh);
        let start = (b * kvh + kv_head_for(h, kvh)) * block;
        out.copy_from_slice(&src[start..start + block]);
    };

    if data.len() >= PARALLEL_THRESHOLD {
        data.par_chunks_mut(block).enumerate().for_each(copy_head);
    } else {
        data.chunks_mut(block).enumerate().for_each(copy_head);
    }
}

/// Adjoint of [`expand_kv`]: `dst[b, g] = Σ_{h : h % KVH == g} dexp[b, h]`.
///
/// `dst` is overwritten.
pub fn reduce_kv(dexp: View<'_, f32, 4>, dst: ViewMut<'_, f32, 4>) {
    check("reduce_kv", dst.shape(), dexp.shape());
    let [_, kvh, t_len, hs] = *dst.shape();
    let nh = dexp.shape()[1];
    let block = t_len * hs;
    let data = dst.into_data();
    if data.is_empty() {
        return;
    }
    let dexp = dexp.data();

    let sum_group = |(bg, out): (usize, &mut [f32])| {
        let (b, g) = (bg / kvh, bg % kvh);
        out.fill(0.0);
        for h in (g..nh).step_by(kvh) {
            let start = (b * nh + h) * block;
            for (o, &d) in out.iter_mut().zip(&dexp[start..start + block]) {
                *o += d;
            }
        }
    };

    if dexp.len() >= PARALLEL_THRESHOLD {
        data.par_chunks_mut(block).enumerate().for_each(sum_group);
    } else {
        data.chunks_mut(block).enumerate().for_each(sum_group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_uses_modulo_mapping() {
        // B = 1, KVH = 2, NH = 4, T = 1, HS = 1
        let src = vec![10.0, 20.0];
        let mut dst = vec![0.0; 4];
        expand_kv(
            View::new(&src[..], [1, 2, 1, 1]).unwrap(),
            ViewMut::new(&mut dst[..], [1, 4, 1, 1]).unwrap(),
        );
        // heads 0, 2 -> kv 0; heads 1, 3 -> kv 1
        assert_eq!(dst, vec![10.0, 20.0, 10.0, 20.0]);
    }

    #[test]
    fn test_reduce_sums_each_group() {
        let dexp = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut dst = vec![f32::NAN; 2];
        reduce_kv(
            View::new(&dexp[..], [1, 6, 1, 1]).unwrap(),
            ViewMut::new(&mut dst[..], [1, 2, 1, 1]).unwrap(),
        );
        // kv 0 <- heads 0, 2, 4; kv 1 <- heads 1, 3, 5
        assert_eq!(dst, vec![9.0, 12.0]);
    }

    #[test]
    fn test_equal_head_counts_are_identity() {
        let src: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let mut dst = vec![0.0; 24];
        expand_kv(
            View::new(&src[..], [2, 3, 2, 2]).unwrap(),
            ViewMut::new(&mut dst[..], [2, 3, 2, 2]).unwrap(),
        );
        assert_eq!(dst, src);

        let mut back = vec![0.0; 24];
        reduce_kv(
            View::new(&dst[..], [2, 3, 2, 2]).unwrap(),
            ViewMut::new(&mut back[..], [2, 3, 2, 2]).unwrap(),
        );
        assert_eq!(back, src);
    }

    #[test]
    #[should_panic(expected = "not a multiple")]
    fn test_non_divisible_heads_panic() {
        let src = vec![0.0; 2];
        let mut dst = vec![0.0; 3];
        expand_kv(
            View::new(&src[..], [1, 2, 1, 1]).unwrap(),
            ViewMut::new(&mut dst[..], [1, 3, 1, 1]).unwrap(),
        );
    }
}
