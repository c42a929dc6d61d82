//! Algebraic properties of the attention-block kernels, checked on random inputs.

use gqa_train::kernels::{
    FreqTable, RMSNORM_EPS, attention_forward, expand_kv, reduce_kv, rmsnorm_forward,
    rope_backward, rope_forward, swiglu_backward, swiglu_forward,
};
use gqa_train::tensor::{View, ViewMut};
use proptest::prelude::*;

fn values(len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-4.0f32..4.0, len)
}

/// `(B, heads, T, HS)` with an even head size.
fn head_dims() -> impl Strategy<Value = [usize; 4]> {
    (1usize..3, 1usize..4, 1usize..10, 1usize..5).prop_map(|(b, h, t, half)| [b, h, t, 2 * half])
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

proptest! {
    #[test]
    fn rope_backward_undoes_forward(
        (dims, x) in head_dims().prop_flat_map(|d| (Just(d), values(d.iter().product()))),
        theta in prop_oneof![Just(10000.0f32), Just(500000.0f32), 2.0f32..1e6],
    ) {
        let freqs = FreqTable::new(dims[3], dims[2], theta).unwrap();
        let mut y = x.clone();
        rope_forward(ViewMut::new(&mut y, dims).unwrap(), &freqs);
        rope_backward(ViewMut::new(&mut y, dims).unwrap(), &freqs);
        for (a, b) in x.iter().zip(&y) {
            prop_assert!((a - b).abs() <= 1e-5 * (1.0 + a.abs()), "{} vs {}", a, b);
        }
    }

    #[test]
    fn rope_preserves_pair_norms(
        (dims, x) in head_dims().prop_flat_map(|d| (Just(d), values(d.iter().product()))),
    ) {
        let freqs = FreqTable::new(dims[3], dims[2], 10000.0).unwrap();
        let mut y = x.clone();
        rope_forward(ViewMut::new(&mut y, dims).unwrap(), &freqs);
        let half = dims[3] / 2;
        for (row_x, row_y) in x.chunks(dims[3]).zip(y.chunks(dims[3])) {
            for i in 0..half {
                let before = row_x[i].hypot(row_x[i + half]);
                let after = row_y[i].hypot(row_y[i + half]);
                prop_assert!((before - after).abs() <= 1e-4 * (1.0 + before));
            }
        }
    }

    #[test]
    fn kv_broadcast_and_reduce_are_adjoint(
        (b, kvh, group, t, hs) in (1usize..3, 1usize..4, 1usize..4, 1usize..6, 1usize..5),
        seed in any::<u64>(),
    ) {
        let nh = kvh * group;
        let small = [b, kvh, t, hs];
        let full = [b, nh, t, hs];
        let len_small: usize = small.iter().product();
        let len_full: usize = full.iter().product();
        let noise = |i: usize| {
            let z = (i as u64 ^ seed).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            ((z >> 40) as f32 / (1u64 << 24) as f32) - 0.5
        };
        let x: Vec<f32> = (0..len_small).map(noise).collect();
        let g: Vec<f32> = (0..len_full).map(|i| noise(i + len_small)).collect();

        let mut bx = vec![0.0f32; len_full];
        expand_kv(View::new(&x, small).unwrap(), ViewMut::new(&mut bx, full).unwrap());
        let mut rg = vec![f32::NAN; len_small];
        reduce_kv(View::new(&g, full).unwrap(), ViewMut::new(&mut rg, small).unwrap());

        let lhs = dot(&bx, &g);
        let rhs = dot(&x, &rg);
        prop_assert!((lhs - rhs).abs() <= 1e-4 * (1.0 + lhs.abs()), "{} vs {}", lhs, rhs);
    }

    #[test]
    fn rmsnorm_ignores_positive_scaling(
        (c, x) in (1usize..24).prop_flat_map(|c| (Just(c), values(3 * c))),
        k in 0.5f32..100.0,
    ) {
        // Skip rows dominated by eps: the invariance only holds when the row's RMS is well above it.
        prop_assume!(x.chunks(c).all(|row| row.iter().map(|v| v * v).sum::<f32>() / c as f32 > 1.0));
        let ones = vec![1.0f32; c];
        let zeros = vec![0.0f32; c];
        let norm = |input: &[f32]| {
            let mut out = vec![0.0f32; 3 * c];
            let mut rstd = vec![0.0f32; 3];
            rmsnorm_forward(
                View::new(input, [1, 3, c]).unwrap(),
                View::new(&ones, [c]).unwrap(),
                View::new(&zeros, [c]).unwrap(),
                RMSNORM_EPS,
                ViewMut::new(&mut out, [1, 3, c]).unwrap(),
                ViewMut::new(&mut rstd, [1, 3]).unwrap(),
            );
            out
        };
        let scaled: Vec<f32> = x.iter().map(|v| v * k).collect();
        for (a, b) in norm(&x).iter().zip(norm(&scaled)) {
            prop_assert!((a - b).abs() <= 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn attention_rows_are_causal_distributions(
        (dims, qkv) in head_dims().prop_flat_map(|d| (Just(d), values(3 * d.iter().product::<usize>()))),
        scale in prop_oneof![Just(1.0f32), Just(100.0f32)],
    ) {
        let [b, nh, t, hs] = dims;
        let n = b * nh * t * hs;
        let scaled: Vec<f32> = qkv.iter().map(|v| v * scale).collect();
        let (q, rest) = scaled.split_at(n);
        let (k, v) = rest.split_at(n);
        let mut preatt = vec![0.0f32; b * nh * t * t];
        let mut att = vec![f32::NAN; b * nh * t * t];
        let mut out = vec![0.0f32; n];
        attention_forward(
            View::new(q, dims).unwrap(),
            View::new(k, dims).unwrap(),
            View::new(v, dims).unwrap(),
            ViewMut::new(&mut preatt, [b, nh, t, t]).unwrap(),
            ViewMut::new(&mut att, [b, nh, t, t]).unwrap(),
            ViewMut::new(&mut out, dims).unwrap(),
        ).unwrap();

        for (r, row) in att.chunks(t).enumerate() {
            let i = r % t;
            let sum: f32 = row[..=i].iter().sum();
            prop_assert!((sum - 1.0).abs() <= 1e-5, "row {} sums to {}", r, sum);
            prop_assert!(row[..=i].iter().all(|w| w.is_finite() && *w >= 0.0));
            prop_assert!(row[i + 1..].iter().all(|&w| w == 0.0));
        }
        prop_assert!(out.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn swiglu_gradients_match_finite_differences(
        a in values(6),
        b in values(6),
        dout in values(6),
    ) {
        let shape = [1, 2, 3];
        let out_of = |a: &[f32], b: &[f32]| {
            let mut out = vec![0.0f32; 6];
            swiglu_forward(
                View::new(a, shape).unwrap(),
                View::new(b, shape).unwrap(),
                ViewMut::new(&mut out, shape).unwrap(),
            );
            out
        };
        let mut db = dout.clone();
        let mut da = vec![f32::NAN; 6];
        swiglu_backward(
            ViewMut::new(&mut db, shape).unwrap(),
            ViewMut::new(&mut da, shape).unwrap(),
            View::new(&a, shape).unwrap(),
            View::new(&b, shape).unwrap(),
        );

        // Elements are independent, so a central difference per element in f64 suffices.
        let h = 1e-2f32;
        for i in 0..6 {
            let mut plus = a.clone();
            let mut minus = a.clone();
            plus[i] += h;
            minus[i] -= h;
            let fd_a = (out_of(&plus, &b)[i] as f64 - out_of(&minus, &b)[i] as f64)
                / (2.0 * h as f64)
                * dout[i] as f64;

            let mut plus = b.clone();
            let mut minus = b.clone();
            plus[i] += h;
            minus[i] -= h;
            let fd_b = (out_of(&a, &plus)[i] as f64 - out_of(&a, &minus)[i] as f64)
                / (2.0 * h as f64)
                * dout[i] as f64;

            for (analytic, numeric) in [(da[i] as f64, fd_a), (db[i] as f64, fd_b)] {
                let err = (analytic - numeric).abs();
                prop_assert!(
                    err <= 2e-3 * numeric.abs().max(1.0),
                    "analytic {} vs numeric {}", analytic, numeric
                );
            }
        }
    }
}
