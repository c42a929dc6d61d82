//! SwiGLU gating: `out = silu(a) · b`.
//!
//! `a` is the "up" projection (pre-activation) and `b` the "gate" projection. Everything here is
//! elementwise.

use crate::tensor::{View, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `silu(x) = x · sigmoid(x)`
#[inline]
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

/// `silu'(x) = sigmoid(x) + x · sigmoid(x) · (1 - sigmoid(x))`
#[inline]
pub fn silu_grad(x: f32) -> f32 {
    let s = sigmoid(x);
    s + x * s * (1.0 - s)
}

pub fn swiglu_forward(a: View<'_, f32, 3>, b: View<'_, f32, 3>, mut out: ViewMut<'_, f32, 3>) {
    assert_eq!(a.shape(), b.shape(), "swiglu branches differ in shape");
    assert_eq!(a.shape(), out.shape(), "swiglu output differs in shape");
    let (a, b) = (a.data(), b.data());
    let out = out.data_mut();

    if out.len() >= PARALLEL_THRESHOLD {
        out.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(o, (&x, &g))| *o = silu(x) * g);
    } else {
        for (o, (&x, &g)) in out.iter_mut().zip(a.iter().zip(b)) {
            *o = silu(x) * g;
        }
    }
}

/// Backward of [`swiglu_forward`].
///
/// `dout_db` holds `d_out` on entry and `d_b = silu(a) · d_out` on return (each element is read
/// before it is overwritten, so the gradient can share the upstream buffer). `da` receives
/// `d_a = b · silu'(a) · d_out`.
pub fn swiglu_backward(
    mut dout_db: ViewMut<'_, f32, 3>,
    mut da: ViewMut<'_, f32, 3>,
    a: View<'_, f32, 3>,
    b: View<'_, f32, 3>,
) {
    assert_eq!(a.shape(), b.shape(), "swiglu branches differ in shape");
    assert_eq!(a.shape(), dout_db.shape(), "swiglu gradient differs in shape");
    assert_eq!(a.shape(), da.shape(), "swiglu gradient differs in shape");
    let (a, b) = (a.data(), b.data());
    let (dout_db, da) = (dout_db.data_mut(), da.data_mut());

    let step = |((d, da), (&x, &g)): ((&mut f32, &mut f32), (&f32, &f32))| {
        let dout = *d;
        *da = g * silu_grad(x) * dout;
        *d = silu(x) * dout;
    };

    if da.len() >= PARALLEL_THRESHOLD {
        dout_db
            .par_iter_mut()
            .zip(da.par_iter_mut())
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(step);
    } else {
        dout_db
            .iter_mut()
            .zip(da.iter_mut())
            .zip(a.iter().zip(b))
            .for_each(step);
    }
}
