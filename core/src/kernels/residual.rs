use crate::tensor::{View, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

/// `out = a + b`, elementwise.
pub fn residual_forward(mut out: ViewMut<'_, f32, 3>, a: View<'_, f32, 3>, b: View<'_, f32, 3>) {
    assert_eq!(a.shape(), b.shape(), "residual operands differ in shape");
    assert_eq!(out.shape(), a.shape(), "residual output differs in shape");
    let (a, b) = (a.data(), b.data());
    let out = out.data_mut();

    if out.len() >= PARALLEL_THRESHOLD {
        out.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(o, (x, y))| *o = x + y);
    } else {
        for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
            *o = x + y;
        }
    }
}
