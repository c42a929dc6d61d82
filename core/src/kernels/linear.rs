use crate::tensor::{View, ViewMut};
use gqa_train_kernels::{MatRef, Result, gemm};

/// Bias-free linear projection: `out[b, t, :] = W · inp[b, t, :]`.
///
/// `weight` is stored `[OC, C]` (one output channel per row), so the product is
/// `out = inp · Wᵀ` over the flattened `B·T` rows. `out` is overwritten.
pub fn linear_forward(
    mut out: ViewMut<'_, f32, 3>,
    inp: View<'_, f32, 3>,
    weight: View<'_, f32, 2>,
) -> Result<()> {
    let [b, t, c] = *inp.shape();
    let [oc, wc] = *weight.shape();
    assert_eq!(c, wc, "weight expects {wc} input channels, got {c}");
    assert_eq!(out.shape(), &[b, t, oc], "linear output shape");

    gemm(
        b * t,
        oc,
        c,
        1,
        1.0,
        MatRef::new(inp.data(), c),
        MatRef::transposed(weight.data(), c),
        0.0,
        out.data_mut(),
        oc,
    )
}

/// Backward of [`linear_forward`].
///
/// - `dinp = dout · W`, added to the existing content when `accumulate_dinp` is set (two
///   projections reading the same input), otherwise overwritten.
/// - `dweight += doutᵀ · inp`; parameter gradients always accumulate across the step.
pub fn linear_backward(
    mut dinp: ViewMut<'_, f32, 3>,
    mut dweight: ViewMut<'_, f32, 2>,
    dout: View<'_, f32, 3>,
    inp: View<'_, f32, 3>,
    weight: View<'_, f32, 2>,
    accumulate_dinp: bool,
) -> Result<()> {
    let [b, t, c] = *inp.shape();
    let [oc, wc] = *weight.shape();
    assert_eq!(c, wc, "weight expects {wc} input channels, got {c}");
    assert_eq!(dout.shape(), &[b, t, oc], "linear dout shape");
    assert_eq!(dinp.shape(), inp.shape(), "linear dinp shape");
    assert_eq!(dweight.shape(), weight.shape(), "linear dweight shape");
    let rows = b * t;

    gemm(
        rows,
        c,
        oc,
        1,
        1.0,
        MatRef::new(dout.data(), oc),
        MatRef::new(weight.data(), c),
        if accumulate_dinp { 1.0 } else { 0.0 },
        dinp.data_mut(),
        c,
    )?;

    gemm(
        oc,
        c,
        rows,
        1,
        1.0,
        MatRef::transposed(dout.data(), oc),
        MatRef::new(inp.data(), c),
        1.0,
        dweight.data_mut(),
        c,
    )
}
