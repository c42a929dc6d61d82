use crate::tensor::{View, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

/// Epsilon used by every RMSNorm in the model.
pub const RMSNORM_EPS: f32 = 1e-5;

/// RMSNorm forward with a learned scale and shift.
///
/// Per row (fixed batch element and position):
///
/// $$ \mathrm{rms} = \sqrt{\tfrac{1}{C}\sum_i x_i^2 + \epsilon}, \qquad y_i = \frac{x_i}{\mathrm{rms}} w_i + b_i $$
///
/// `rstd` receives `1 / rms` per row for the backward pass.
pub fn rmsnorm_forward(
    inp: View<'_, f32, 3>,
    weight: View<'_, f32, 1>,
    bias: View<'_, f32, 1>,
    eps: f32,
    mut out: ViewMut<'_, f32, 3>,
    mut rstd: ViewMut<'_, f32, 2>,
) {
    let [b, t, c] = *inp.shape();
    assert_eq!(out.shape(), inp.shape(), "rmsnorm output differs in shape");
    assert_eq!(rstd.shape(), &[b, t], "rmsnorm rstd must be [B, T]");
    assert_eq!(weight.shape(), &[c], "rmsnorm weight must be [C]");
    assert_eq!(bias.shape(), &[c], "rmsnorm bias must be [C]");
    if c == 0 {
        return;
    }
    let (w, bs) = (weight.data(), bias.data());

    let norm_row = |((out_row, r), in_row): ((&mut [f32], &mut f32), &[f32])| {
        let mean_sq = in_row.iter().map(|x| x * x).sum::<f32>() / c as f32;
        let s = 1.0 / (mean_sq + eps).sqrt();
        for i in 0..c {
            out_row[i] = in_row[i] * s * w[i] + bs[i];
        }
        *r = s;
    };

    let inp = inp.data();
    if inp.len() >= PARALLEL_THRESHOLD {
        out.data_mut()
            .par_chunks_mut(c)
            .zip(rstd.data_mut().par_iter_mut())
            .zip(inp.par_chunks(c))
            .for_each(norm_row);
    } else {
        out.data_mut()
            .chunks_mut(c)
            .zip(rstd.data_mut().iter_mut())
            .zip(inp.chunks(c))
            .for_each(norm_row);
    }
}

/// RMSNorm backward.
///
/// All three outputs **accumulate**:
///
/// - `dinp += dout · w · rstd + drms · x`, with `drms = -rstd³ / C · Σ_j x_j · dout_j · w_j`;
///   `dinp` is the residual-stream gradient, which also carries the skip connection.
/// - `dweight += Σ_rows dout · x · rstd` and `dbias += Σ_rows dout`.
///
/// The parameter gradients are reduced per channel over rows in a fixed order, so the result
/// does not depend on how work is split across threads.
#[allow(clippy::too_many_arguments)]
pub fn rmsnorm_backward(
    mut dinp: ViewMut<'_, f32, 3>,
    mut dweight: ViewMut<'_, f32, 1>,
    mut dbias: ViewMut<'_, f32, 1>,
    dout: View<'_, f32, 3>,
    inp: View<'_, f32, 3>,
    weight: View<'_, f32, 1>,
    rstd: View<'_, f32, 2>,
) {
    let [b, t, c] = *inp.shape();
    assert_eq!(dout.shape(), inp.shape(), "rmsnorm dout differs in shape");
    assert_eq!(dinp.shape(), inp.shape(), "rmsnorm dinp differs in shape");
    assert_eq!(rstd.shape(), &[b, t], "rmsnorm rstd must be [B, T]");
    assert_eq!(weight.shape(), &[c], "rmsnorm weight must be [C]");
    assert_eq!(dweight.shape(), &[c], "rmsnorm dweight must be [C]");
    assert_eq!(dbias.shape(), &[c], "rmsnorm dbias must be [C]");
    if c == 0 {
        return;
    }
    let (x, dy, w, rs) = (inp.data(), dout.data(), weight.data(), rstd.data());
    let rows = b * t;

    let input_grad = |((di, (xr, dyr)), &s): ((&mut [f32], (&[f32], &[f32])), &f32)| {
        let dot: f32 = (0..c).map(|i| xr[i] * dyr[i] * w[i]).sum();
        let drms = -dot * s * s * s / c as f32;
        for i in 0..c {
            di[i] += dyr[i] * w[i] * s + drms * xr[i];
        }
    };
    let param_grad = |(ch, (dw, db)): (usize, (&mut f32, &mut f32))| {
        let (mut sw, mut sb) = (0.0f32, 0.0f32);
        for r in 0..rows {
            let g = dy[r * c + ch];
            sw += g * x[r * c + ch] * rs[r];
            sb += g;
        }
        *dw += sw;
        *db += sb;
    };

    if x.len() >= PARALLEL_THRESHOLD {
        dinp.data_mut()
            .par_chunks_mut(c)
            .zip(x.par_chunks(c).zip(dy.par_chunks(c)))
            .zip(rs.par_iter())
            .for_each(input_grad);
        dweight
            .data_mut()
            .par_iter_mut()
            .zip(dbias.data_mut().par_iter_mut())
            .enumerate()
            .for_each(param_grad);
    } else {
        dinp.data_mut()
            .chunks_mut(c)
            .zip(x.chunks(c).zip(dy.chunks(c)))
            .zip(rs.iter())
            .for_each(input_grad);
        dweight
            .data_mut()
            .iter_mut()
            .zip(dbias.data_mut().iter_mut())
            .enumerate()
            .for_each(param_grad);
    }
}
