use super::Dims;
use super::arena::{ScratchArena, Slot};
use super::forward::{staged, staged_retained, view, view_mut};
use super::tables::{ActivationTensors, ParameterTensors, layer, layer_mut};
use crate::error::Result;
use crate::kernels::{
    FreqTable, attention_backward, crossentropy_softmax_backward, encoder_backward,
    linear_backward, permute_qkv_backward, reduce_kv, rmsnorm_backward, rope_backward,
    swiglu_backward, unpermute_backward,
};

/// Accumulates the gradient of the mean loss into `g`.
///
/// Layers are walked from last to first. Besides the per-layer activations of the forward pass
/// only the five arena slots are used, whatever the depth. `Output` must still hold the logits.
#[allow(clippy::too_many_arguments)]
pub(super) fn backward(
    d: &Dims,
    p: &ParameterTensors<&[f32]>,
    g: &mut ParameterTensors<&mut [f32]>,
    a: &ActivationTensors<&[f32]>,
    freqs: &FreqTable,
    inputs: &[u32],
    targets: &[u32],
    arena: &mut ScratchArena,
) -> Result<()> {
    let Dims {
        b,
        t,
        c,
        nh,
        kvh,
        hs,
        h,
        v: vocab,
        vp,
        qkv,
        nl,
        ..
    } = *d;
    let bt = b * t;
    let btc = bt * c;
    let kv_len = d.kv_len();

    staged(arena, Slot::DResidual, "residual gradient", |arena, dresidual| {
        let dresidual = &mut dresidual[..btc];
        dresidual.fill(0.0);

        staged_retained(arena, Slot::Output, "classifier backward", |arena, output| {
            let logits = &mut output[..bt * vp];
            crossentropy_softmax_backward(
                view_mut(logits, [b, t, vp])?,
                targets,
                vocab,
                1.0 / bt as f32,
            );
            staged(arena, Slot::Btc, "final norm gradient", |_, dbtc| {
                let dbtc = &mut dbtc[..btc];
                linear_backward(
                    view_mut(dbtc, [b, t, c])?,
                    view_mut(g.wte, [vp, c])?,
                    view(logits, [b, t, vp])?,
                    view(a.lnf, [b, t, c])?,
                    view(p.wte, [vp, c])?,
                    false,
                )?;
                rmsnorm_backward(
                    view_mut(dresidual, [b, t, c])?,
                    view_mut(g.lnfw, [c])?,
                    view_mut(g.lnfb, [c])?,
                    view(dbtc, [b, t, c])?,
                    view(layer(a.residual3, nl - 1, nl), [b, t, c])?,
                    view(p.lnfw, [c])?,
                    view(a.lnf_rstd, [b, t])?,
                );
                Ok(())
            })
        })?;

        for l in (0..nl).rev() {
            let residual = if l == 0 {
                a.encoded
            } else {
                layer(a.residual3, l - 1, nl)
            };
            let residual2 = layer(a.residual2, l, nl);
            let ln1 = layer(a.ln1, l, nl);
            let ln2 = layer(a.ln2, l, nl);

            // Feed-forward block. `dresidual` holds the gradient of this layer's output.
            staged(arena, Slot::Bt4c, "ffn gradient", |arena, bt4c| {
                let (d_gate, rest) = bt4c.split_at_mut(bt * h);
                let d_up = &mut rest[..bt * h];
                linear_backward(
                    view_mut(d_gate, [b, t, h])?,
                    view_mut(layer_mut(g.fcprojw, l, nl), [c, h])?,
                    view(dresidual, [b, t, c])?,
                    view(layer(a.fch_swiglu, l, nl), [b, t, h])?,
                    view(layer(p.fcprojw, l, nl), [c, h])?,
                    false,
                )?;
                swiglu_backward(
                    view_mut(d_gate, [b, t, h])?,
                    view_mut(d_up, [b, t, h])?,
                    view(layer(a.fch_up, l, nl), [b, t, h])?,
                    view(layer(a.fch_gate, l, nl), [b, t, h])?,
                );
                staged(arena, Slot::Btc, "ffn input gradient", |_, dbtc| {
                    let dbtc = &mut dbtc[..btc];
                    linear_backward(
                        view_mut(dbtc, [b, t, c])?,
                        view_mut(layer_mut(g.fc_upw, l, nl), [h, c])?,
                        view(d_up, [b, t, h])?,
                        view(ln2, [b, t, c])?,
                        view(layer(p.fc_upw, l, nl), [h, c])?,
                        false,
                    )?;
                    linear_backward(
                        view_mut(dbtc, [b, t, c])?,
                        view_mut(layer_mut(g.fc_gatew, l, nl), [h, c])?,
                        view(d_gate, [b, t, h])?,
                        view(ln2, [b, t, c])?,
                        view(layer(p.fc_gatew, l, nl), [h, c])?,
                        true,
                    )?;
                    rmsnorm_backward(
                        view_mut(dresidual, [b, t, c])?,
                        view_mut(layer_mut(g.ln2w, l, nl), [c])?,
                        view_mut(layer_mut(g.ln2b, l, nl), [c])?,
                        view(dbtc, [b, t, c])?,
                        view(residual2, [b, t, c])?,
                        view(layer(p.ln2w, l, nl), [c])?,
                        view(layer(a.ln2_rstd, l, nl), [b, t])?,
                    );
                    Ok(())
                })
            })?;

            // Attention block. `dresidual` now holds the gradient of `residual2`. Bt4c holds
            // dq in block 0 and the expanded dk/dv in blocks 1 and 2.
            staged(arena, Slot::Bt4c, "attention gradient", |arena, bt4c| {
                staged(arena, Slot::Output, "head gradient", |arena, output| {
                    let dout_heads = &mut output[..btc];
                    staged(arena, Slot::Btc, "attention output gradient", |_, dbtc| {
                        let dbtc = &mut dbtc[..btc];
                        linear_backward(
                            view_mut(dbtc, [b, t, c])?,
                            view_mut(layer_mut(g.attprojw, l, nl), [c, c])?,
                            view(dresidual, [b, t, c])?,
                            view(layer(a.atty, l, nl), [b, t, c])?,
                            view(layer(p.attprojw, l, nl), [c, c])?,
                            false,
                        )?;
                        unpermute_backward(
                            view(dbtc, [b, t, c])?,
                            view_mut(&mut *dout_heads, [b, nh, t, hs])?,
                        );
                        Ok(())
                    })?;

                    let (q, rest) = layer(a.qkvr, l, nl).split_at(btc);
                    let (k_exp, v_exp) = rest.split_at(btc);
                    let (dq, rest) = bt4c.split_at_mut(btc);
                    let (dk_exp, rest) = rest.split_at_mut(btc);
                    let dv_exp = &mut rest[..btc];
                    staged(arena, Slot::DAtt, "score gradient", |_, datt| {
                        attention_backward(
                            view(dout_heads, [b, nh, t, hs])?,
                            view(q, [b, nh, t, hs])?,
                            view(k_exp, [b, nh, t, hs])?,
                            view(v_exp, [b, nh, t, hs])?,
                            view(layer(a.att, l, nl), [b, nh, t, t])?,
                            view_mut(&mut datt[..b * nh * t * t], [b, nh, t, t])?,
                            view_mut(dq, [b, nh, t, hs])?,
                            view_mut(dk_exp, [b, nh, t, hs])?,
                            view_mut(dv_exp, [b, nh, t, hs])?,
                        )?;
                        Ok(())
                    })
                })?;

                // Query heads sharing a kv head sum back into it.
                staged(arena, Slot::Output, "kv gradient", |_, output| {
                    let (dk, rest) = output.split_at_mut(kv_len);
                    let dv = &mut rest[..kv_len];
                    {
                        let (dq, rest) = bt4c.split_at_mut(btc);
                        let (dk_exp, rest) = rest.split_at_mut(btc);
                        let dv_exp = &rest[..btc];
                        rope_backward(view_mut(dq, [b, nh, t, hs])?, freqs);
                        reduce_kv(view(dk_exp, [b, nh, t, hs])?, view_mut(dk, [b, kvh, t, hs])?);
                        reduce_kv(view(dv_exp, [b, nh, t, hs])?, view_mut(dv, [b, kvh, t, hs])?);
                    }
                    rope_backward(view_mut(dk, [b, kvh, t, hs])?, freqs);

                    // dq stays in block 0; the fused gradient overwrites the expanded dk/dv.
                    let (dq, rest) = bt4c.split_at_mut(btc);
                    permute_qkv_backward(
                        view(dq, [b, nh, t, hs])?,
                        view(dk, [b, kvh, t, hs])?,
                        view(dv, [b, kvh, t, hs])?,
                        view_mut(&mut rest[..bt * qkv], [b, t, qkv])?,
                    );
                    Ok(())
                })?;

                let dqkv = &bt4c[btc..btc + bt * qkv];
                staged(arena, Slot::Btc, "attention input gradient", |_, dbtc| {
                    let dbtc = &mut dbtc[..btc];
                    linear_backward(
                        view_mut(dbtc, [b, t, c])?,
                        view_mut(layer_mut(g.qkvw, l, nl), [qkv, c])?,
                        view(dqkv, [b, t, qkv])?,
                        view(ln1, [b, t, c])?,
                        view(layer(p.qkvw, l, nl), [qkv, c])?,
                        false,
                    )?;
                    rmsnorm_backward(
                        view_mut(dresidual, [b, t, c])?,
                        view_mut(layer_mut(g.ln1w, l, nl), [c])?,
                        view_mut(layer_mut(g.ln1b, l, nl), [c])?,
                        view(dbtc, [b, t, c])?,
                        view(residual, [b, t, c])?,
                        view(layer(p.ln1w, l, nl), [c])?,
                        view(layer(a.ln1_rstd, l, nl), [b, t])?,
                    );
                    Ok(())
                })
            })?;
        }

        encoder_backward(view_mut(g.wte, [vp, c])?, view(dresidual, [b, t, c])?, inputs);
        Ok(())
    })
}
