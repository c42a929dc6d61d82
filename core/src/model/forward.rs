use super::Dims;
use super::arena::{ScratchArena, Slot};
use super::tables::{ActivationTensors, ParameterTensors, layer, layer_mut};
use crate::error::Result;
use crate::kernels::{
    FreqTable, attention_forward, crossentropy_forward, encoder_forward, expand_kv,
    linear_forward, permute_qkv, residual_forward, rmsnorm_forward, rope_forward, swiglu_forward,
    unpermute,
};
use crate::tensor::{View, ViewMut};

pub(super) fn view<const R: usize>(data: &[f32], shape: [usize; R]) -> Result<View<'_, f32, R>> {
    Ok(View::new(data, shape)?)
}

pub(super) fn view_mut<const R: usize>(
    data: &mut [f32],
    shape: [usize; R],
) -> Result<ViewMut<'_, f32, R>> {
    Ok(ViewMut::new(data, shape)?)
}

/// Runs `f` on `slot` leased for `stage`, putting the slot back whether or not `f` succeeds.
///
/// The lease starts poisoned when the arena poisons, so `f` must write everything it reads.
pub(super) fn staged<T>(
    arena: &mut ScratchArena,
    slot: Slot,
    stage: &'static str,
    f: impl FnOnce(&mut ScratchArena, &mut [f32]) -> Result<T>,
) -> Result<T> {
    let mut lease = arena.lease(slot, stage)?;
    let result = f(arena, &mut lease);
    arena.restore(lease)?;
    result
}

/// [`staged`], but the slot keeps what the previous stage left in it.
pub(super) fn staged_retained<T>(
    arena: &mut ScratchArena,
    slot: Slot,
    stage: &'static str,
    f: impl FnOnce(&mut ScratchArena, &mut [f32]) -> Result<T>,
) -> Result<T> {
    let mut lease = arena.lease_retained(slot, stage)?;
    let result = f(arena, &mut lease);
    arena.restore(lease)?;
    result
}

/// Runs every layer and the classifier head.
///
/// Intermediates go through `Output` and `Bt4c`, one lease per stage. On return `Output` starts
/// with the `(B, T, Vp)` logits.
pub(super) fn forward(
    d: &Dims,
    p: &ParameterTensors<&[f32]>,
    a: &mut ActivationTensors<&mut [f32]>,
    freqs: &FreqTable,
    inputs: &[u32],
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
        vp,
        qkv,
        nl,
        eps,
        ..
    } = *d;
    let bt = b * t;
    let btc = bt * c;
    let kv_len = d.kv_len();

    encoder_forward(view_mut(a.encoded, [b, t, c])?, inputs, view(p.wte, [vp, c])?);

    for l in 0..nl {
        let residual: &[f32] = if l == 0 {
            &*a.encoded
        } else {
            layer(a.residual3, l - 1, nl)
        };

        rmsnorm_forward(
            view(residual, [b, t, c])?,
            view(layer(p.ln1w, l, nl), [c])?,
            view(layer(p.ln1b, l, nl), [c])?,
            eps,
            view_mut(layer_mut(a.ln1, l, nl), [b, t, c])?,
            view_mut(layer_mut(a.ln1_rstd, l, nl), [b, t])?,
        );

        staged(arena, Slot::Output, "qkv projection", |arena, scratch| {
            let fused = &mut scratch[..bt * qkv];
            linear_forward(
                view_mut(fused, [b, t, qkv])?,
                view(layer(a.ln1, l, nl), [b, t, c])?,
                view(layer(p.qkvw, l, nl), [qkv, c])?,
            )?;

            // Compact k/v live in Bt4c only until they are broadcast to every query head.
            staged(arena, Slot::Bt4c, "kv heads", |_, heads| {
                let (q, rest) = layer_mut(a.qkvr, l, nl).split_at_mut(btc);
                let (k_exp, v_exp) = rest.split_at_mut(btc);
                let (k, rest) = heads.split_at_mut(kv_len);
                let v = &mut rest[..kv_len];
                permute_qkv(
                    view(fused, [b, t, qkv])?,
                    view_mut(q, [b, nh, t, hs])?,
                    view_mut(k, [b, kvh, t, hs])?,
                    view_mut(v, [b, kvh, t, hs])?,
                );

                rope_forward(view_mut(q, [b, nh, t, hs])?, freqs);
                rope_forward(view_mut(k, [b, kvh, t, hs])?, freqs);

                expand_kv(view(k, [b, kvh, t, hs])?, view_mut(k_exp, [b, nh, t, hs])?);
                expand_kv(view(v, [b, kvh, t, hs])?, view_mut(v_exp, [b, nh, t, hs])?);
                Ok(())
            })
        })?;

        staged(arena, Slot::Bt4c, "attention output", |arena, heads| {
            let out = &mut heads[..btc];
            staged(arena, Slot::Output, "attention scores", |_, scores| {
                let (q, rest) = layer(a.qkvr, l, nl).split_at(btc);
                let (k_exp, v_exp) = rest.split_at(btc);
                attention_forward(
                    view(q, [b, nh, t, hs])?,
                    view(k_exp, [b, nh, t, hs])?,
                    view(v_exp, [b, nh, t, hs])?,
                    view_mut(&mut scores[..b * nh * t * t], [b, nh, t, t])?,
                    view_mut(layer_mut(a.att, l, nl), [b, nh, t, t])?,
                    view_mut(&mut *out, [b, nh, t, hs])?,
                )?;
                Ok(())
            })?;
            unpermute(
                view(out, [b, nh, t, hs])?,
                view_mut(layer_mut(a.atty, l, nl), [b, t, c])?,
            );
            Ok(())
        })?;

        staged(arena, Slot::Output, "attention projection", |_, scratch| {
            let proj = &mut scratch[..btc];
            linear_forward(
                view_mut(proj, [b, t, c])?,
                view(layer(a.atty, l, nl), [b, t, c])?,
                view(layer(p.attprojw, l, nl), [c, c])?,
            )?;
            residual_forward(
                view_mut(layer_mut(a.residual2, l, nl), [b, t, c])?,
                view(residual, [b, t, c])?,
                view(proj, [b, t, c])?,
            );
            Ok(())
        })?;

        rmsnorm_forward(
            view(layer(a.residual2, l, nl), [b, t, c])?,
            view(layer(p.ln2w, l, nl), [c])?,
            view(layer(p.ln2b, l, nl), [c])?,
            eps,
            view_mut(layer_mut(a.ln2, l, nl), [b, t, c])?,
            view_mut(layer_mut(a.ln2_rstd, l, nl), [b, t])?,
        );
        let ln2 = layer(a.ln2, l, nl);

        linear_forward(
            view_mut(layer_mut(a.fch_up, l, nl), [b, t, h])?,
            view(ln2, [b, t, c])?,
            view(layer(p.fc_upw, l, nl), [h, c])?,
        )?;
        linear_forward(
            view_mut(layer_mut(a.fch_gate, l, nl), [b, t, h])?,
            view(ln2, [b, t, c])?,
            view(layer(p.fc_gatew, l, nl), [h, c])?,
        )?;
        swiglu_forward(
            view(layer(a.fch_up, l, nl), [b, t, h])?,
            view(layer(a.fch_gate, l, nl), [b, t, h])?,
            view_mut(layer_mut(a.fch_swiglu, l, nl), [b, t, h])?,
        );

        staged(arena, Slot::Output, "ffn projection", |_, scratch| {
            let proj = &mut scratch[..btc];
            linear_forward(
                view_mut(proj, [b, t, c])?,
                view(layer(a.fch_swiglu, l, nl), [b, t, h])?,
                view(layer(p.fcprojw, l, nl), [c, h])?,
            )?;
            residual_forward(
                view_mut(layer_mut(a.residual3, l, nl), [b, t, c])?,
                view(layer(a.residual2, l, nl), [b, t, c])?,
                view(proj, [b, t, c])?,
            );
            Ok(())
        })?;
    }

    rmsnorm_forward(
        view(layer(a.residual3, nl - 1, nl), [b, t, c])?,
        view(p.lnfw, [c])?,
        view(p.lnfb, [c])?,
        eps,
        view_mut(a.lnf, [b, t, c])?,
        view_mut(a.lnf_rstd, [b, t])?,
    );
    staged(arena, Slot::Output, "classifier", |_, scratch| {
        linear_forward(
            view_mut(&mut scratch[..bt * vp], [b, t, vp])?,
            view(a.lnf, [b, t, c])?,
            view(p.wte, [vp, c])?,
        )?;
        Ok(())
    })
}

/// Per-position losses from the logits left by [`forward`]; returns their mean.
pub(super) fn loss(
    d: &Dims,
    logits: &[f32],
    targets: &[u32],
    losses: &mut [f32],
) -> Result<f32> {
    let (b, t) = (d.b, d.t);
    crossentropy_forward(
        view(&logits[..b * t * d.vp], [b, t, d.vp])?,
        targets,
        d.v,
        view_mut(losses, [b, t])?,
    );
    Ok(losses.iter().sum::<f32>() / (b * t) as f32)
}
