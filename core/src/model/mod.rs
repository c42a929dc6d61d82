//! The Llama-style decoder and its training step.
//!
//! [`Llama`] owns one flat buffer per table (parameters, gradients, activations) and a
//! [`ScratchArena`] for the short-lived intermediates. The forward pass keeps one copy of every
//! activation per layer; the backward pass reads those and otherwise works in five slot buffers,
//! so its working memory does not grow with depth.
//!
//! A training step is
//!
//! ```text
//! zero_grad -> forward(inputs, Some(targets)) -> backward -> update
//! ```
//!
//! and [`Phase`] tracks where in that sequence the model is.

pub mod arena;
mod backward;
pub mod config;
mod forward;
pub mod tables;

pub use arena::{ArenaError, Lease, ScratchArena, Slot, SlotSizes};
pub use config::LlamaConfig;
pub use tables::{ActivationTensors, ParameterTensors};

use crate::checkpoint;
use crate::context::ExecutionContext;
use crate::error::{LlamaError, Result};
use crate::kernels::FreqTable;
use crate::optim::{AdamState, AdamW};
use crate::tensor::Shape;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tracing::{debug, info};

/// Where the model is in the training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A forward pass ran; `with_targets` tells whether losses were computed.
    Forward { with_targets: bool },
    /// Gradients of the last forward pass are available.
    Backward,
}

/// Geometry of one forward/backward call.
#[derive(Debug, Clone, Copy)]
struct Dims {
    b: usize,
    t: usize,
    c: usize,
    nh: usize,
    kvh: usize,
    hs: usize,
    h: usize,
    v: usize,
    vp: usize,
    qkv: usize,
    nl: usize,
    eps: f32,
}

impl Dims {
    fn new(cfg: &LlamaConfig, b: usize, t: usize) -> Self {
        Self {
            b,
            t,
            c: cfg.channels,
            nh: cfg.num_heads,
            kvh: cfg.num_kv_heads,
            hs: cfg.head_size(),
            h: cfg.ffn_hidden,
            v: cfg.vocab_size,
            vp: cfg.padded_vocab_size,
            qkv: cfg.qkv_channels(),
            nl: cfg.num_layers,
            eps: cfg.norm_eps,
        }
    }

    /// Elements of one compact `(B, KVH, T, HS)` key or value tensor.
    fn kv_len(&self) -> usize {
        self.b * self.kvh * self.t * self.hs
    }
}

#[derive(Debug)]
struct Activations {
    shapes: ActivationTensors<Shape>,
    data: Vec<f32>,
    b: usize,
    t: usize,
}

#[derive(Debug)]
pub struct Llama {
    config: LlamaConfig,
    ctx: ExecutionContext,
    param_shapes: ParameterTensors<Shape>,
    params: Vec<f32>,
    grads: Option<Vec<f32>>,
    adam: Option<AdamState>,
    freqs: FreqTable,
    acts: Option<Activations>,
    arena: ScratchArena,
    inputs: Vec<u32>,
    targets: Vec<u32>,
    mean_loss: Option<f32>,
    phase: Phase,
}

impl Llama {
    /// Wraps an existing parameter buffer laid out as [`ParameterTensors`].
    pub fn from_parameters(
        config: LlamaConfig,
        params: Vec<f32>,
        ctx: ExecutionContext,
    ) -> Result<Self> {
        config.validate()?;
        let param_shapes = ParameterTensors::for_config(&config);
        if params.len() != param_shapes.numel() {
            return Err(LlamaError::Shape {
                expected: vec![param_shapes.numel()],
                got: vec![params.len()],
            });
        }
        let freqs = FreqTable::new(config.head_size(), config.max_seq_len, config.rope_theta)?;
        info!(
            num_parameters = params.len(),
            layers = config.num_layers,
            heads = config.num_heads,
            kv_heads = config.num_kv_heads,
            channels = config.channels,
            threads = ctx.num_threads(),
            "built model"
        );
        Ok(Self {
            config,
            ctx,
            param_shapes,
            params,
            grads: None,
            adam: None,
            freqs,
            acts: None,
            arena: ScratchArena::new(),
            inputs: Vec::new(),
            targets: Vec::new(),
            mean_loss: None,
            phase: Phase::Idle,
        })
    }

    /// Random initialisation from `seed`.
    ///
    /// Matrices are drawn uniformly with standard deviation `init_std`; the projections that
    /// write into the residual stream are further scaled by `1 / sqrt(2·L)`. Norm weights start at
    /// one, biases and the padded embedding rows at zero.
    pub fn new_random(config: LlamaConfig, seed: u64, ctx: ExecutionContext) -> Result<Self> {
        config.validate()?;
        let shapes = ParameterTensors::for_config(&config);
        let mut params = vec![0.0f32; shapes.numel()];
        let mut rng = StdRng::seed_from_u64(seed);
        // Uniform on [-a, a) has standard deviation a / sqrt(3).
        let bound = config.init_std * 3.0f32.sqrt();
        let residual_scale = 1.0 / (2.0 * config.num_layers as f32).sqrt();
        let real_rows = config.vocab_size * config.channels;

        shapes.split_mut(&mut params)?.map(|name, slice| match name {
            "ln1w" | "ln2w" | "lnfw" => slice.fill(1.0),
            "ln1b" | "ln2b" | "lnfb" => slice.fill(0.0),
            "wte" => {
                for x in &mut slice[..real_rows] {
                    *x = rng.random_range(-bound..bound);
                }
            }
            "attprojw" | "fcprojw" => {
                let a = bound * residual_scale;
                for x in slice.iter_mut() {
                    *x = rng.random_range(-a..a);
                }
            }
            _ => {
                for x in slice.iter_mut() {
                    *x = rng.random_range(-bound..bound);
                }
            }
        });
        Self::from_parameters(config, params, ctx)
    }

    /// Loads a binary checkpoint written by [`Llama::save_checkpoint`].
    pub fn from_checkpoint(path: impl AsRef<Path>, ctx: ExecutionContext) -> Result<Self> {
        let (config, params) = checkpoint::read_checkpoint(path)?;
        Self::from_parameters(config, params, ctx)
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::write_checkpoint(path, &self.config, &self.params)
    }

    /// Writes every parameter tensor under its table name.
    pub fn export_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::export_safetensors(path, &self.param_shapes, &self.params)
    }

    /// Replaces the parameters with the named tensors in a safetensors file.
    pub fn import_safetensors(&mut self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::import_safetensors(path, &self.param_shapes, &mut self.params)?;
        self.phase = Phase::Idle;
        Ok(())
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_parameters(&self) -> usize {
        self.params.len()
    }

    pub fn parameter_shapes(&self) -> &ParameterTensors<Shape> {
        &self.param_shapes
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    /// Gradient buffer; `None` until the first backward pass.
    pub fn grads(&self) -> Option<&[f32]> {
        self.grads.as_deref()
    }

    /// Mean loss of the last forward pass with targets.
    pub fn mean_loss(&self) -> Option<f32> {
        self.mean_loss
    }

    /// `(B, T)` the activations were allocated for.
    pub fn batch_geometry(&self) -> Option<(usize, usize)> {
        self.acts.as_ref().map(|a| (a.b, a.t))
    }

    pub fn arena(&self) -> &ScratchArena {
        &self.arena
    }

    /// Forces the premature-reuse canary on or off.
    pub fn set_arena_poisoning(&mut self, poison: bool) {
        let arena = std::mem::take(&mut self.arena);
        self.arena = arena.with_poisoning(poison);
    }

    fn check_batch(
        &self,
        inputs: &[u32],
        targets: Option<&[u32]>,
        b: usize,
        t: usize,
    ) -> Result<()> {
        if b == 0 || t == 0 || t > self.config.max_seq_len {
            return Err(LlamaError::Shape {
                expected: vec![b.max(1), t.clamp(1, self.config.max_seq_len)],
                got: vec![b, t],
            });
        }
        if let Some(acts) = &self.acts {
            if (acts.b, acts.t) != (b, t) {
                return Err(LlamaError::Shape {
                    expected: vec![acts.b, acts.t],
                    got: vec![b, t],
                });
            }
        }
        let vocab_size = self.config.vocab_size;
        for tokens in std::iter::once(inputs).chain(targets) {
            if tokens.len() != b * t {
                return Err(LlamaError::Shape {
                    expected: vec![b * t],
                    got: vec![tokens.len()],
                });
            }
            if let Some((index, &token)) = tokens
                .iter()
                .enumerate()
                .find(|&(_, &tok)| tok as usize >= vocab_size)
            {
                return Err(LlamaError::TokenOutOfRange {
                    index,
                    token,
                    vocab_size,
                });
            }
        }
        Ok(())
    }

    /// Activations and forward slots, sized once for the first `(B, T)`.
    fn ensure_activations(&mut self, b: usize, t: usize) -> Result<()> {
        if self.acts.is_none() {
            let shapes = ActivationTensors::layout(&self.config, b, t);
            let numel = shapes.checked_numel().ok_or_else(|| {
                LlamaError::Resource(format!("activations for B={b}, T={t} overflow usize"))
            })?;
            info!(b, t, elements = numel, "allocating activations");
            self.acts = Some(Activations {
                shapes,
                data: vec![0.0; numel],
                b,
                t,
            });
        }
        let sizes = SlotSizes::new(&self.config, b, t);
        self.arena.allocate(&sizes, &[Slot::Output, Slot::Bt4c]);
        Ok(())
    }

    /// Runs the model on `inputs` (`B·T` token ids, row-major).
    ///
    /// With `targets` the per-position cross-entropy is computed and its mean returned. The
    /// logits stay available through [`Llama::logits`] until the next backward pass.
    pub fn forward(
        &mut self,
        inputs: &[u32],
        targets: Option<&[u32]>,
        b: usize,
        t: usize,
    ) -> Result<Option<f32>> {
        self.check_batch(inputs, targets, b, t)?;
        self.ensure_activations(b, t)?;
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
        self.targets.clear();
        if let Some(targets) = targets {
            self.targets.extend_from_slice(targets);
        }
        self.phase = Phase::Idle;
        self.mean_loss = None;

        let ctx = self.ctx.clone();
        let loss = ctx.install(|| self.run_forward(targets.is_some()))?;
        if let Some(loss) = loss {
            debug!(loss, "forward");
        }
        self.mean_loss = loss;
        self.phase = Phase::Forward {
            with_targets: targets.is_some(),
        };
        Ok(loss)
    }

    fn run_forward(&mut self, with_targets: bool) -> Result<Option<f32>> {
        let Llama {
            config,
            param_shapes,
            params,
            freqs,
            acts,
            arena,
            inputs,
            targets,
            ..
        } = self;
        let acts = acts
            .as_mut()
            .ok_or(LlamaError::State("activations are not allocated"))?;
        let dims = Dims::new(config, acts.b, acts.t);
        let p = param_shapes.split(params.as_slice())?;
        let mut a = acts.shapes.split_mut(&mut acts.data)?;

        forward::forward(&dims, &p, &mut a, freqs, inputs, arena)?;
        if !with_targets {
            return Ok(None);
        }
        // The logits stay in the slot for the backward pass.
        forward::staged_retained(arena, Slot::Output, "loss", |_, logits| {
            forward::loss(&dims, logits, targets, a.losses)
        })
        .map(Some)
    }

    /// Sets every gradient to zero. Call at the start of each step; backward accumulates.
    pub fn zero_grad(&mut self) {
        if let Some(grads) = &mut self.grads {
            grads.fill(0.0);
        }
    }

    /// Accumulates the gradient of the mean loss of the last forward pass.
    pub fn backward(&mut self) -> Result<()> {
        if self.phase != (Phase::Forward { with_targets: true }) {
            return Err(LlamaError::State(
                "backward needs a preceding forward pass with targets",
            ));
        }
        let (b, t) = self
            .batch_geometry()
            .ok_or(LlamaError::State("activations are not allocated"))?;
        if self.grads.is_none() {
            info!(elements = self.params.len(), "allocating gradients");
            self.grads = Some(vec![0.0; self.params.len()]);
        }
        let sizes = SlotSizes::new(&self.config, b, t);
        self.arena
            .allocate(&sizes, &[Slot::Btc, Slot::DAtt, Slot::DResidual]);

        let ctx = self.ctx.clone();
        ctx.install(|| self.run_backward())?;
        self.phase = Phase::Backward;
        Ok(())
    }

    fn run_backward(&mut self) -> Result<()> {
        let Llama {
            config,
            param_shapes,
            params,
            grads,
            freqs,
            acts,
            arena,
            inputs,
            targets,
            ..
        } = self;
        let acts = acts
            .as_ref()
            .ok_or(LlamaError::State("activations are not allocated"))?;
        let grads = grads
            .as_mut()
            .ok_or(LlamaError::State("gradients are not allocated"))?;
        let dims = Dims::new(config, acts.b, acts.t);
        let p = param_shapes.split(params.as_slice())?;
        let mut g = param_shapes.split_mut(grads)?;
        let a = acts.shapes.split(&acts.data)?;

        backward::backward(&dims, &p, &mut g, &a, freqs, inputs, targets, arena)
    }

    /// One AdamW step at 1-based step index `step`. Returns the gradient norm.
    pub fn update(&mut self, optimizer: &AdamW, step: usize) -> Result<f32> {
        if self.phase != Phase::Backward {
            return Err(LlamaError::State("update needs a preceding backward pass"));
        }
        let grads = self
            .grads
            .as_deref()
            .ok_or(LlamaError::State("gradients are not allocated"))?;
        let state = self
            .adam
            .get_or_insert_with(|| AdamState::new(self.params.len()));
        let params = &mut self.params;
        let norm = self
            .ctx
            .install(|| optimizer.step(params, grads, state, step))?;
        debug!(step, grad_norm = norm, lr = optimizer.learning_rate, "update");
        self.phase = Phase::Idle;
        Ok(norm)
    }

    /// The `vocab_size` logits at position `t` of sequence `b` from the last forward pass.
    pub fn logits(&self, b: usize, t: usize) -> Result<&[f32]> {
        if !matches!(self.phase, Phase::Forward { .. }) {
            return Err(LlamaError::State("logits need a preceding forward pass"));
        }
        let (nb, nt) = self
            .batch_geometry()
            .ok_or(LlamaError::State("activations are not allocated"))?;
        if b >= nb || t >= nt {
            return Err(LlamaError::Shape {
                expected: vec![nb, nt],
                got: vec![b, t],
            });
        }
        let logits = self
            .arena
            .peek(Slot::Output)
            .ok_or(LlamaError::State("logits slot is in use"))?;
        let start = (b * nt + t) * self.config.padded_vocab_size;
        Ok(&logits[start..start + self.config.vocab_size])
    }

    /// Per-position losses `(B, T)` of the last forward pass with targets.
    pub fn losses(&self) -> Option<&[f32]> {
        if self.phase != (Phase::Forward { with_targets: true }) {
            return None;
        }
        let acts = self.acts.as_ref()?;
        let offsets = acts.shapes.offsets();
        let len = acts.shapes.losses.numel();
        Some(&acts.data[offsets.losses..offsets.losses + len])
    }
}
