use crate::error::{LlamaError, Result};
use crate::kernels::RMSNORM_EPS;
use crate::model::tables::ParameterTensors;

/// Longest context a model can be built for. The RoPE table holds `max_seq_len · HS/2` angles.
pub const MAX_SEQ_LEN: usize = 1 << 20;

/// Hyper-parameters of a Llama-style decoder.
///
/// Notation used throughout the crate: `L` layers, `C` channels, `NH` query heads, `KVH`
/// key/value heads, `HS = C / NH` head size, `H` feed-forward hidden size, `V` vocabulary size and
/// `Vp` the vocabulary padded up for friendlier matrix shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct LlamaConfig {
    pub max_seq_len: usize,
    pub vocab_size: usize,
    pub padded_vocab_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub channels: usize,
    pub ffn_hidden: usize,
    pub rope_theta: f32,
    pub norm_eps: f32,
    /// Standard deviation of the random weight initialisation.
    pub init_std: f32,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self::gqa_768()
    }
}

impl LlamaConfig {
    /// 768 channels, 12 query heads sharing 6 key/value heads.
    pub fn gqa_768() -> Self {
        Self {
            max_seq_len: 1024,
            vocab_size: 50257,
            padded_vocab_size: 50304,
            num_layers: 12,
            num_heads: 12,
            num_kv_heads: 6,
            channels: 768,
            ffn_hidden: 4 * 768,
            rope_theta: 10000.0,
            norm_eps: RMSNORM_EPS,
            init_std: 0.02,
        }
    }

    pub fn tiny_test() -> Self {
        Self {
            max_seq_len: 32,
            vocab_size: 64,
            padded_vocab_size: 64,
            num_layers: 2,
            num_heads: 4,
            num_kv_heads: 2,
            channels: 64,
            ffn_hidden: 128,
            rope_theta: 10000.0,
            norm_eps: RMSNORM_EPS,
            init_std: 0.02,
        }
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    /// Sets the vocabulary and pads it up to the next multiple of 64.
    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self.padded_vocab_size = vocab_size.div_ceil(64) * 64;
        self
    }

    pub fn with_padded_vocab_size(mut self, padded_vocab_size: usize) -> Self {
        self.padded_vocab_size = padded_vocab_size;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_heads(mut self, num_heads: usize, num_kv_heads: usize) -> Self {
        self.num_heads = num_heads;
        self.num_kv_heads = num_kv_heads;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_ffn_hidden(mut self, ffn_hidden: usize) -> Self {
        self.ffn_hidden = ffn_hidden;
        self
    }

    pub fn with_rope_theta(mut self, rope_theta: f32) -> Self {
        self.rope_theta = rope_theta;
        self
    }

    pub fn with_init_std(mut self, init_std: f32) -> Self {
        self.init_std = init_std;
        self
    }

    pub fn head_size(&self) -> usize {
        self.channels / self.num_heads
    }

    /// Query heads per key/value head.
    pub fn queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Width of the fused projection row: `(NH + 2·KVH)·HS`.
    pub fn qkv_channels(&self) -> usize {
        (self.num_heads + 2 * self.num_kv_heads) * self.head_size()
    }

    /// Checks every structural requirement of the model.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("max_seq_len", self.max_seq_len),
            ("vocab_size", self.vocab_size),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("channels", self.channels),
            ("ffn_hidden", self.ffn_hidden),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(LlamaError::Config(format!("{name} must be non-zero")));
        }
        if self.channels % self.num_heads != 0 {
            return Err(LlamaError::Config(format!(
                "channels ({}) must be divisible by num_heads ({})",
                self.channels, self.num_heads
            )));
        }
        if self.head_size() % 2 != 0 {
            return Err(LlamaError::Config(format!(
                "head size ({}) must be even for RoPE",
                self.head_size()
            )));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(LlamaError::Config(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.padded_vocab_size < self.vocab_size {
            return Err(LlamaError::Config(format!(
                "padded_vocab_size ({}) is smaller than vocab_size ({})",
                self.padded_vocab_size, self.vocab_size
            )));
        }
        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            return Err(LlamaError::Config(format!(
                "rope_theta must be positive, got {}",
                self.rope_theta
            )));
        }
        if !(self.norm_eps.is_finite() && self.norm_eps > 0.0) {
            return Err(LlamaError::Config(format!(
                "norm_eps must be positive, got {}",
                self.norm_eps
            )));
        }
        if self.max_seq_len > MAX_SEQ_LEN {
            return Err(LlamaError::Config(format!(
                "max_seq_len ({}) exceeds {MAX_SEQ_LEN}",
                self.max_seq_len
            )));
        }
        // Checkpoints store every parameter as four bytes.
        let param_bytes = ParameterTensors::for_config(self)
            .checked_numel()
            .and_then(|n| n.checked_mul(4));
        if param_bytes.is_none() {
            return Err(LlamaError::Config(
                "parameter count overflows the address space".into(),
            ));
        }
        Ok(())
    }
}
