use crate::tensor::{Result, Tensor, TensorError, ViewMut};
use gqa_train_kernels::PARALLEL_THRESHOLD;
use rayon::prelude::*;

/// Precomputed RoPE rotation angles.
///
/// # What is RoPE?
///
/// RoPE encodes position information by rotating pairs of Query/Key channels:
///
/// $$ \begin{pmatrix} x_i' \\ x_{i+d}' \end{pmatrix} = \begin{pmatrix} \cos \phi & -\sin \phi \\ \sin \phi & \cos \phi \end{pmatrix} \begin{pmatrix} x_i \\ x_{i+d} \end{pmatrix}, \quad \phi = t \cdot \theta^{-2i/HS} $$
///
/// with `d = HS / 2`. Channel `i` is paired with channel `i + d` (the "rotate half" layout), not
/// with its neighbour.
///
/// The table depends only on `(head_size, max_seq_len, theta)`. It is built once with the model
/// and shared read-only by every layer and every step; a call with a shorter sequence simply
/// reads the first `T` rows.
#[derive(Debug, Clone)]
pub struct FreqTable {
    cos: Tensor<f32, 2>,
    sin: Tensor<f32, 2>,
    head_size: usize,
    theta: f32,
}

impl FreqTable {
    /// Builds `cos[t, i]` and `sin[t, i]` for `t < max_seq_len`, `i < head_size / 2`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` if `head_size` is odd.
    pub fn new(head_size: usize, max_seq_len: usize, theta: f32) -> Result<Self> {
        if head_size % 2 != 0 {
            return Err(TensorError::Unsupported(format!(
                "RoPE needs an even head size, got {head_size}"
            )));
        }
        let half = head_size / 2;
        let mut cos = Tensor::zeros([max_seq_len, half]);
        let mut sin = Tensor::zeros([max_seq_len, half]);

        let theta64 = theta as f64;
        let freqs: Vec<f64> = (0..half)
            .map(|i| theta64.powf(-((2 * i) as f64) / head_size as f64))
            .collect();

        for (t, (cos_row, sin_row)) in cos
            .data_mut()
            .chunks_mut(half.max(1))
            .zip(sin.data_mut().chunks_mut(half.max(1)))
            .enumerate()
        {
            for (i, &freq) in freqs.iter().enumerate() {
                let angle = t as f64 * freq;
                cos_row[i] = angle.cos() as f32;
                sin_row[i] = angle.sin() as f32;
            }
        }

        Ok(Self {
            cos,
            sin,
            head_size,
            theta,
        })
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.shape()[0]
    }

    pub fn theta(&self) -> f32 {
        self.theta
    }

    pub fn cos(&self) -> &Tensor<f32, 2> {
        &self.cos
    }

    pub fn sin(&self) -> &Tensor<f32, 2> {
        &self.sin
    }
}

/// Rotates `x` of shape `[B, H, T, HS]` in place by the angles of its positions.
pub fn rope_forward(x: ViewMut<'_, f32, 4>, freqs: &FreqTable) {
    rotate(x, freqs, 1.0);
}

/// Backward of [`rope_forward`]: applies the inverse (transposed) rotation to a gradient in place.
///
/// The rotation is orthogonal, so its adjoint is its inverse and the frequency table itself
/// receives no gradient.
pub fn rope_backward(dx: ViewMut<'_, f32, 4>, freqs: &FreqTable) {
    rotate(dx, freqs, -1.0);
}

fn rotate(mut x: ViewMut<'_, f32, 4>, freqs: &FreqTable, sign: f32) {
    let [_, _, t_len, hs] = *x.shape();
    assert_eq!(hs, freqs.head_size, "head size differs from the frequency table");
    assert!(
        t_len <= freqs.max_seq_len(),
        "sequence length {t_len} exceeds the frequency table ({})",
        freqs.max_seq_len()
    );
    if x.data().is_empty() || hs == 0 {
        return;
    }
    let half = hs / 2;
    let cos = freqs.cos.data();
    let sin = freqs.sin.data();

    // One (batch, head) pair is a contiguous [T, HS] block.
    let rotate_head = |head: &mut [f32]| {
        for (t, row) in head.chunks_exact_mut(hs).enumerate() {
            let (lo, hi) = row.split_at_mut(half);
            let cos_t = &cos[t * half..(t + 1) * half];
            let sin_t = &sin[t * half..(t + 1) * half];
            for i in 0..half {
                let (x0, x1) = (lo[i], hi[i]);
                let (c, s) = (cos_t[i], sign * sin_t[i]);
                lo[i] = x0 * c - x1 * s;
                hi[i] = x0 * s + x1 * c;
            }
        }
    };

    let data = x.data_mut();
    if data.len() >= PARALLEL_THRESHOLD {
        data.par_chunks_mut(t_len * hs).for_each(rotate_head);
    } else {
        data.chunks_mut(t_len * hs).for_each(rotate_head);
    }
}
