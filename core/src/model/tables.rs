//! Parameter and activation tables.
//!
//! Both tables are declared once as a list of `name: [shape formula]` entries. The
//! [`tensor_table!`] macro turns that list into a struct with one field per entry, generic over the
//! payload: `Table<Shape>` is the layout, `Table<&[f32]>` / `Table<&mut [f32]>` are the per-field
//! slices of one flat allocation. Sizes, offsets and names all come from the same list, so a
//! tensor cannot be added to the layout and forgotten in the split (or vice versa).

use crate::model::config::LlamaConfig;
use crate::tensor::{Result, Shape, TensorError};

/// Declares a named tensor table.
///
/// ```ignore
/// tensor_table! {
///     pub struct Example(cfg, b, t) {
///         weight: [cfg.channels, cfg.channels],
///         hidden: [b, t, cfg.channels],
///     }
/// }
/// ```
///
/// The identifiers in parentheses bind the config and the batch geometry inside the shape
/// formulas.
#[macro_export]
macro_rules! tensor_table {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident ($cfg:ident, $b:ident, $t:ident) {
            $(
                $(#[$fmeta:meta])*
                $field:ident : [$($dim:expr),* $(,)?]
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name<S> {
            $(
                $(#[$fmeta])*
                pub $field: S,
            )*
        }

        impl<S> $name<S> {
            /// Field names in declaration (= memory) order.
            pub const NAMES: &'static [&'static str] = &[$(stringify!($field)),*];

            /// `(name, payload)` pairs in declaration order.
            pub fn entries(&self) -> Vec<(&'static str, &S)> {
                vec![$((stringify!($field), &self.$field)),*]
            }

            /// Transforms every payload, keeping the field structure.
            pub fn map<U>(self, mut f: impl FnMut(&'static str, S) -> U) -> $name<U> {
                $name {
                    $($field: f(stringify!($field), self.$field),)*
                }
            }
        }

        impl $name<$crate::tensor::Shape> {
            /// Evaluates every shape formula.
            #[allow(unused_variables)]
            pub fn layout($cfg: &$crate::model::config::LlamaConfig, $b: usize, $t: usize) -> Self {
                $name {
                    $($field: $crate::tensor::Shape::new(vec![$($dim),*]),)*
                }
            }

            /// Total number of elements over all fields.
            pub fn numel(&self) -> usize {
                0 $(+ self.$field.numel())*
            }

            /// [`Self::numel`], or `None` if any product or the total overflows.
            pub fn checked_numel(&self) -> Option<usize> {
                let total = Some(0usize);
                $(
                    let total = total?.checked_add(self.$field.checked_numel()?);
                )*
                total
            }

            /// Start offset of every field in the flat buffer.
            #[allow(unused_assignments)]
            pub fn offsets(&self) -> $name<usize> {
                let mut next = 0;
                $name {
                    $($field: {
                        let start = next;
                        next += self.$field.numel();
                        start
                    },)*
                }
            }

            /// Carves `data` into one slice per field.
            #[allow(unused_assignments)]
            pub fn split<'a, T>(&self, data: &'a [T]) -> $crate::tensor::Result<$name<&'a [T]>> {
                $crate::model::tables::check_len(self.numel(), data.len())?;
                let mut rest = data;
                $(
                    let ($field, tail) = rest.split_at(self.$field.numel());
                    rest = tail;
                )*
                Ok($name { $($field,)* })
            }

            /// Carves `data` into one mutable slice per field.
            #[allow(unused_assignments)]
            pub fn split_mut<'a, T>(
                &self,
                data: &'a mut [T],
            ) -> $crate::tensor::Result<$name<&'a mut [T]>> {
                $crate::model::tables::check_len(self.numel(), data.len())?;
                let mut rest = data;
                $(
                    let ($field, tail) = std::mem::take(&mut rest).split_at_mut(self.$field.numel());
                    rest = tail;
                )*
                Ok($name { $($field,)* })
            }
        }
    };
}

#[doc(hidden)]
pub fn check_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(TensorError::ShapeMismatch {
            expected: vec![expected],
            got: vec![got],
        });
    }
    Ok(())
}

tensor_table! {
    /// Model weights, in checkpoint order. The output projection is tied to `wte`.
    pub struct ParameterTensors(cfg, b, t) {
        /// Token embedding, `(Vp, C)`.
        wte: [cfg.padded_vocab_size, cfg.channels],
        ln1w: [cfg.num_layers, cfg.channels],
        ln1b: [cfg.num_layers, cfg.channels],
        /// Fused query/key/value projection, rows `[q heads | k heads | v heads]`.
        qkvw: [cfg.num_layers, cfg.qkv_channels(), cfg.channels],
        attprojw: [cfg.num_layers, cfg.channels, cfg.channels],
        ln2w: [cfg.num_layers, cfg.channels],
        ln2b: [cfg.num_layers, cfg.channels],
        fc_upw: [cfg.num_layers, cfg.ffn_hidden, cfg.channels],
        fc_gatew: [cfg.num_layers, cfg.ffn_hidden, cfg.channels],
        fcprojw: [cfg.num_layers, cfg.channels, cfg.ffn_hidden],
        lnfw: [cfg.channels],
        lnfb: [cfg.channels],
    }
}

tensor_table! {
    /// Forward activations kept for the backward pass: one copy per layer.
    pub struct ActivationTensors(cfg, b, t) {
        encoded: [b, t, cfg.channels],
        ln1: [cfg.num_layers, b, t, cfg.channels],
        ln1_rstd: [cfg.num_layers, b, t],
        /// Rotated queries, expanded rotated keys and expanded values, each `(B, NH, T, HS)`.
        qkvr: [cfg.num_layers, b, t, 3 * cfg.channels],
        att: [cfg.num_layers, b, cfg.num_heads, t, t],
        atty: [cfg.num_layers, b, t, cfg.channels],
        residual2: [cfg.num_layers, b, t, cfg.channels],
        ln2: [cfg.num_layers, b, t, cfg.channels],
        ln2_rstd: [cfg.num_layers, b, t],
        fch_up: [cfg.num_layers, b, t, cfg.ffn_hidden],
        fch_gate: [cfg.num_layers, b, t, cfg.ffn_hidden],
        fch_swiglu: [cfg.num_layers, b, t, cfg.ffn_hidden],
        residual3: [cfg.num_layers, b, t, cfg.channels],
        lnf: [b, t, cfg.channels],
        lnf_rstd: [b, t],
        losses: [b, t],
    }
}

/// Slice of layer `l` in a field whose leading dimension is the layer index.
pub fn layer<T>(field: &[T], l: usize, num_layers: usize) -> &[T] {
    let n = field.len() / num_layers;
    &field[l * n..(l + 1) * n]
}

/// Mutable slice of layer `l`.
pub fn layer_mut<T>(field: &mut [T], l: usize, num_layers: usize) -> &mut [T] {
    let n = field.len() / num_layers;
    &mut field[l * n..(l + 1) * n]
}

impl ParameterTensors<Shape> {
    pub fn for_config(cfg: &LlamaConfig) -> Self {
        Self::layout(cfg, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_count() {
        let cfg = LlamaConfig::tiny_test();
        let (c, l, h, vp) = (64, 2, 128, 64);
        let qkv = (4 + 2 * 2) * 16;
        let shapes = ParameterTensors::for_config(&cfg);
        let expected = vp * c + l * (4 * c + qkv * c + c * c + 3 * h * c) + 2 * c;
        assert_eq!(shapes.numel(), expected);
        assert_eq!(shapes.qkvw.dims(), &[l, qkv, c]);
        assert_eq!(ParameterTensors::<Shape>::NAMES[0], "wte");
        assert_eq!(ParameterTensors::<Shape>::NAMES.len(), 12);
    }

    #[test]
    fn test_split_follows_declaration_order() {
        let cfg = LlamaConfig::tiny_test();
        let shapes = ParameterTensors::for_config(&cfg);
        let data: Vec<u32> = (0..shapes.numel() as u32).collect();
        let split = shapes.split(&data).unwrap();
        let offsets = shapes.offsets();

        assert_eq!(split.wte[0], 0);
        assert_eq!(split.ln1w[0] as usize, offsets.ln1w);
        assert_eq!(offsets.ln1w, 64 * 64);
        assert_eq!(*split.lnfb.last().unwrap() as usize, shapes.numel() - 1);
        for ((name, slice), (_, shape)) in split.entries().into_iter().zip(shapes.entries()) {
            assert_eq!(slice.len(), shape.numel(), "{name}");
        }
    }

    #[test]
    fn test_split_mut_disjoint_and_length_checked() {
        let cfg = LlamaConfig::tiny_test();
        let shapes = ActivationTensors::layout(&cfg, 2, 8);
        let mut data = vec![0.0f32; shapes.numel()];
        {
            let acts = shapes.split_mut(&mut data).unwrap();
            acts.losses.fill(1.0);
            acts.encoded.fill(2.0);
        }
        assert_eq!(data[0], 2.0);
        assert_eq!(*data.last().unwrap(), 1.0);
        assert_eq!(shapes.att.dims(), &[2, 2, 4, 8, 8]);

        let mut short = vec![0.0f32; 3];
        assert!(matches!(
            shapes.split_mut(&mut short),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_map_and_layer_helpers() {
        let cfg = LlamaConfig::tiny_test();
        let sizes = ParameterTensors::for_config(&cfg).map(|_, s| s.numel());
        assert_eq!(sizes.lnfw, 64);

        let field: Vec<usize> = (0..6).collect();
        assert_eq!(layer(&field, 1, 3), &[2, 3]);
    }
}
