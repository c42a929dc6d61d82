//! The scratch/gradient arena.
//!
//! The model keeps one copy of every forward activation per layer, but the short-lived
//! intermediates (the fused QKV row, raw attention scores, logits, every backward gradient) live in
//! a handful of slots that all layers share. A slot is taken out with [`ScratchArena::lease`], which
//! *moves* its buffer into a [`Lease`] tagged with the borrowing stage, and put back with
//! [`ScratchArena::restore`]. Asking for a slot that is already out is an error naming the current
//! holder, so two stages can never silently share a buffer.
//!
//! # Premature-reuse canary
//!
//! Every pipeline stage (QKV projection, attention scores, FFN projection, classifier, and so on)
//! takes its own lease and returns it before the next stage reuses the slot. In debug builds a
//! scratch lease is filled with NaN before it is handed out, so a stage that reads content it did
//! not write itself produces non-finite results, which the tests catch. Only the logits handed from
//! the classifier to the loss and on to the backward pass are taken with
//! [`ScratchArena::lease_retained`].

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::info;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(0);

/// The shared buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// `(B, T, max(QKV, NH·T, Vp))`: fused QKV rows, raw scores, projection outputs, logits.
    Output,
    /// `(B, T, max(4C, 2H, 3C))`: per-head k/v and attention outputs; backward q/k/v and FFN
    /// gradients.
    Bt4c,
    /// `(B, T, C)`: backward gradient of a normalised input or attention output.
    Btc,
    /// `(B, NH, T, T)`: attention weight/score gradients.
    DAtt,
    /// `(B, T, C)`: residual-stream gradient, accumulated across layers.
    DResidual,
}

impl Slot {
    pub const ALL: [Slot; 5] = [
        Slot::Output,
        Slot::Bt4c,
        Slot::Btc,
        Slot::DAtt,
        Slot::DResidual,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArenaError {
    #[error("slot {slot} is held by `{holder}`, requested by `{requester}`")]
    SlotInUse {
        slot: Slot,
        holder: &'static str,
        requester: &'static str,
    },
    #[error("slot {slot} has not been allocated")]
    NotAllocated { slot: Slot },
    #[error("lease on slot {slot} belongs to a different arena")]
    ForeignLease { slot: Slot },
}

pub type Result<T> = std::result::Result<T, ArenaError>;

/// Per-row widths of every slot, derived from the model geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSizes {
    pub output: usize,
    pub bt4c: usize,
    pub btc: usize,
    pub datt: usize,
    pub dresidual: usize,
}

impl SlotSizes {
    /// Element counts for a `(B, T)` batch.
    pub fn new(cfg: &crate::model::config::LlamaConfig, b: usize, t: usize) -> Self {
        let c = cfg.channels;
        let bt = b * t;
        let output_row = cfg
            .qkv_channels()
            .max(cfg.num_heads * t)
            .max(cfg.padded_vocab_size);
        let bt4c_row = (4 * c).max(2 * cfg.ffn_hidden).max(3 * c);
        Self {
            output: bt * output_row,
            bt4c: bt * bt4c_row,
            btc: bt * c,
            datt: b * cfg.num_heads * t * t,
            dresidual: bt * c,
        }
    }

    pub fn of(&self, slot: Slot) -> usize {
        match slot {
            Slot::Output => self.output,
            Slot::Bt4c => self.bt4c,
            Slot::Btc => self.btc,
            Slot::DAtt => self.datt,
            Slot::DResidual => self.dresidual,
        }
    }
}

#[derive(Debug)]
enum SlotState {
    Unallocated,
    Free(Vec<f32>),
    Leased(&'static str),
}

/// A slot buffer on loan to one pipeline stage.
#[derive(Debug)]
pub struct Lease {
    slot: Slot,
    stage: &'static str,
    arena: u64,
    buf: Vec<f32>,
}

impl Lease {
    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }
}

impl Deref for Lease {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.buf
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.buf
    }
}

#[derive(Debug)]
pub struct ScratchArena {
    id: u64,
    slots: [SlotState; 5],
    poison: bool,
}

impl Default for ScratchArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ScratchArena {
    /// An arena with no slots allocated. Poisoning follows `debug_assertions`.
    pub fn new() -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            slots: std::array::from_fn(|_| SlotState::Unallocated),
            poison: cfg!(debug_assertions),
        }
    }

    /// Forces NaN poisoning on or off regardless of the build profile.
    pub fn with_poisoning(mut self, poison: bool) -> Self {
        self.poison = poison;
        self
    }

    pub fn is_allocated(&self, slot: Slot) -> bool {
        !matches!(self.slots[slot.index()], SlotState::Unallocated)
    }

    /// Allocates (zeroed) any of `slots` that are not allocated yet.
    pub fn allocate(&mut self, sizes: &SlotSizes, slots: &[Slot]) {
        for &slot in slots {
            let state = &mut self.slots[slot.index()];
            if matches!(state, SlotState::Unallocated) {
                let len = sizes.of(slot);
                info!(%slot, elements = len, "allocating scratch slot");
                *state = SlotState::Free(vec![0.0; len]);
            }
        }
    }

    /// Takes `slot` for `stage`. The content is unspecified (NaN when poisoning).
    pub fn lease(&mut self, slot: Slot, stage: &'static str) -> Result<Lease> {
        let mut lease = self.take(slot, stage)?;
        if self.poison {
            lease.buf.fill(f32::NAN);
        }
        Ok(lease)
    }

    /// Takes `slot` for `stage`, keeping whatever the previous holder left in it.
    pub fn lease_retained(&mut self, slot: Slot, stage: &'static str) -> Result<Lease> {
        self.take(slot, stage)
    }

    fn take(&mut self, slot: Slot, stage: &'static str) -> Result<Lease> {
        let state = &mut self.slots[slot.index()];
        match std::mem::replace(state, SlotState::Leased(stage)) {
            SlotState::Free(buf) => Ok(Lease {
                slot,
                stage,
                arena: self.id,
                buf,
            }),
            SlotState::Leased(holder) => {
                *state = SlotState::Leased(holder);
                Err(ArenaError::SlotInUse {
                    slot,
                    holder,
                    requester: stage,
                })
            }
            SlotState::Unallocated => {
                *state = SlotState::Unallocated;
                Err(ArenaError::NotAllocated { slot })
            }
        }
    }

    /// Returns a lease to its slot.
    pub fn restore(&mut self, lease: Lease) -> Result<()> {
        if lease.arena != self.id {
            return Err(ArenaError::ForeignLease { slot: lease.slot });
        }
        self.slots[lease.slot.index()] = SlotState::Free(lease.buf);
        Ok(())
    }

    /// Current holder of `slot`, if it is out.
    pub fn holder(&self, slot: Slot) -> Option<&'static str> {
        match self.slots[slot.index()] {
            SlotState::Leased(stage) => Some(stage),
            _ => None,
        }
    }

    /// Read access to a slot that is not leased.
    pub fn peek(&self, slot: Slot) -> Option<&[f32]> {
        match &self.slots[slot.index()] {
            SlotState::Free(buf) => Some(buf.as_slice()),
            _ => None,
        }
    }

    /// Total elements held by allocated slots.
    pub fn allocated_elements(&self) -> usize {
        self.slots
            .iter()
            .map(|s| match s {
                SlotState::Free(buf) => buf.len(),
                _ => 0,
            })
            .sum()
    }
}
