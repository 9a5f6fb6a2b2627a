//! Scratch sizing and layout.
//!
//! ```text
//! offset 0      header (ScratchHeader, 64 bytes reserved)
//! offset 64     pre-activation cache, L·B·T storage elements, (l, b, t) column-major
//! aligned 64    gradient partials, L·L f32, row-major (gradients only)
//! ```
//!
//! The forward pass stamps the header with the problem fingerprint once the
//! cache is complete; the backward-deltas pass refuses a cache whose stamp
//! does not match its own handle.

use bytemuck::{Pod, Zeroable};

use crate::{
    error::{RecurrentError, Result},
    handle::RecurrentOpsHandle,
    precision::{Acc, Element, Precision},
    view::ScratchView,
};

pub(crate) const HEADER_BYTES: usize = 64;
const REGION_ALIGN: usize = 64;
const MAGIC: u64 = u64::from_le_bytes(*b"PRNNSCR1");

const STATE_EMPTY: u32 = 0;
const STATE_POPULATED: u32 = 1;

/// Which entry point a scratch buffer is sized for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ForwardProp,
    BackPropDeltas,
    BackPropGradients,
}

/// Byte layout of a scratch buffer for one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchLayout {
    pub preact_offset: usize,
    pub preact_bytes: usize,
    pub partial_offset: usize,
    pub partial_bytes: usize,
    pub total_bytes: usize,
}

impl ScratchLayout {
    pub fn new(handle: &RecurrentOpsHandle, kind: OperationKind, precision: Precision) -> Self {
        let [layer, batch, timesteps] = handle.activations_shape();

        let preact_offset = HEADER_BYTES;
        let preact_bytes = layer * batch * timesteps * precision.size_bytes();
        let partial_offset = (preact_offset + preact_bytes).next_multiple_of(REGION_ALIGN);
        let partial_bytes = match kind {
            OperationKind::BackPropGradients => layer * layer * precision.accumulation_bytes(),
            OperationKind::ForwardProp | OperationKind::BackPropDeltas => 0,
        };
        let total_bytes = if partial_bytes > 0 {
            partial_offset + partial_bytes
        } else {
            preact_offset + preact_bytes
        };

        Self {
            preact_offset,
            preact_bytes,
            partial_offset,
            partial_bytes,
            total_bytes,
        }
    }
}

/// Bytes of scratch `kind` needs for `handle` at `precision`.
pub fn scratch_size_for(handle: &RecurrentOpsHandle, kind: OperationKind, precision: Precision) -> usize {
    ScratchLayout::new(handle, kind, precision).total_bytes
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct ScratchHeader {
    magic: u64,
    layer_size: u64,
    mini_batch_size: u64,
    timesteps: u64,
    generation: u64,
    direction: u32,
    precision: u32,
    activation: u32,
    state: u32,
}

const _: () = assert!(std::mem::size_of::<ScratchHeader>() <= HEADER_BYTES);

impl ScratchHeader {
    fn fingerprint(handle: &RecurrentOpsHandle, precision: Precision) -> Self {
        Self {
            magic: MAGIC,
            layer_size: handle.layer_size() as u64,
            mini_batch_size: handle.mini_batch_size() as u64,
            timesteps: handle.timesteps() as u64,
            generation: 0,
            direction: handle.direction().code(),
            precision: precision.code(),
            activation: handle.activation().code(),
            state: STATE_EMPTY,
        }
    }

    fn same_problem(&self, other: &Self) -> bool {
        Self {
            generation: 0,
            state: STATE_EMPTY,
            ..*self
        } == Self {
            generation: 0,
            state: STATE_EMPTY,
            ..*other
        }
    }
}

impl ScratchView<'_> {
    fn header(&self) -> Option<ScratchHeader> {
        let bytes = self.bytes().get(..std::mem::size_of::<ScratchHeader>())?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    fn write_header(&mut self, header: &ScratchHeader) {
        self.bytes_mut()[..std::mem::size_of::<ScratchHeader>()]
            .copy_from_slice(bytemuck::bytes_of(header));
    }

    /// Mark the cache as being rewritten. Returns the next generation number.
    pub(crate) fn begin_forward(&mut self, handle: &RecurrentOpsHandle, precision: Precision) -> u64 {
        let generation = match self.header() {
            Some(h) if h.magic == MAGIC => h.generation.wrapping_add(1),
            _ => 1,
        };
        let header = ScratchHeader {
            generation,
            ..ScratchHeader::fingerprint(handle, precision)
        };
        self.write_header(&header);
        generation
    }

    /// Stamp the cache as complete for `handle`.
    pub(crate) fn finish_forward(&mut self, handle: &RecurrentOpsHandle, precision: Precision, generation: u64) {
        let header = ScratchHeader {
            generation,
            state: STATE_POPULATED,
            ..ScratchHeader::fingerprint(handle, precision)
        };
        self.write_header(&header);
    }

    /// Check that a completed forward pass for the same problem filled the cache.
    pub(crate) fn validate_populated(&self, handle: &RecurrentOpsHandle, precision: Precision) -> Result<()> {
        let Some(header) = self.header() else {
            return Err(RecurrentError::StaleScratch(format!(
                "scratch of {} bytes cannot hold a forward cache",
                self.len()
            )));
        };
        if header.magic != MAGIC || header.state != STATE_POPULATED {
            return Err(RecurrentError::StaleScratch(
                "no completed forward pass has populated this scratch".into(),
            ));
        }
        let expected = ScratchHeader::fingerprint(handle, precision);
        if !header.same_problem(&expected) {
            return Err(RecurrentError::StaleScratch(format!(
                "scratch was populated for layer={} batch={} timesteps={} \
                 (direction {}, precision {}, activation {}), not layer={} batch={} timesteps={}",
                header.layer_size,
                header.mini_batch_size,
                header.timesteps,
                header.direction,
                header.precision,
                header.activation,
                handle.layer_size(),
                handle.mini_batch_size(),
                handle.timesteps()
            )));
        }
        Ok(())
    }

    /// Split out the typed regions described by `layout`.
    pub(crate) fn regions<E: Element>(&mut self, layout: &ScratchLayout) -> Result<(&mut [E], &mut [Acc])> {
        if self.len() < layout.total_bytes {
            return Err(RecurrentError::ScratchTooSmall {
                required: layout.total_bytes,
                available: self.len(),
            });
        }

        let bytes = &mut self.bytes_mut()[..layout.total_bytes];
        let (head, partial): (&mut [u8], &mut [u8]) = if layout.partial_bytes > 0 {
            let (head, tail) = bytes.split_at_mut(layout.partial_offset);
            (head, &mut tail[..layout.partial_bytes])
        } else {
            (bytes, &mut [])
        };
        let preact = &mut head[layout.preact_offset..layout.preact_offset + layout.preact_bytes];

        let preact: &mut [E] = bytemuck::try_cast_slice_mut(preact).map_err(|e| {
            RecurrentError::InvalidView(format!("scratch pre-activation region: {e}"))
        })?;
        let partial: &mut [Acc] = if partial.is_empty() {
            &mut []
        } else {
            bytemuck::try_cast_slice_mut(partial)
                .map_err(|e| RecurrentError::InvalidView(format!("scratch partial region: {e}")))?
        };
        Ok((preact, partial))
    }
}

/// Zeroed, 8-byte aligned scratch memory owned by the caller.
#[derive(Clone, Debug)]
pub struct Scratch {
    words: Vec<u64>,
    len: usize,
}

impl Scratch {
    pub fn zeroed(bytes: usize) -> Self {
        Self {
            words: vec![0; bytes.div_ceil(8)],
            len: bytes,
        }
    }

    /// Scratch for `kind` at the handle's own precision.
    pub fn for_operation(handle: &RecurrentOpsHandle, kind: OperationKind) -> Self {
        Self::zeroed(scratch_size_for(handle, kind, handle.precision()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn view(&mut self) -> ScratchView<'_> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.words);
        ScratchView::new(&mut bytes[..self.len])
    }
}

pub fn get_forward_prop_scratch(handle: &RecurrentOpsHandle, precision: Precision) -> Scratch {
    Scratch::zeroed(scratch_size_for(handle, OperationKind::ForwardProp, precision))
}

pub fn get_back_prop_deltas_scratch(handle: &RecurrentOpsHandle, precision: Precision) -> Scratch {
    Scratch::zeroed(scratch_size_for(handle, OperationKind::BackPropDeltas, precision))
}

pub fn get_back_prop_gradients_scratch(handle: &RecurrentOpsHandle, precision: Precision) -> Scratch {
    Scratch::zeroed(scratch_size_for(handle, OperationKind::BackPropGradients, precision))
}
