use tracing::debug;

use super::{Strides2, Strides3, check_precision, check_shape};
use crate::{
    error::Result,
    handle::RecurrentOpsHandle,
    precision::{Acc, Element},
    schedule::{StepKernel, Tile, launch},
    scratch::{OperationKind, ScratchLayout},
    view::{ScratchView, SharedMut, TensorView, TensorViewMut},
};

/// Accumulate the recurrent weight gradient into `weights`:
///
/// ```text
/// weights += Σ_{s≥1} Σ_b deltas[:, b, τ(s)] · activations[:, b, τ(s-1)]ᵀ
/// ```
///
/// `deltas` are the pre-activation deltas produced by
/// [`back_prop_deltas_recurrent`](crate::back_prop_deltas_recurrent). The
/// pre-activation cache in `scratch` is left alone.
pub fn back_prop_gradients_recurrent<E: Element>(
    weights: TensorViewMut<'_, E>,
    activations: TensorView<'_, E>,
    deltas: TensorView<'_, E>,
    mut scratch: ScratchView<'_>,
    handle: &RecurrentOpsHandle,
) -> Result<()> {
    check_precision::<E>("weights", handle)?;
    check_shape("weights", weights.layout(), &handle.weights_shape())?;
    check_shape("activations", activations.layout(), &handle.activations_shape())?;
    check_shape("deltas", deltas.layout(), &handle.activations_shape())?;

    let layout = ScratchLayout::new(handle, OperationKind::BackPropGradients, E::PRECISION);
    let (_, partial) = scratch.regions::<E>(&layout)?;

    debug!(
        layer = handle.layer_size(),
        batch = handle.mini_batch_size(),
        timesteps = handle.timesteps(),
        precision = %E::PRECISION,
        "back_prop_gradients_recurrent"
    );

    let (weight, weight_layout) = weights.into_shared();
    let kernel = GradientsKernel {
        handle,
        weights: weight,
        weight_strides: Strides2::of(&weight_layout),
        act: activations.data(),
        act_strides: Strides3::of(activations.layout()),
        delta: deltas.data(),
        delta_strides: Strides3::of(deltas.layout()),
        partial: SharedMut::new(partial),
    };
    launch(handle, &kernel)
}

struct GradientsKernel<'a, E> {
    handle: &'a RecurrentOpsHandle,
    weights: SharedMut<'a, E>,
    weight_strides: Strides2,
    act: &'a [E],
    act_strides: Strides3,
    delta: &'a [E],
    delta_strides: Strides3,
    /// `L × L` row-major accumulators.
    partial: SharedMut<'a, Acc>,
}

struct GradientsResident<'a> {
    /// The tile's rows of the accumulator.
    partial: &'a mut [Acc],
    /// Previous state gathered as `prev[c + L·b]`.
    prev: Vec<Acc>,
}

impl<'a, E: Element> StepKernel for GradientsKernel<'a, E> {
    type Resident = GradientsResident<'a>;

    fn name(&self) -> &'static str {
        "back_prop_gradients"
    }

    fn steps(&self) -> usize {
        self.handle.timesteps()
    }

    fn load(&self, tile: &Tile) -> GradientsResident<'a> {
        let layer = self.handle.layer_size();
        // SAFETY: tiles own disjoint row stripes, and a unit's previous
        // resident slice is gone before the next load of the same tile.
        let partial = unsafe { self.partial.slice_mut(tile.rows.start * layer, tile.len() * layer) };
        GradientsResident {
            partial,
            prev: vec![0.0; layer * self.handle.mini_batch_size()],
        }
    }

    fn step(&self, tile: &Tile, resident: &mut GradientsResident<'a>, step: usize) {
        let handle = self.handle;
        let (layer, batch) = (handle.layer_size(), handle.mini_batch_size());

        if step == 0 {
            resident.partial.fill(0.0);
            return;
        }

        let t = handle.time_index(step);
        let prev = handle.time_index(step - 1);
        for b in 0..batch {
            for c in 0..layer {
                resident.prev[c + layer * b] = self.act[self.act_strides.at(c, b, prev)].to_acc();
            }
        }

        for (i, r) in tile.rows.clone().enumerate() {
            let row = &mut resident.partial[i * layer..(i + 1) * layer];
            for b in 0..batch {
                let d = self.delta[self.delta_strides.at(r, b, t)].to_acc();
                let x = &resident.prev[layer * b..layer * (b + 1)];
                for (acc, x) in row.iter_mut().zip(x) {
                    *acc += d * x;
                }
            }
        }
    }

    fn finish(&self, tile: &Tile, resident: &mut GradientsResident<'a>) {
        let layer = self.handle.layer_size();
        for (i, r) in tile.rows.clone().enumerate() {
            for c in 0..layer {
                let at = self.weight_strides.at(r, c);
                // SAFETY: row `r` of the weights belongs to this tile alone.
                unsafe {
                    let w = self.weights.read(at).to_acc() + resident.partial[i * layer + c];
                    self.weights.write(at, E::from_acc(w));
                }
            }
        }
    }
}
