use std::marker::PhantomData;

use tracing::debug;

use super::{Strides2, Strides3, cache_index, check_precision, check_shape, dot, load_weight_tile};
use crate::{
    activation::ActivationFn,
    error::Result,
    handle::RecurrentOpsHandle,
    precision::{Acc, Element},
    schedule::{StepKernel, Tile, launch},
    scratch::{OperationKind, ScratchLayout},
    view::{ScratchView, SharedMut, TensorView, TensorViewMut},
    with_activation,
};

/// Propagate deltas back through the recurrence in place.
///
/// On entry `deltas` holds the loss gradient with respect to each activation.
/// On return it holds the gradient with respect to each pre-activation, and
/// at `τ(0)` the gradient with respect to the initial state. Steps run from
/// the last recurrence step to the first:
///
/// ```text
/// deltas[τ(s)] = f'(preact[τ(s)]) ⊙ (Wᵀ · deltas[τ(s+1)] + deltas[τ(s)])
/// ```
///
/// `scratch` must hold the cache of a forward call on a handle describing the
/// same problem.
pub fn back_prop_deltas_recurrent<E: Element>(
    deltas: TensorViewMut<'_, E>,
    weights: TensorView<'_, E>,
    activations: TensorView<'_, E>,
    mut scratch: ScratchView<'_>,
    handle: &RecurrentOpsHandle,
) -> Result<()> {
    check_precision::<E>("deltas", handle)?;
    check_shape("deltas", deltas.layout(), &handle.activations_shape())?;
    check_shape("weights", weights.layout(), &handle.weights_shape())?;
    check_shape("activations", activations.layout(), &handle.activations_shape())?;

    scratch.validate_populated(handle, E::PRECISION)?;
    let layout = ScratchLayout::new(handle, OperationKind::BackPropDeltas, E::PRECISION);
    let (preact, _) = scratch.regions::<E>(&layout)?;

    debug!(
        layer = handle.layer_size(),
        batch = handle.mini_batch_size(),
        timesteps = handle.timesteps(),
        precision = %E::PRECISION,
        activation = %handle.activation(),
        "back_prop_deltas_recurrent"
    );

    let (delta, delta_layout) = deltas.into_shared();
    with_activation!(handle.activation(), A => {
        let kernel = DeltasKernel::<E, A> {
            handle,
            delta,
            delta_strides: Strides3::of(&delta_layout),
            weights: weights.data(),
            weight_strides: Strides2::of(weights.layout()),
            preact,
            _activation: PhantomData,
        };
        launch(handle, &kernel)
    })
}

struct DeltasKernel<'a, E, A> {
    handle: &'a RecurrentOpsHandle,
    delta: SharedMut<'a, E>,
    delta_strides: Strides3,
    weights: &'a [E],
    weight_strides: Strides2,
    preact: &'a [E],
    _activation: PhantomData<A>,
}

struct DeltasResident<E> {
    /// Rows of `Wᵀ` owned by the tile, row-major.
    weights_t: Vec<E>,
    state: Vec<Acc>,
}

impl<E: Element, A: ActivationFn> StepKernel for DeltasKernel<'_, E, A> {
    type Resident = DeltasResident<E>;

    fn name(&self) -> &'static str {
        "back_prop_deltas"
    }

    fn steps(&self) -> usize {
        self.handle.timesteps()
    }

    fn load(&self, tile: &Tile) -> DeltasResident<E> {
        let layer = self.handle.layer_size();
        DeltasResident {
            weights_t: load_weight_tile(self.weights, self.weight_strides, layer, tile.rows.clone(), true),
            state: vec![0.0; layer * self.handle.mini_batch_size()],
        }
    }

    fn step(&self, tile: &Tile, resident: &mut DeltasResident<E>, step: usize) {
        let handle = self.handle;
        let (layer, batch) = (handle.layer_size(), handle.mini_batch_size());
        // Recurrence ordinal, walked backwards.
        let s = handle.timesteps() - 1 - step;
        let t = handle.time_index(s);
        let carried = step > 0;

        // SAFETY: deltas at `t` are written only by their row's tile; deltas
        // at the later timestep were finished one barrier ago.
        unsafe {
            if carried {
                let next = handle.time_index(s + 1);
                for b in 0..batch {
                    for c in 0..layer {
                        resident.state[c + layer * b] =
                            self.delta.read(self.delta_strides.at(c, b, next)).to_acc();
                    }
                }
            }

            for b in 0..batch {
                let state = &resident.state[layer * b..layer * (b + 1)];
                for (i, r) in tile.rows.clone().enumerate() {
                    let at = self.delta_strides.at(r, b, t);
                    let mut g = self.delta.read(at).to_acc();
                    if carried {
                        g += dot(&resident.weights_t[i * layer..(i + 1) * layer], state);
                    }
                    if s > 0 {
                        g *= A::derivative(self.preact[cache_index(handle, r, b, t)].to_acc());
                    }
                    self.delta.write(at, E::from_acc(g));
                }
            }
        }
    }
}
