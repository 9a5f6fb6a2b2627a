use std::marker::PhantomData;

use tracing::debug;

use super::{Strides2, Strides3, cache_index, check_precision, check_shape, dot, load_weight_tile};
use crate::{
    activation::ActivationFn,
    error::{RecurrentError, Result},
    handle::RecurrentOpsHandle,
    precision::{Acc, Element},
    schedule::{StepKernel, Tile, launch},
    scratch::{OperationKind, ScratchLayout},
    view::{ScratchView, SharedMut, TensorView, TensorViewMut},
    with_activation,
};

/// Run the recurrence forward in place over `activations`.
///
/// `activations[:, :, τ(0)]` is the initial state and is left as is. Every
/// later timestep holds the input on entry and the activated state on return:
///
/// ```text
/// preact[τ(s)]      = W · activations[τ(s-1)] + activations[τ(s)]
/// activations[τ(s)] = f(preact[τ(s)])
/// ```
///
/// The pre-activations are cached in `scratch` for
/// [`back_prop_deltas_recurrent`](crate::back_prop_deltas_recurrent).
pub fn forward_prop_recurrent<E: Element>(
    activations: TensorViewMut<'_, E>,
    weights: TensorView<'_, E>,
    mut scratch: ScratchView<'_>,
    handle: &RecurrentOpsHandle,
) -> Result<()> {
    check_precision::<E>("activations", handle)?;
    check_shape("activations", activations.layout(), &handle.activations_shape())?;
    check_shape("weights", weights.layout(), &handle.weights_shape())?;

    let layout = ScratchLayout::new(handle, OperationKind::ForwardProp, E::PRECISION);
    if scratch.len() < layout.total_bytes {
        return Err(RecurrentError::ScratchTooSmall {
            required: layout.total_bytes,
            available: scratch.len(),
        });
    }

    debug!(
        layer = handle.layer_size(),
        batch = handle.mini_batch_size(),
        timesteps = handle.timesteps(),
        precision = %E::PRECISION,
        activation = %handle.activation(),
        "forward_prop_recurrent"
    );

    let generation = scratch.begin_forward(handle, E::PRECISION);
    {
        let (preact, _) = scratch.regions::<E>(&layout)?;
        let (act, act_layout) = activations.into_shared();

        with_activation!(handle.activation(), A => {
            let kernel = ForwardKernel::<E, A> {
                handle,
                act,
                act_strides: Strides3::of(&act_layout),
                weights: weights.data(),
                weight_strides: Strides2::of(weights.layout()),
                preact: SharedMut::new(preact),
                _activation: PhantomData,
            };
            launch(handle, &kernel)
        })?;
    }
    scratch.finish_forward(handle, E::PRECISION, generation);
    Ok(())
}

struct ForwardKernel<'a, E, A> {
    handle: &'a RecurrentOpsHandle,
    act: SharedMut<'a, E>,
    act_strides: Strides3,
    weights: &'a [E],
    weight_strides: Strides2,
    preact: SharedMut<'a, E>,
    _activation: PhantomData<A>,
}

struct ForwardResident<E> {
    /// Rows of `W` owned by the tile, row-major.
    weights: Vec<E>,
    /// Previous state gathered as `state[c + L·b]`.
    state: Vec<Acc>,
}

impl<E: Element, A: ActivationFn> StepKernel for ForwardKernel<'_, E, A> {
    type Resident = ForwardResident<E>;

    fn name(&self) -> &'static str {
        "forward_prop"
    }

    fn steps(&self) -> usize {
        self.handle.timesteps()
    }

    fn load(&self, tile: &Tile) -> ForwardResident<E> {
        let layer = self.handle.layer_size();
        ForwardResident {
            weights: load_weight_tile(self.weights, self.weight_strides, layer, tile.rows.clone(), false),
            state: vec![0.0; layer * self.handle.mini_batch_size()],
        }
    }

    fn step(&self, tile: &Tile, resident: &mut ForwardResident<E>, step: usize) {
        let handle = self.handle;
        let (layer, batch) = (handle.layer_size(), handle.mini_batch_size());
        let t = handle.time_index(step);

        // SAFETY: this tile is the only writer of its rows at `t` in this step;
        // rows at the previous timestep were finished one barrier ago and are
        // not written again during this call.
        unsafe {
            if step == 0 {
                for b in 0..batch {
                    for r in tile.rows.clone() {
                        let x = self.act.read(self.act_strides.at(r, b, t));
                        self.preact.write(cache_index(handle, r, b, t), x);
                    }
                }
                return;
            }

            let prev = handle.time_index(step - 1);
            for b in 0..batch {
                for c in 0..layer {
                    resident.state[c + layer * b] = self.act.read(self.act_strides.at(c, b, prev)).to_acc();
                }
            }

            for b in 0..batch {
                let state = &resident.state[layer * b..layer * (b + 1)];
                for (i, r) in tile.rows.clone().enumerate() {
                    let w = &resident.weights[i * layer..(i + 1) * layer];
                    let at = self.act_strides.at(r, b, t);
                    let z = dot(w, state) + self.act.read(at).to_acc();
                    let z = E::from_acc(z);
                    self.preact.write(cache_index(handle, r, b, t), z);
                    self.act.write(at, E::from_acc(A::forward(z.to_acc())));
                }
            }
        }
    }
}
