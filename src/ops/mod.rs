//! Recurrent entry points.
//!
//! All three calls share the same shape: validate the views against the
//! handle, carve the scratch regions, pick the activation once, and launch a
//! step kernel over row-stripe tiles.

mod backward_deltas;
mod backward_gradients;
mod forward;

pub use backward_deltas::back_prop_deltas_recurrent;
pub use backward_gradients::back_prop_gradients_recurrent;
pub use forward::forward_prop_recurrent;

use crate::{
    error::{RecurrentError, Result},
    handle::RecurrentOpsHandle,
    precision::{Acc, Element},
    view::Layout,
};

/// Element strides of a `(layer, batch, time)` tensor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Strides3 {
    layer: usize,
    batch: usize,
    time: usize,
}

impl Strides3 {
    fn of(layout: &Layout) -> Self {
        let s = layout.strides();
        Self {
            layer: s[0],
            batch: s[1],
            time: s[2],
        }
    }

    #[inline(always)]
    fn at(&self, l: usize, b: usize, t: usize) -> usize {
        l * self.layer + b * self.batch + t * self.time
    }
}

/// Element strides of a `(row, column)` matrix.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Strides2 {
    row: usize,
    col: usize,
}

impl Strides2 {
    fn of(layout: &Layout) -> Self {
        let s = layout.strides();
        Self { row: s[0], col: s[1] }
    }

    #[inline(always)]
    fn at(&self, r: usize, c: usize) -> usize {
        r * self.row + c * self.col
    }
}

/// Column-major `(l, b, t)` index into the pre-activation cache.
#[inline(always)]
fn cache_index(handle: &RecurrentOpsHandle, l: usize, b: usize, t: usize) -> usize {
    l + handle.layer_size() * (b + handle.mini_batch_size() * t)
}

fn check_precision<E: Element>(name: &'static str, handle: &RecurrentOpsHandle) -> Result<()> {
    if E::PRECISION != handle.precision() {
        return Err(RecurrentError::PrecisionMismatch {
            name,
            expected: handle.precision(),
            found: E::PRECISION,
        });
    }
    Ok(())
}

fn check_shape(name: &'static str, layout: &Layout, expected: &[usize]) -> Result<()> {
    if layout.shape() != expected {
        return Err(RecurrentError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            found: layout.shape().to_vec(),
        });
    }
    Ok(())
}

/// Copy rows `rows` of a weight matrix into a dense row-major tile, transposed
/// when `transpose` is set.
fn load_weight_tile<E: Element>(
    weights: &[E],
    strides: Strides2,
    layer: usize,
    rows: std::ops::Range<usize>,
    transpose: bool,
) -> Vec<E> {
    let mut tile = Vec::with_capacity(rows.len() * layer);
    for r in rows {
        for c in 0..layer {
            let offset = if transpose {
                strides.at(c, r)
            } else {
                strides.at(r, c)
            };
            tile.push(weights[offset]);
        }
    }
    tile
}

#[inline]
fn dot<E: Element>(weights: &[E], state: &[Acc]) -> Acc {
    weights
        .iter()
        .zip(state)
        .fold(0.0, |acc, (w, x)| acc + w.to_acc() * x)
}
