//! Row-stripe partition of the layer across units.

use std::ops::Range;

/// One unit's share of the layer: a contiguous stripe of rows of the output
/// (and of the weight matrix).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    pub unit: usize,
    pub rows: Range<usize>,
}

impl Tile {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Balanced partition of `layer_size` rows over at most `units` units.
///
/// Never produces an empty tile: with fewer rows than units, the surplus
/// units sit the launch out.
#[derive(Clone, Debug)]
pub struct TilePlan {
    layer_size: usize,
    tiles: Vec<Tile>,
}

impl TilePlan {
    pub fn new(layer_size: usize, units: usize) -> Self {
        let grid = units.min(layer_size).max(1);
        let base = layer_size / grid;
        let extra = layer_size % grid;

        let mut tiles = Vec::with_capacity(grid);
        let mut start = 0;
        for unit in 0..grid {
            let len = base + usize::from(unit < extra);
            tiles.push(Tile {
                unit,
                rows: start..start + len,
            });
            start += len;
        }
        debug_assert_eq!(start, layer_size);

        Self { layer_size, tiles }
    }

    pub fn layer_size(&self) -> usize {
        self.layer_size
    }

    pub fn grid(&self) -> usize {
        self.tiles.len()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Rows in the largest tile.
    pub fn max_rows(&self) -> usize {
        self.tiles.iter().map(Tile::len).max().unwrap_or(0)
    }
}
