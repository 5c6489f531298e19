//! Cursor arithmetic for the reorder loop.
//!
//! All coordinates here are normalized (the domain lower bound is the
//! origin). A cursor tracks, per attribute, where the next cell slab starts
//! inside the tile slab being copied; advancing moves it along the fast
//! dimension of the requested layout and carries into the slower ones.

use tessera_dtype::{Layout, NativeCoord};

use crate::planner::TileSlabInfo;

/// Per-attribute copy cursor over one tile slab.
#[derive(Debug, Clone)]
pub struct SlabCursor<T> {
    /// Position of the next cell slab, in normalized coordinates.
    pub coords: Vec<T>,
    /// Tile ordinal within the slab, in native tile order.
    pub tile: i64,
    /// Byte offset of the next cell slab in the native buffer.
    pub offset: usize,
    pub done: bool,
}

impl<T: NativeCoord> SlabCursor<T> {
    /// A cursor at the slab origin.
    pub fn at_origin(info: &TileSlabInfo<T>, slab_norm: &[T], attribute_size: usize) -> Self {
        let coords: Vec<T> = (0..slab_norm.len() / 2).map(|d| slab_norm[2 * d]).collect();
        let mut cursor = Self {
            coords,
            tile: 0,
            offset: 0,
            done: false,
        };
        cursor.relocate(info, attribute_size);
        cursor
    }

    /// Advance past the current cell slab in the requested layout.
    ///
    /// Marks the cursor done when it walks off the slab's slowest
    /// dimension; otherwise recomputes the tile and native byte offset.
    pub fn advance(
        &mut self,
        info: &TileSlabInfo<T>,
        slab_norm: &[T],
        requested: Layout,
        attribute_size: usize,
    ) {
        let dim_num = self.coords.len();
        let step = T::from_i64(info.cell_slab_num[self.tile as usize]);
        match requested {
            Layout::RowMajor => {
                let mut d = dim_num - 1;
                self.coords[d] = self.coords[d] + step;
                while d > 0 && self.coords[d] > slab_norm[2 * d + 1] {
                    self.coords[d] = slab_norm[2 * d];
                    d -= 1;
                    self.coords[d] = self.coords[d] + T::one();
                }
                if self.coords[0] > slab_norm[1] {
                    self.done = true;
                    return;
                }
            }
            Layout::ColMajor => {
                let mut d = 0;
                self.coords[d] = self.coords[d] + step;
                while d < dim_num - 1 && self.coords[d] > slab_norm[2 * d + 1] {
                    self.coords[d] = slab_norm[2 * d];
                    d += 1;
                    self.coords[d] = self.coords[d] + T::one();
                }
                if self.coords[dim_num - 1] > slab_norm[2 * (dim_num - 1) + 1] {
                    self.done = true;
                    return;
                }
            }
        }
        self.relocate(info, attribute_size);
    }

    /// Recompute the tile ordinal and native byte offset for the current
    /// coordinates.
    fn relocate(&mut self, info: &TileSlabInfo<T>, attribute_size: usize) {
        self.tile = tile_id(&self.coords, info);
        let cid = cell_id(&self.coords, info, self.tile);
        self.offset = cid as usize * attribute_size;
    }

    /// Byte offset into the native buffer of attribute `a`.
    pub fn native_offset(&self, info: &TileSlabInfo<T>, a: usize) -> usize {
        info.start_offsets[a][self.tile as usize] + self.offset
    }
}

/// Ordinal of the tile containing `coords`, in the slab's native tile
/// order.
pub fn tile_id<T: NativeCoord>(coords: &[T], info: &TileSlabInfo<T>) -> i64 {
    let mut tid = 0;
    for (d, c) in coords.iter().enumerate() {
        let tile_idx = c.tile_index(T::zero(), info.tile_extents[d]);
        tid += (tile_idx - info.tile_box[2 * d]) * info.tile_offset_per_dim[d];
    }
    tid
}

/// Ordinal of `coords` within its tile's overlap box, in the array's
/// native cell order.
pub fn cell_id<T: NativeCoord>(coords: &[T], info: &TileSlabInfo<T>, tile: i64) -> i64 {
    let overlap = &info.range_overlap[tile as usize];
    let strides = &info.cell_offset_per_dim[tile as usize];
    let mut cid = 0;
    for (d, c) in coords.iter().enumerate() {
        cid += (T::span_cells(overlap[2 * d], *c) - 1) * strides[d];
    }
    cid
}
