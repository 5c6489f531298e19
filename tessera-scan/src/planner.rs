//! Tile-slab planning.
//!
//! The planner cuts the user subarray into tile slabs: hyper-rectangles one
//! tile thick along the stacking axis, produced in requested-order
//! succession. For each slab it precomputes everything the copy loop needs
//! per overlapping tile: the overlap box, the maximal contiguous run
//! length, native-order strides, and where each tile's cells start in the
//! native buffer.

use tessera_array::cellmath::{
    advance_coords, box_cell_num, dim_span, first_coords, layout_strides, tile_box, tile_overlap,
};
use tessera_array::{ArraySchema, CoordSlice, Subarray};
use tessera_dtype::Layout;
use tessera_error::TesseraResult;

/// Everything the copy loop consumes for one tile slab.
///
/// Tiles are indexed by their ordinal in the array's native tile order
/// restricted to the slab; that ordering also defines where each tile's
/// cells land in the native buffer.
#[derive(Debug, Clone)]
pub struct TileSlabInfo<T> {
    pub tile_num: i64,
    pub tile_extents: Vec<T>,
    /// Tile-ordinal bounds of the slab, per dimension.
    pub tile_box: Vec<i64>,
    /// Stride between tiles per dimension, in native tile order.
    pub tile_offset_per_dim: Vec<i64>,
    /// Per tile: overlap with the slab, normalized.
    pub range_overlap: Vec<Vec<T>>,
    /// Per tile: cells in one maximal contiguous run of the requested
    /// order that is also contiguous in native order.
    pub cell_slab_num: Vec<i64>,
    /// Per tile: native cell-order strides within the overlap box.
    pub cell_offset_per_dim: Vec<Vec<i64>>,
    /// Per attribute, per tile: bytes in one cell slab.
    pub cell_slab_size: Vec<Vec<usize>>,
    /// Per attribute, per tile: byte offset of the tile's first cell in
    /// the native buffer.
    pub start_offsets: Vec<Vec<usize>>,
}

/// One planned slab: global coordinates for the I/O request, normalized
/// coordinates for the copy loop.
#[derive(Debug, Clone)]
pub struct PlannedSlab<T> {
    pub slab: Vec<T>,
    pub slab_norm: Vec<T>,
    pub info: TileSlabInfo<T>,
}

pub struct TileSlabPlanner<T> {
    subarray: Vec<T>,
    domain: Vec<T>,
    tile_extents: Vec<T>,
    attribute_sizes: Vec<usize>,
    requested: Layout,
    tile_order: Layout,
    cell_order: Layout,
    stacking: usize,
    /// Upper bound of the previously planned slab along the stacking axis.
    prev_hi: Option<T>,
    done: bool,
}

impl<T: CoordSlice> TileSlabPlanner<T> {
    pub fn try_new(
        schema: &ArraySchema,
        subarray: &Subarray,
        attribute_sizes: Vec<usize>,
        requested: Layout,
    ) -> TesseraResult<Self> {
        let subarray = subarray.as_typed::<T>()?.to_vec();
        let domain = schema.domain().as_typed::<T>()?.to_vec();
        let tile_extents = schema.tile_extents().as_typed::<T>()?.to_vec();
        Ok(Self {
            stacking: requested.stacking_axis(schema.dim_num()),
            subarray,
            domain,
            tile_extents,
            attribute_sizes,
            requested,
            tile_order: schema.tile_order(),
            cell_order: schema.cell_order(),
            prev_hi: None,
            done: false,
        })
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Plan the next slab along the stacking axis, or `None` when the
    /// subarray is exhausted.
    pub fn next_slab(&mut self) -> Option<PlannedSlab<T>> {
        if self.done {
            return None;
        }
        let s = self.stacking;
        let extent = self.tile_extents[s];
        let sub_lo = self.subarray[2 * s];
        let sub_hi = self.subarray[2 * s + 1];

        let (lo, hi) = match self.prev_hi {
            None => {
                // Clip the first slab to the tile boundary past the
                // subarray's lower bound.
                let tile = sub_lo.tile_index(self.domain[2 * s], extent);
                let tile_hi =
                    self.domain[2 * s] + T::from_i64(tile + 1) * extent - T::one();
                (sub_lo, tile_hi.min_coord(sub_hi))
            }
            Some(prev_hi) => {
                if prev_hi == sub_hi {
                    self.done = true;
                    return None;
                }
                let lo = prev_hi + T::one();
                (lo, (lo + extent - T::one()).min_coord(sub_hi))
            }
        };
        self.prev_hi = Some(hi);

        let mut slab = self.subarray.clone();
        slab[2 * s] = lo;
        slab[2 * s + 1] = hi;
        let dim_num = self.tile_extents.len();
        let mut slab_norm = Vec::with_capacity(2 * dim_num);
        for d in 0..dim_num {
            slab_norm.push(slab[2 * d] - self.domain[2 * d]);
            slab_norm.push(slab[2 * d + 1] - self.domain[2 * d]);
        }

        let info = self.slab_info(&slab_norm);
        Some(PlannedSlab {
            slab,
            slab_norm,
            info,
        })
    }

    fn slab_info(&self, slab_norm: &[T]) -> TileSlabInfo<T> {
        let anum = self.attribute_sizes.len();
        let tiles = tile_box(slab_norm, &self.tile_extents);
        let tile_offset_per_dim = layout_strides(&tiles, self.tile_order);
        let tile_num = box_cell_num(&tiles);

        let mut info = TileSlabInfo {
            tile_num,
            tile_extents: self.tile_extents.clone(),
            tile_box: tiles.clone(),
            tile_offset_per_dim,
            range_overlap: Vec::with_capacity(tile_num as usize),
            cell_slab_num: Vec::with_capacity(tile_num as usize),
            cell_offset_per_dim: Vec::with_capacity(tile_num as usize),
            cell_slab_size: vec![Vec::with_capacity(tile_num as usize); anum],
            start_offsets: vec![Vec::with_capacity(tile_num as usize); anum],
        };

        // Visit tiles in native tile order; the ordinal doubles as the
        // position of the tile's cells in the native buffer.
        let mut total_cells = 0i64;
        let mut tile = first_coords(&tiles);
        loop {
            let overlap = match tile_overlap(&tile, &self.tile_extents, slab_norm) {
                Some(overlap) => overlap,
                // Every tile of the slab's tile box overlaps the slab.
                None => unreachable!("tile box member without overlap"),
            };
            let tile_cells = box_cell_num(&overlap);
            let slab_cells = self.cell_slab_num(&tiles, &overlap);
            info.cell_offset_per_dim
                .push(layout_strides(&overlap, self.cell_order));
            for (a, &size) in self.attribute_sizes.iter().enumerate() {
                info.cell_slab_size[a].push(slab_cells as usize * size);
                info.start_offsets[a].push(total_cells as usize * size);
            }
            info.cell_slab_num.push(slab_cells);
            info.range_overlap.push(overlap);
            total_cells += tile_cells;

            if !advance_coords(&mut tile, &tiles, self.tile_order) {
                break;
            }
        }
        info
    }

    /// Largest run of requested-order cells that is also contiguous in the
    /// native buffer.
    ///
    /// When the requested and native cell orders disagree no two
    /// consecutive cells are adjacent on disk, so the run is a single
    /// cell. When they agree the run covers the overlap's fastest
    /// dimension, and keeps folding in the next-slower dimension as long
    /// as the slab is a single tile wide along every faster one.
    fn cell_slab_num(&self, tiles: &[i64], overlap: &[T]) -> i64 {
        if self.requested != self.cell_order {
            return 1;
        }
        let dim_num = overlap.len() / 2;
        match self.requested {
            Layout::RowMajor => {
                let mut n = dim_span(overlap, dim_num - 1);
                for d in (1..dim_num).rev() {
                    if dim_span(tiles, d) == 1 {
                        n *= dim_span(overlap, d - 1);
                    } else {
                        break;
                    }
                }
                n
            }
            Layout::ColMajor => {
                let mut n = dim_span(overlap, 0);
                for d in 0..dim_num - 1 {
                    if dim_span(tiles, d) == 1 {
                        n *= dim_span(overlap, d + 1);
                    } else {
                        break;
                    }
                }
                n
            }
        }
    }
}
