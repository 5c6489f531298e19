//! Coordinate-box primitives shared by schema arithmetic, the in-memory
//! array and the sorted-read planner.
//!
//! Boxes are flat slices of `2 * dim_num` coordinates, inclusive lo/hi per
//! dimension. All functions are generic over the coordinate type; integer
//! and float coordinates share one contract (see
//! [`NativeCoord`][tessera_dtype::NativeCoord]).

use tessera_dtype::{Layout, NativeCoord};

/// Number of cells in the inclusive range of dimension `d` of `bx`.
pub fn dim_span<T: NativeCoord>(bx: &[T], d: usize) -> i64 {
    T::span_cells(bx[2 * d], bx[2 * d + 1])
}

/// Total number of cells in a box.
pub fn box_cell_num<T: NativeCoord>(bx: &[T]) -> i64 {
    (0..bx.len() / 2).map(|d| dim_span(bx, d)).product()
}

/// The per-dimension tile ordinals covering `bx`, as an `i64` box.
///
/// `bx` must be normalized (origin at the domain lower bound).
pub fn tile_box<T: NativeCoord>(bx: &[T], tile_extents: &[T]) -> Vec<i64> {
    let dim_num = tile_extents.len();
    let mut out = Vec::with_capacity(2 * dim_num);
    for d in 0..dim_num {
        out.push(bx[2 * d].tile_index(T::zero(), tile_extents[d]));
        out.push(bx[2 * d + 1].tile_index(T::zero(), tile_extents[d]));
    }
    out
}

/// The overlap of tile `tile_idx` with the clip box, in normalized
/// coordinates. Returns `None` when the overlap is empty.
pub fn tile_overlap<T: NativeCoord>(
    tile_idx: &[i64],
    tile_extents: &[T],
    clip: &[T],
) -> Option<Vec<T>> {
    let dim_num = tile_extents.len();
    let mut out = Vec::with_capacity(2 * dim_num);
    for d in 0..dim_num {
        let tile_lo = T::from_i64(tile_idx[d]) * tile_extents[d];
        let tile_hi = T::from_i64(tile_idx[d] + 1) * tile_extents[d] - T::one();
        let lo = tile_lo.max_coord(clip[2 * d]);
        let hi = tile_hi.min_coord(clip[2 * d + 1]);
        if hi < lo {
            return None;
        }
        out.push(lo);
        out.push(hi);
    }
    Some(out)
}

/// Set `coords` to the lower corner of `bx`.
pub fn first_coords<T: NativeCoord>(bx: &[T]) -> Vec<T> {
    (0..bx.len() / 2).map(|d| bx[2 * d]).collect()
}

/// Advance `coords` one cell within `bx` in the given layout.
///
/// Returns `false` once the cursor moves past the last cell. Row-major
/// advances the last dimension fastest; column-major the first.
pub fn advance_coords<T: NativeCoord>(coords: &mut [T], bx: &[T], layout: Layout) -> bool {
    let dim_num = coords.len();
    match layout {
        Layout::RowMajor => {
            let mut d = dim_num - 1;
            coords[d] = coords[d] + T::one();
            while d > 0 && coords[d] > bx[2 * d + 1] {
                coords[d] = bx[2 * d];
                d -= 1;
                coords[d] = coords[d] + T::one();
            }
            coords[0] <= bx[1]
        }
        Layout::ColMajor => {
            let mut d = 0;
            coords[d] = coords[d] + T::one();
            while d < dim_num - 1 && coords[d] > bx[2 * d + 1] {
                coords[d] = bx[2 * d];
                d += 1;
                coords[d] = coords[d] + T::one();
            }
            coords[dim_num - 1] <= bx[2 * (dim_num - 1) + 1]
        }
    }
}

/// Rank of `coords` within `bx` in the given layout.
pub fn coords_rank<T: NativeCoord>(coords: &[T], bx: &[T], layout: Layout) -> i64 {
    let dim_num = coords.len();
    let mut rank = 0i64;
    let mut stride = 1i64;
    let dims: Vec<usize> = match layout {
        Layout::RowMajor => (0..dim_num).rev().collect(),
        Layout::ColMajor => (0..dim_num).collect(),
    };
    for d in dims {
        rank += (T::span_cells(bx[2 * d], coords[d]) - 1) * stride;
        stride *= dim_span(bx, d);
    }
    rank
}

/// Strides per dimension for the given layout over `bx`.
pub fn layout_strides<T: NativeCoord>(bx: &[T], layout: Layout) -> Vec<i64> {
    let dim_num = bx.len() / 2;
    let mut strides = vec![0i64; dim_num];
    let mut acc = 1i64;
    match layout {
        Layout::RowMajor => {
            for d in (0..dim_num).rev() {
                strides[d] = acc;
                acc *= dim_span(bx, d);
            }
        }
        Layout::ColMajor => {
            for d in 0..dim_num {
                strides[d] = acc;
                acc *= dim_span(bx, d);
            }
        }
    }
    strides
}
