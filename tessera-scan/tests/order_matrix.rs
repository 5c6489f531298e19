//! Cross-product of tile order, cell order, requested layout and subarray
//! placement, checked against a reference model.
//!
//! The model is the definition itself: the cells of the subarray listed in
//! the requested global order. Whatever the storage layout, the
//! concatenation of all `read` calls must equal it exactly, with no
//! duplicates and no omissions.

use std::sync::Arc;

use rstest::rstest;
use tessera_array::cellmath::{advance_coords, coords_rank, first_coords};
use tessera_array::{
    ArraySchema, Attribute, AttributeData, Coords, MemoryArray, ReadOutcome, UserBuffer,
};
use tessera_dtype::Layout;
use tessera_scan::SortedReadSession;

fn as_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// The subarray's cells in the requested order, as row-major ranks over
/// the full domain.
fn reference(domain: &[i32], subarray: &[i32], requested: Layout) -> Vec<i32> {
    let domain_box: Vec<i32> = (0..domain.len() / 2)
        .flat_map(|d| [0, domain[2 * d + 1] - domain[2 * d]])
        .collect();
    let sub_norm: Vec<i32> = (0..domain.len() / 2)
        .flat_map(|d| {
            [
                subarray[2 * d] - domain[2 * d],
                subarray[2 * d + 1] - domain[2 * d],
            ]
        })
        .collect();
    let mut out = Vec::new();
    let mut coords = first_coords(&sub_norm);
    loop {
        out.push(coords_rank(&coords, &domain_box, Layout::RowMajor) as i32);
        if !advance_coords(&mut coords, &sub_norm, requested) {
            break;
        }
    }
    out
}

fn run_session(
    tile_order: Layout,
    cell_order: Layout,
    requested: Layout,
    subarray: Vec<i32>,
    buffer_len: usize,
) -> Vec<i32> {
    let domain = vec![0i32, 10, 0, 8];
    let schema = ArraySchema::try_new(
        "matrix",
        Coords::from_typed(domain.clone()),
        Coords::from_typed(vec![4i32, 3]),
        tile_order,
        cell_order,
        vec![Attribute::fixed("v", 4)],
        true,
    )
    .unwrap();
    let cells: Vec<i32> = (0..schema.cell_num(schema.domain()).unwrap() as i32).collect();
    let cell_num = cells.len();
    let array =
        Arc::new(MemoryArray::try_new(schema, vec![AttributeData::fixed_i32(&cells)]).unwrap());

    let mut session =
        SortedReadSession::try_new(array, Coords::from_typed(subarray), requested).unwrap();

    let mut emitted = Vec::new();
    let mut calls = 0;
    loop {
        let mut buffers = vec![UserBuffer::with_capacity(buffer_len)];
        let outcome = session.read(&mut buffers).unwrap();
        emitted.extend(as_i32s(buffers[0].bytes()));
        calls += 1;
        assert!(calls <= 4 * cell_num + 4, "no forward progress");
        if outcome == ReadOutcome::Done {
            break;
        }
    }
    emitted
}

#[rstest]
fn every_order_combination_streams_the_reference(
    #[values(Layout::RowMajor, Layout::ColMajor)] tile_order: Layout,
    #[values(Layout::RowMajor, Layout::ColMajor)] cell_order: Layout,
    #[values(Layout::RowMajor, Layout::ColMajor)] requested: Layout,
) {
    // Off-origin, tile-misaligned subarrays on both ends.
    for subarray in [
        vec![0i32, 10, 0, 8],
        vec![2, 9, 1, 7],
        vec![3, 3, 0, 8],
        vec![5, 10, 4, 5],
    ] {
        let domain = vec![0i32, 10, 0, 8];
        let expected = reference(&domain, &subarray, requested);
        // Ample buffer: single call.
        let got = run_session(tile_order, cell_order, requested, subarray.clone(), 4096);
        assert_eq!(got, expected, "single call, subarray {subarray:?}");
        // Starved buffer, one maximal cell slab wide: resumption must not
        // duplicate or drop cells.
        let got = run_session(tile_order, cell_order, requested, subarray.clone(), 24);
        assert_eq!(got, expected, "starved calls, subarray {subarray:?}");
    }
}
