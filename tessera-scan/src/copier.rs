//! The reorder/copy engine.
//!
//! Consumes one slab's native-order buffers and emits cells into the user
//! buffers in the requested order, one maximal contiguous cell slab per
//! copy. Each attribute progresses independently and stops at its own
//! buffer's edge; an attribute that stops flags overflow and keeps its
//! cursor so a later call can resume exactly where it left off.

use std::sync::atomic::{AtomicBool, Ordering};

use tessera_array::OFFSET_SIZE;
use tessera_buffer::AlignedBuffer;
use tessera_dtype::{Layout, NativeCoord};

use crate::domain::SlabCursor;
use crate::planner::TileSlabInfo;

/// Where one attribute's cells go in the user buffers.
#[derive(Debug, Clone)]
pub struct AttributeMeta {
    /// Bytes per cell in the primary stream (offset width when variable).
    pub size: usize,
    pub var: bool,
    /// Index of the attribute's first buffer, both in the user buffer list
    /// and in the native buffer list.
    pub buffer: usize,
}

/// The caller's buffers for the duration of one `read`, plus write
/// cursors.
#[derive(Debug, Default)]
pub struct CopyState {
    pub buffers: Vec<Vec<u8>>,
    /// Bytes written so far this call, per buffer.
    pub offsets: Vec<usize>,
}

impl CopyState {
    pub fn install(&mut self, buffers: Vec<Vec<u8>>) {
        self.offsets = vec![0; buffers.len()];
        self.buffers = buffers;
    }

    pub fn take(&mut self) -> (Vec<Vec<u8>>, Vec<usize>) {
        (
            std::mem::take(&mut self.buffers),
            std::mem::take(&mut self.offsets),
        )
    }
}

/// Copy as much of the slab as fits, for every attribute.
///
/// Returns true when at least one attribute overflowed; the corresponding
/// flags are raised and the cursors stay where the copy stopped.
#[allow(clippy::too_many_arguments)]
pub fn copy_slab<T: NativeCoord>(
    info: &TileSlabInfo<T>,
    slab_norm: &[T],
    requested: Layout,
    attrs: &[AttributeMeta],
    native: &[AlignedBuffer],
    native_sizes: &[usize],
    cursors: &mut [SlabCursor<T>],
    copy: &mut CopyState,
    overflow: &[AtomicBool],
) -> bool {
    for (a, meta) in attrs.iter().enumerate() {
        if meta.var {
            copy_attribute_var(info, slab_norm, requested, a, meta, native, native_sizes, cursors, copy, overflow);
        } else {
            copy_attribute_fixed(info, slab_norm, requested, a, meta, native, cursors, copy, overflow);
        }
    }
    overflow.iter().any(|f| f.load(Ordering::SeqCst))
}

#[allow(clippy::too_many_arguments)]
fn copy_attribute_fixed<T: NativeCoord>(
    info: &TileSlabInfo<T>,
    slab_norm: &[T],
    requested: Layout,
    a: usize,
    meta: &AttributeMeta,
    native: &[AlignedBuffer],
    cursors: &mut [SlabCursor<T>],
    copy: &mut CopyState,
    overflow: &[AtomicBool],
) {
    let b = meta.buffer;
    let cursor = &mut cursors[a];
    let src = native[b].as_slice();
    while !cursor.done {
        let sz = info.cell_slab_size[a][cursor.tile as usize];
        let dst = copy.offsets[b];
        if dst + sz > copy.buffers[b].len() {
            overflow[a].store(true, Ordering::SeqCst);
            break;
        }
        let start = cursor.native_offset(info, a);
        copy.buffers[b][dst..dst + sz].copy_from_slice(&src[start..start + sz]);
        copy.offsets[b] += sz;
        cursor.advance(info, slab_norm, requested, meta.size);
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_attribute_var<T: NativeCoord>(
    info: &TileSlabInfo<T>,
    slab_norm: &[T],
    requested: Layout,
    a: usize,
    meta: &AttributeMeta,
    native: &[AlignedBuffer],
    native_sizes: &[usize],
    cursors: &mut [SlabCursor<T>],
    copy: &mut CopyState,
    overflow: &[AtomicBool],
) {
    let b = meta.buffer;
    let cursor = &mut cursors[a];
    let cells_in_native = native_sizes[b] / OFFSET_SIZE;
    let native_off = native[b].typed_prefix::<u64>(cells_in_native);
    let native_val = native[b + 1].as_slice();
    let native_val_size = native_sizes[b + 1];

    while !cursor.done {
        let sz = info.cell_slab_size[a][cursor.tile as usize];
        let cells_in_slab = sz / OFFSET_SIZE;
        if copy.offsets[b] + sz > copy.buffers[b].len() {
            overflow[a].store(true, Ordering::SeqCst);
            break;
        }

        let cell_start = cursor.native_offset(info, a) / OFFSET_SIZE;
        let cell_end = cell_start + cells_in_slab;
        let val_start = native_off[cell_start] as usize;
        let val_sz = if cell_end == cells_in_native {
            native_val_size - val_start
        } else {
            native_off[cell_end] as usize - val_start
        };
        if copy.offsets[b + 1] + val_sz > copy.buffers[b + 1].len() {
            overflow[a].store(true, Ordering::SeqCst);
            break;
        }

        // Offsets are rebased so every emitted offset is relative to the
        // start of the user's values buffer for this call.
        let value_cursor = copy.offsets[b + 1] as u64;
        let mut dst = copy.offsets[b];
        for k in 0..cells_in_slab {
            let rebased = value_cursor + (native_off[cell_start + k] - val_start as u64);
            copy.buffers[b][dst..dst + OFFSET_SIZE].copy_from_slice(&rebased.to_ne_bytes());
            dst += OFFSET_SIZE;
        }
        copy.offsets[b] = dst;

        let dst = copy.offsets[b + 1];
        copy.buffers[b + 1][dst..dst + val_sz]
            .copy_from_slice(&native_val[val_start..val_start + val_sz]);
        copy.offsets[b + 1] += val_sz;

        cursor.advance(info, slab_norm, requested, meta.size);
    }
}

#[cfg(test)]
mod tests {
    use tessera_array::{ArraySchema, Attribute, Coords};
    use tessera_dtype::Layout;

    use super::*;
    use crate::planner::TileSlabPlanner;

    fn i32_native(values: &[i32]) -> AlignedBuffer {
        let mut buf = AlignedBuffer::zeroed_io(values.len() * 4);
        for (i, v) in values.iter().enumerate() {
            buf.as_mut_slice()[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        buf
    }

    fn as_i32s(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// 4x6 array, 2x3 tiles, everything row-major: one slab of two tiles.
    fn row_row_slab() -> (crate::planner::PlannedSlab<i32>, AlignedBuffer) {
        let schema = ArraySchema::try_new(
            "grid",
            Coords::from_typed(vec![0i32, 3, 0, 5]),
            Coords::from_typed(vec![2i32, 3]),
            Layout::RowMajor,
            Layout::RowMajor,
            vec![Attribute::fixed("v", 4)],
            true,
        )
        .unwrap();
        let mut planner = TileSlabPlanner::<i32>::try_new(
            &schema,
            &Coords::from_typed(vec![0i32, 1, 0, 5]),
            vec![4],
            Layout::RowMajor,
        )
        .unwrap();
        let slab = planner.next_slab().unwrap();
        // Native order: tile (0,0) rows then tile (0,1) rows.
        let native = i32_native(&[0, 1, 2, 6, 7, 8, 3, 4, 5, 9, 10, 11]);
        (slab, native)
    }

    #[test]
    fn reorders_across_the_tile_boundary() {
        let (slab, native) = row_row_slab();
        let attrs = [AttributeMeta {
            size: 4,
            var: false,
            buffer: 0,
        }];
        let mut cursors = vec![SlabCursor::at_origin(&slab.info, &slab.slab_norm, 4)];
        let mut copy = CopyState::default();
        copy.install(vec![vec![0u8; 48]]);
        let overflow = [AtomicBool::new(false)];

        let overflowed = copy_slab(
            &slab.info,
            &slab.slab_norm,
            Layout::RowMajor,
            &attrs,
            std::slice::from_ref(&native),
            &[48],
            &mut cursors,
            &mut copy,
            &overflow,
        );
        assert!(!overflowed);
        assert!(cursors[0].done);
        let (buffers, offsets) = copy.take();
        assert_eq!(offsets, vec![48]);
        assert_eq!(as_i32s(&buffers[0]), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn overflow_stops_between_cell_slabs_and_resumes() {
        let (slab, native) = row_row_slab();
        let attrs = [AttributeMeta {
            size: 4,
            var: false,
            buffer: 0,
        }];
        let mut cursors = vec![SlabCursor::at_origin(&slab.info, &slab.slab_norm, 4)];
        let overflow = [AtomicBool::new(false)];

        // Room for exactly one 3-cell run.
        let mut copy = CopyState::default();
        copy.install(vec![vec![0u8; 12]]);
        let overflowed = copy_slab(
            &slab.info,
            &slab.slab_norm,
            Layout::RowMajor,
            &attrs,
            std::slice::from_ref(&native),
            &[48],
            &mut cursors,
            &mut copy,
            &overflow,
        );
        assert!(overflowed);
        let (buffers, offsets) = copy.take();
        assert_eq!(offsets, vec![12]);
        assert_eq!(as_i32s(&buffers[0]), vec![0, 1, 2]);

        // Resume with a fresh buffer; the cursor picks up at cell 3.
        overflow[0].store(false, Ordering::SeqCst);
        let mut copy = CopyState::default();
        copy.install(vec![vec![0u8; 36]]);
        let overflowed = copy_slab(
            &slab.info,
            &slab.slab_norm,
            Layout::RowMajor,
            &attrs,
            std::slice::from_ref(&native),
            &[48],
            &mut cursors,
            &mut copy,
            &overflow,
        );
        assert!(!overflowed);
        let (buffers, offsets) = copy.take();
        assert_eq!(offsets, vec![36]);
        assert_eq!(as_i32s(&buffers[0]), (3..12).collect::<Vec<_>>());
    }

    #[test]
    fn var_offsets_are_rebased_to_the_values_cursor() {
        let schema = ArraySchema::try_new(
            "strings",
            Coords::from_typed(vec![0i32, 1, 0, 2]),
            Coords::from_typed(vec![2i32, 3]),
            Layout::RowMajor,
            Layout::RowMajor,
            vec![Attribute::var("s")],
            true,
        )
        .unwrap();
        let mut planner = TileSlabPlanner::<i32>::try_new(
            &schema,
            &Coords::from_typed(vec![0i32, 1, 0, 2]),
            vec![OFFSET_SIZE],
            Layout::RowMajor,
        )
        .unwrap();
        let slab = planner.next_slab().unwrap();

        // Cell k holds "x" * (k % 3 + 1): offsets 0,1,3,6,7,9, 12 bytes.
        let mut off = AlignedBuffer::zeroed_io(48);
        for (i, v) in [0u64, 1, 3, 6, 7, 9].iter().enumerate() {
            off.as_mut_slice()[i * 8..i * 8 + 8].copy_from_slice(&v.to_ne_bytes());
        }
        let mut val = AlignedBuffer::zeroed_io(12);
        val.as_mut_slice().copy_from_slice(b"xxxxxxxxxxxx");
        let native = vec![off, val];

        let attrs = [AttributeMeta {
            size: OFFSET_SIZE,
            var: true,
            buffer: 0,
        }];
        let mut cursors = vec![SlabCursor::at_origin(
            &slab.info,
            &slab.slab_norm,
            OFFSET_SIZE,
        )];
        let mut copy = CopyState::default();
        copy.install(vec![vec![0u8; 48], vec![0u8; 16]]);
        let overflow = [AtomicBool::new(false)];

        let overflowed = copy_slab(
            &slab.info,
            &slab.slab_norm,
            Layout::RowMajor,
            &attrs,
            &native,
            &[48, 12],
            &mut cursors,
            &mut copy,
            &overflow,
        );
        assert!(!overflowed);
        let (buffers, offsets) = copy.take();
        assert_eq!(offsets, vec![48, 12]);
        let got: Vec<u64> = buffers[0]
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(got, vec![0, 1, 3, 6, 7, 9]);
        assert_eq!(&buffers[1][..12], b"xxxxxxxxxxxx");
    }

    #[test]
    fn short_values_buffer_overflows_even_when_offsets_fit() {
        let schema = ArraySchema::try_new(
            "strings",
            Coords::from_typed(vec![0i32, 1, 0, 2]),
            Coords::from_typed(vec![2i32, 3]),
            Layout::RowMajor,
            Layout::RowMajor,
            vec![Attribute::var("s")],
            true,
        )
        .unwrap();
        let mut planner = TileSlabPlanner::<i32>::try_new(
            &schema,
            &Coords::from_typed(vec![0i32, 1, 0, 2]),
            vec![OFFSET_SIZE],
            Layout::RowMajor,
        )
        .unwrap();
        let slab = planner.next_slab().unwrap();

        let mut off = AlignedBuffer::zeroed_io(48);
        for (i, v) in [0u64, 1, 3, 6, 7, 9].iter().enumerate() {
            off.as_mut_slice()[i * 8..i * 8 + 8].copy_from_slice(&v.to_ne_bytes());
        }
        let mut val = AlignedBuffer::zeroed_io(12);
        val.as_mut_slice().copy_from_slice(b"xxxxxxxxxxxx");
        let native = vec![off, val];

        let attrs = [AttributeMeta {
            size: OFFSET_SIZE,
            var: true,
            buffer: 0,
        }];
        let mut cursors = vec![SlabCursor::at_origin(
            &slab.info,
            &slab.slab_norm,
            OFFSET_SIZE,
        )];
        let mut copy = CopyState::default();
        copy.install(vec![vec![0u8; 48], vec![0u8; 4]]);
        let overflow = [AtomicBool::new(false)];

        let overflowed = copy_slab(
            &slab.info,
            &slab.slab_norm,
            Layout::RowMajor,
            &attrs,
            &native,
            &[48, 12],
            &mut cursors,
            &mut copy,
            &overflow,
        );
        assert!(overflowed);
        assert!(overflow[0].load(Ordering::SeqCst));
        assert!(!cursors[0].done);
    }
}
