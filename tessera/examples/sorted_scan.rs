//! Read a tiled array back in row-major order, resuming across small
//! buffers.

use std::sync::Arc;

use tessera::scan::SortedReadSession;
use tessera::{
    ArraySchema, Attribute, AttributeData, Coords, MemoryArray, ReadOutcome, UserBuffer,
};
use tessera::dtype::Layout;
use tessera::error::TesseraResult;

fn main() -> TesseraResult<()> {
    // An 8x6 dense array of i32 cells, stored as 4x3 tiles with
    // column-major cells inside each tile.
    let schema = ArraySchema::try_new(
        "demo",
        Coords::from_typed(vec![0i32, 7, 0, 5]),
        Coords::from_typed(vec![4i32, 3]),
        Layout::RowMajor,
        Layout::ColMajor,
        vec![Attribute::fixed("rank", 4)],
        true,
    )?;
    let cells: Vec<i32> = (0..48).collect();
    let array = Arc::new(MemoryArray::try_new(
        schema,
        vec![AttributeData::fixed_i32(&cells)],
    )?);

    let mut session = SortedReadSession::try_new(
        array,
        Coords::from_typed(vec![1i32, 6, 1, 4]),
        Layout::RowMajor,
    )?;

    // 40 bytes per call: ten cells at a time, resumed until done.
    loop {
        let mut buffers = vec![UserBuffer::with_capacity(40)];
        let outcome = session.read(&mut buffers)?;
        let cells: Vec<i32> = buffers[0]
            .bytes()
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        println!("read {:?} ({:?})", cells, outcome);
        if outcome == ReadOutcome::Done {
            break;
        }
    }
    Ok(())
}
