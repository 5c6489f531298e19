//! An in-memory dense [`Array`].
//!
//! Cell data is held per attribute in logical row-major order over the full
//! domain; reads translate that into the array's native tile/cell order.
//! Asynchronous reads are serviced on a dedicated worker thread fed by a
//! channel, so completions genuinely race with the caller the way an I/O
//! scheduler's would.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use itertools::izip;
use tessera_buffer::AlignedBuffer;
use tessera_dtype::{match_each_coord_type, Layout};
use tessera_error::{tessera_bail, tessera_err, tessera_panic, TesseraResult};

use crate::array::{AioCompletion, AioOutput, AioRequest, Array, UserBuffer};
use crate::cellmath::{advance_coords, coords_rank, first_coords, tile_box, tile_overlap};
use crate::coords::{CoordSlice, Subarray};
use crate::schema::{ArraySchema, OFFSET_SIZE};

/// Backing storage for one attribute, in logical row-major cell order over
/// the full domain.
#[derive(Debug, Clone)]
pub enum AttributeData {
    Fixed(Vec<u8>),
    /// `offsets` has one entry per cell plus a final entry equal to
    /// `values.len()`.
    Var { offsets: Vec<u64>, values: Vec<u8> },
}

impl AttributeData {
    pub fn fixed_i32(values: &[i32]) -> Self {
        Self::Fixed(values.iter().flat_map(|v| v.to_ne_bytes()).collect())
    }

    pub fn fixed_i64(values: &[i64]) -> Self {
        Self::Fixed(values.iter().flat_map(|v| v.to_ne_bytes()).collect())
    }

    pub fn fixed_f64(values: &[f64]) -> Self {
        Self::Fixed(values.iter().flat_map(|v| v.to_ne_bytes()).collect())
    }

    pub fn var_from_strs<S: AsRef<str>>(cells: &[S]) -> Self {
        let mut offsets = Vec::with_capacity(cells.len() + 1);
        let mut values = Vec::new();
        for cell in cells {
            offsets.push(values.len() as u64);
            values.extend_from_slice(cell.as_ref().as_bytes());
        }
        offsets.push(values.len() as u64);
        Self::Var { offsets, values }
    }
}

struct Inner {
    schema: ArraySchema,
    attribute_ids: Vec<usize>,
    data: Vec<AttributeData>,
}

/// Cursor for the resumable synchronous read path.
struct DefaultReadState {
    subarray: Option<Subarray>,
    /// Cells already emitted, per selected attribute.
    emitted: Vec<i64>,
}

pub struct MemoryArray {
    inner: Arc<Inner>,
    submitter: Option<flume::Sender<AioRequest>>,
    worker: Option<JoinHandle<()>>,
    default_read: Mutex<DefaultReadState>,
}

impl MemoryArray {
    /// Build an array over all attributes of `schema`.
    pub fn try_new(schema: ArraySchema, data: Vec<AttributeData>) -> TesseraResult<Self> {
        let attribute_ids = (0..schema.attributes().len()).collect();
        Self::try_new_with_attributes(schema, attribute_ids, data)
    }

    /// Build an array reading a subset of attributes, in id order.
    pub fn try_new_with_attributes(
        schema: ArraySchema,
        attribute_ids: Vec<usize>,
        data: Vec<AttributeData>,
    ) -> TesseraResult<Self> {
        if data.len() != schema.attributes().len() {
            tessera_bail!(
                "expected {} attribute payloads, got {}",
                schema.attributes().len(),
                data.len()
            );
        }
        if attribute_ids.is_empty() {
            tessera_bail!("attribute selection is empty");
        }
        let cell_num = schema.cell_num(schema.domain())?;
        for (id, payload) in data.iter().enumerate() {
            let attribute = schema.attribute(id)?;
            match (payload, attribute.cell_size()) {
                (AttributeData::Fixed(bytes), Some(cell_size)) => {
                    if bytes.len() as i64 != cell_num * cell_size as i64 {
                        tessera_bail!(
                            "attribute {} holds {} bytes, expected {}",
                            attribute.name(),
                            bytes.len(),
                            cell_num * cell_size as i64
                        );
                    }
                }
                (AttributeData::Var { offsets, values }, None) => {
                    if offsets.len() as i64 != cell_num + 1 {
                        tessera_bail!(
                            "attribute {} holds {} offsets, expected {}",
                            attribute.name(),
                            offsets.len(),
                            cell_num + 1
                        );
                    }
                    if offsets.last().copied() != Some(values.len() as u64) {
                        tessera_bail!(
                            "attribute {} offsets do not close over the values",
                            attribute.name()
                        );
                    }
                }
                _ => tessera_bail!(
                    "attribute {} payload does not match its schema kind",
                    attribute.name()
                ),
            }
        }
        let selected = attribute_ids.len();
        let inner = Arc::new(Inner {
            schema,
            attribute_ids,
            data,
        });

        let (submitter, requests) = flume::unbounded::<AioRequest>();
        let service = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("tessera-memory-aio".to_string())
            .spawn(move || {
                while let Ok(request) = requests.recv() {
                    let slot = request.slot;
                    let completion = request.completion;
                    let result = service.fill_native(&request.subarray, request.buffers);
                    completion(AioCompletion { slot, result });
                }
            })
            .map_err(|e| tessera_err!(Io: "cannot spawn aio worker: {}", e))?;

        Ok(Self {
            inner,
            submitter: Some(submitter),
            worker: Some(worker),
            default_read: Mutex::new(DefaultReadState {
                subarray: None,
                emitted: vec![0; selected],
            }),
        })
    }
}

impl Drop for MemoryArray {
    fn drop(&mut self) {
        // Closing the channel stops the worker after in-flight requests
        // settle.
        drop(self.submitter.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("memory aio worker panicked");
            }
        }
    }
}

impl Array for MemoryArray {
    fn schema(&self) -> &ArraySchema {
        &self.inner.schema
    }

    fn attribute_ids(&self) -> &[usize] {
        &self.inner.attribute_ids
    }

    fn aio_read(&self, request: AioRequest) -> TesseraResult<()> {
        let submitter = self
            .submitter
            .as_ref()
            .unwrap_or_else(|| tessera_panic!("aio submitter gone before drop"));
        submitter
            .send(request)
            .map_err(|_| tessera_err!(Io: "aio worker is gone"))
    }

    fn read_default(
        &self,
        subarray: &Subarray,
        buffers: &mut [UserBuffer],
    ) -> TesseraResult<Vec<bool>> {
        let mut state = self
            .default_read
            .lock()
            .map_err(|_| tessera_err!(Io: "default read state poisoned"))?;
        if state.subarray.as_ref() != Some(subarray) {
            state.subarray = Some(subarray.clone());
            state.emitted = vec![0; self.inner.attribute_ids.len()];
        }
        self.inner.read_default(subarray, &mut state.emitted, buffers)
    }
}

impl Inner {
    /// Fill native-order buffers for one subarray: tiles in tile order,
    /// cells within each tile's overlap in cell order.
    fn fill_native(
        &self,
        subarray: &Subarray,
        mut buffers: Vec<AlignedBuffer>,
    ) -> TesseraResult<AioOutput> {
        self.schema.check_subarray(subarray)?;
        if buffers.len() != self.schema.buffer_num(&self.attribute_ids)? {
            tessera_bail!(Io: "aio request carries {} buffers", buffers.len());
        }

        let mut cursors = vec![0usize; buffers.len()];
        self.for_each_native_cell(subarray, |rank| {
            self.emit_cell(rank, &mut buffers, &mut cursors)
        })?;

        Ok(AioOutput {
            buffers,
            sizes: cursors,
        })
    }

    /// Resumable native-order read into caller buffers.
    fn read_default(
        &self,
        subarray: &Subarray,
        emitted: &mut [i64],
        buffers: &mut [UserBuffer],
    ) -> TesseraResult<Vec<bool>> {
        if buffers.len() != self.schema.buffer_num(&self.attribute_ids)? {
            tessera_bail!("read carries {} buffers", buffers.len());
        }

        let mut overflow = vec![false; self.attribute_ids.len()];
        let mut storage: Vec<Vec<u8>> = buffers.iter_mut().map(|b| b.take_data()).collect();
        let mut cursors = vec![0usize; storage.len()];

        for (a, &id) in self.attribute_ids.iter().enumerate() {
            let b = self.buffer_index(a);
            let mut index = 0i64;
            let mut full = false;
            self.for_each_native_cell(subarray, |rank| {
                let skip = index < emitted[a];
                index += 1;
                if skip || full {
                    return Ok(());
                }
                if self.try_emit_cell_user(id, b, rank, &mut storage, &mut cursors)? {
                    emitted[a] += 1;
                } else {
                    full = true;
                    overflow[a] = true;
                }
                Ok(())
            })?;
        }

        for (buffer, data, cursor) in izip!(buffers.iter_mut(), storage, cursors) {
            buffer.restore(data, cursor);
        }
        Ok(overflow)
    }

    /// Index of the first caller buffer for the `a`-th selected attribute.
    fn buffer_index(&self, a: usize) -> usize {
        let mut b = 0;
        for &id in &self.attribute_ids[..a] {
            b += if self.schema.attributes()[id].is_var() {
                2
            } else {
                1
            };
        }
        b
    }

    /// Visit every cell of `subarray` in native order, passing its logical
    /// row-major rank over the full domain.
    fn for_each_native_cell(
        &self,
        subarray: &Subarray,
        mut visit: impl FnMut(i64) -> TesseraResult<()>,
    ) -> TesseraResult<()> {
        match_each_coord_type!(self.schema.coord_type(), |$T| {
            self.for_each_native_cell_typed::<$T>(subarray, &mut visit)
        })
    }

    fn for_each_native_cell_typed<T: CoordSlice>(
        &self,
        subarray: &Subarray,
        visit: &mut impl FnMut(i64) -> TesseraResult<()>,
    ) -> TesseraResult<()> {
        let sub = subarray.as_typed::<T>()?;
        let domain = self.schema.domain().as_typed::<T>()?;
        let extents = self.schema.tile_extents().as_typed::<T>()?;
        let dim_num = self.schema.dim_num();

        // Normalize to the domain origin.
        let mut sub_norm = Vec::with_capacity(2 * dim_num);
        let mut domain_norm = Vec::with_capacity(2 * dim_num);
        for d in 0..dim_num {
            sub_norm.push(sub[2 * d] - domain[2 * d]);
            sub_norm.push(sub[2 * d + 1] - domain[2 * d]);
            domain_norm.push(T::zero());
            domain_norm.push(domain[2 * d + 1] - domain[2 * d]);
        }

        let tiles = tile_box(&sub_norm, extents);
        let mut tile = first_coords(&tiles);
        loop {
            if let Some(overlap) = tile_overlap(&tile, extents, &sub_norm) {
                let mut cell = first_coords(&overlap);
                loop {
                    visit(coords_rank(&cell, &domain_norm, Layout::RowMajor))?;
                    if !advance_coords(&mut cell, &overlap, self.schema.cell_order()) {
                        break;
                    }
                }
            }
            if !advance_coords(&mut tile, &tiles, self.schema.tile_order()) {
                break;
            }
        }
        Ok(())
    }

    /// Append one cell's data for every selected attribute into the native
    /// buffers at `cursors`.
    fn emit_cell(
        &self,
        rank: i64,
        buffers: &mut [AlignedBuffer],
        cursors: &mut [usize],
    ) -> TesseraResult<()> {
        let mut b = 0;
        for &id in &self.attribute_ids {
            match (&self.data[id], self.schema.attributes()[id].cell_size()) {
                (AttributeData::Fixed(bytes), Some(cell_size)) => {
                    let src = rank as usize * cell_size;
                    let dst = cursors[b];
                    let out = buffers[b].as_mut_slice();
                    if dst + cell_size > out.len() {
                        tessera_bail!(Io: "native buffer exhausted for attribute {}", id);
                    }
                    out[dst..dst + cell_size].copy_from_slice(&bytes[src..src + cell_size]);
                    cursors[b] += cell_size;
                    b += 1;
                }
                (AttributeData::Var { offsets, values }, None) => {
                    let start = offsets[rank as usize] as usize;
                    let end = offsets[rank as usize + 1] as usize;
                    let len = end - start;

                    let off_dst = cursors[b];
                    let out = buffers[b].as_mut_slice();
                    if off_dst + OFFSET_SIZE > out.len() {
                        tessera_bail!(Io: "native offsets buffer exhausted for attribute {}", id);
                    }
                    out[off_dst..off_dst + OFFSET_SIZE]
                        .copy_from_slice(&(cursors[b + 1] as u64).to_ne_bytes());
                    cursors[b] += OFFSET_SIZE;

                    let val_dst = cursors[b + 1];
                    let out = buffers[b + 1].as_mut_slice();
                    if val_dst + len > out.len() {
                        tessera_bail!(Io: "native values buffer exhausted for attribute {}", id);
                    }
                    out[val_dst..val_dst + len].copy_from_slice(&values[start..end]);
                    cursors[b + 1] += len;
                    b += 2;
                }
                _ => tessera_panic!("attribute {} payload drifted from its schema", id),
            }
        }
        Ok(())
    }

    /// Copy one cell for one attribute into user storage. Returns `false`
    /// without writing anything when the cell does not fit.
    fn try_emit_cell_user(
        &self,
        id: usize,
        b: usize,
        rank: i64,
        storage: &mut [Vec<u8>],
        cursors: &mut [usize],
    ) -> TesseraResult<bool> {
        match (&self.data[id], self.schema.attributes()[id].cell_size()) {
            (AttributeData::Fixed(bytes), Some(cell_size)) => {
                let dst = cursors[b];
                if dst + cell_size > storage[b].len() {
                    return Ok(false);
                }
                let src = rank as usize * cell_size;
                storage[b][dst..dst + cell_size].copy_from_slice(&bytes[src..src + cell_size]);
                cursors[b] += cell_size;
                Ok(true)
            }
            (AttributeData::Var { offsets, values }, None) => {
                let start = offsets[rank as usize] as usize;
                let end = offsets[rank as usize + 1] as usize;
                let len = end - start;
                if cursors[b] + OFFSET_SIZE > storage[b].len()
                    || cursors[b + 1] + len > storage[b + 1].len()
                {
                    return Ok(false);
                }
                let off = (cursors[b + 1] as u64).to_ne_bytes();
                let dst = cursors[b];
                storage[b][dst..dst + OFFSET_SIZE].copy_from_slice(&off);
                cursors[b] += OFFSET_SIZE;
                let dst = cursors[b + 1];
                storage[b + 1][dst..dst + len].copy_from_slice(&values[start..end]);
                cursors[b + 1] += len;
                Ok(true)
            }
            _ => tessera_panic!("attribute {} payload drifted from its schema", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_buffer::AlignedBuffer;

    use super::*;
    use crate::coords::Coords;
    use crate::schema::Attribute;

    fn rank_schema(cell_order: Layout) -> ArraySchema {
        ArraySchema::try_new(
            "grid",
            Coords::from_typed(vec![0i32, 3, 0, 5]),
            Coords::from_typed(vec![2i32, 3]),
            Layout::RowMajor,
            cell_order,
            vec![Attribute::fixed("v", 4)],
            true,
        )
        .unwrap()
    }

    fn rank_array(cell_order: Layout) -> MemoryArray {
        let cells: Vec<i32> = (0..24).collect();
        MemoryArray::try_new(rank_schema(cell_order), vec![AttributeData::fixed_i32(&cells)])
            .unwrap()
    }

    fn as_i32s(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn aio_read_produces_native_order() {
        let array = rank_array(Layout::RowMajor);
        let (tx, rx) = flume::bounded(1);
        let request = AioRequest {
            slot: 0,
            subarray: Coords::from_typed(vec![0i32, 3, 0, 5]),
            buffers: vec![AlignedBuffer::zeroed_io(96)],
            completion: Box::new(move |c| {
                tx.send(c).ok();
            }),
        };
        array.aio_read(request).unwrap();
        let completion = rx.recv().unwrap();
        assert_eq!(completion.slot, 0);
        let output = completion.result.unwrap();
        assert_eq!(output.sizes, vec![96]);
        // Tiles 2x3 in row-major tile order, cells row-major within tiles.
        let got = as_i32s(&output.buffers[0].as_slice()[..96]);
        assert_eq!(
            got[..12],
            [0, 1, 2, 6, 7, 8, 3, 4, 5, 9, 10, 11][..]
        );
    }

    #[test]
    fn aio_read_clips_to_subarray() {
        let array = rank_array(Layout::RowMajor);
        let (tx, rx) = flume::bounded(1);
        array
            .aio_read(AioRequest {
                slot: 1,
                subarray: Coords::from_typed(vec![1i32, 2, 1, 4]),
                buffers: vec![AlignedBuffer::zeroed_io(32)],
                completion: Box::new(move |c| {
                    tx.send(c).ok();
                }),
            })
            .unwrap();
        let output = rx.recv().unwrap().result.unwrap();
        assert_eq!(output.sizes, vec![32]);
        let got = as_i32s(&output.buffers[0].as_slice()[..32]);
        // Tile (0,0) contributes (1,1)..(1,2); tile (0,1) contributes
        // (1,3)..(1,4); tile (1,0) contributes (2,1)..(2,2); tile (1,1)
        // contributes (2,3)..(2,4).
        assert_eq!(got, vec![7, 8, 9, 10, 13, 14, 15, 16]);
    }

    #[test]
    fn read_default_resumes_after_overflow() {
        let array = rank_array(Layout::RowMajor);
        let subarray = Coords::from_typed(vec![0i32, 3, 0, 5]);
        let mut buffers = vec![UserBuffer::with_capacity(48)];
        let overflow = array.read_default(&subarray, &mut buffers).unwrap();
        assert_eq!(overflow, vec![true]);
        let first = as_i32s(buffers[0].bytes());
        assert_eq!(first.len(), 12);

        let overflow = array.read_default(&subarray, &mut buffers).unwrap();
        assert_eq!(overflow, vec![false]);
        let second = as_i32s(buffers[0].bytes());
        assert_eq!(first.into_iter().chain(second).count(), 24);
    }

    #[test]
    fn var_attribute_round_trip() {
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
        let array = MemoryArray::try_new(
            schema,
            vec![AttributeData::var_from_strs(&["x", "xx", "xxx", "x", "xx", "xxx"])],
        )
        .unwrap();

        let (tx, rx) = flume::bounded(1);
        array
            .aio_read(AioRequest {
                slot: 0,
                subarray: Coords::from_typed(vec![0i32, 1, 0, 2]),
                buffers: vec![AlignedBuffer::zeroed_io(48), AlignedBuffer::zeroed_io(64)],
                completion: Box::new(move |c| {
                    tx.send(c).ok();
                }),
            })
            .unwrap();
        let output = rx.recv().unwrap().result.unwrap();
        assert_eq!(output.sizes, vec![48, 12]);
        assert_eq!(output.buffers[0].typed_prefix::<u64>(6), &[0, 1, 3, 6, 7, 9]);
        assert_eq!(&output.buffers[1].as_slice()[..12], b"xxxxxxxxxxxx");
    }
}
