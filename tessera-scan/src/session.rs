//! Sorted-read sessions.
//!
//! A session binds an [`Array`], a subarray and a requested layout, and
//! streams the subarray's cells into caller buffers in that layout across
//! one or more `read` calls. Internally it runs the classic two-slot
//! pipeline: the caller thread plans tile slabs and posts asynchronous
//! native-order reads, a long-lived copy worker reorders each settled slab
//! into the caller's buffers, and the two alternate between the ping-pong
//! slots so a read overlaps the previous slab's copy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use itertools::izip;
use tessera_array::{
    AioCompletion, AioRequest, Array, CoordSlice, Coords, ReadOutcome, Subarray, UserBuffer,
    OFFSET_SIZE,
};
use tessera_buffer::AlignedBuffer;
use tessera_dtype::{match_each_coord_type, Layout};
use tessera_error::{tessera_bail, tessera_err, TesseraExpect, TesseraResult};

use crate::copier::{copy_slab, AttributeMeta, CopyState};
use crate::domain::SlabCursor;
use crate::planner::{PlannedSlab, TileSlabPlanner};
use crate::slots::{PipeGate, SlotPhase};

/// Messages driving the copy worker. Slabs arrive in post order; shutdown
/// ends the worker cleanly.
enum CopyMessage {
    Slab(usize),
    Shutdown,
}

/// Native-order buffers for one slot. Owned here between reads, by the
/// in-flight request while an AIO is posted, and by the copy worker while
/// it reorders.
struct NativeSlot {
    buffers: Option<Vec<AlignedBuffer>>,
    sizes: Vec<usize>,
}

/// State shared between the caller thread, the copy worker and AIO
/// completions.
struct Shared<T> {
    gate: PipeGate,
    native: [Mutex<NativeSlot>; 2],
    work: [Mutex<Option<PlannedSlab<T>>>; 2],
    copy: Mutex<CopyState>,
    overflow: Vec<AtomicBool>,
    attrs: Vec<AttributeMeta>,
    requested: Layout,
}

/// A sorted read over one subarray.
///
/// Create with [`SortedReadSession::try_new`], then call
/// [`read`][SortedReadSession::read] until it returns
/// [`ReadOutcome::Done`]. A `More` outcome means at least one buffer
/// overflowed; query [`overflow`][SortedReadSession::overflow] per
/// attribute and call `read` again, with larger buffers if desired.
pub struct SortedReadSession {
    inner: Box<dyn SessionOps>,
}

impl std::fmt::Debug for SortedReadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedReadSession").finish_non_exhaustive()
    }
}

impl SortedReadSession {
    pub fn try_new(
        array: Arc<dyn Array>,
        subarray: Subarray,
        requested: Layout,
    ) -> TesseraResult<Self> {
        let schema = array.schema();
        if !schema.dense() {
            tessera_bail!("sorted reads require a dense array");
        }
        schema.check_subarray(&subarray)?;
        if array.attribute_ids().is_empty() {
            tessera_bail!("array was opened with no attributes");
        }
        for &id in array.attribute_ids() {
            schema.attribute(id)?;
        }

        let inner: Box<dyn SessionOps> = match_each_coord_type!(schema.coord_type(), |$T| {
            Box::new(TypedSession::<$T>::try_new(Arc::clone(&array), subarray, requested)?)
        });
        Ok(Self { inner })
    }

    /// Populate `buffers` with the next run of cells in the requested
    /// layout. Buffer order follows the array's attribute ids, with
    /// variable-length attributes contributing an (offsets, values) pair.
    pub fn read(&mut self, buffers: &mut [UserBuffer]) -> TesseraResult<ReadOutcome> {
        self.inner.read(buffers)
    }

    /// Whether the last `read` overflowed for the `a`-th selected
    /// attribute.
    pub fn overflow(&self, a: usize) -> bool {
        self.inner.overflow(a)
    }

    /// Whether every cell of the subarray has been emitted.
    pub fn done(&self) -> bool {
        self.inner.done()
    }
}

trait SessionOps: Send {
    fn read(&mut self, buffers: &mut [UserBuffer]) -> TesseraResult<ReadOutcome>;

    fn overflow(&self, a: usize) -> bool;

    fn done(&self) -> bool;
}

/// The session monomorphized over the array's coordinate type; selected
/// once at creation.
struct TypedSession<T: CoordSlice> {
    array: Arc<dyn Array>,
    subarray: Subarray,
    shared: Arc<Shared<T>>,
    planner: TileSlabPlanner<T>,
    /// A slab planned but not yet posted because the pipeline stopped on
    /// an overflow.
    pending: Option<PlannedSlab<T>>,
    submitter: Option<flume::Sender<CopyMessage>>,
    worker: Option<JoinHandle<()>>,
    /// Slot the next AIO will be posted on.
    aio_slot: usize,
    /// Latest worker suspension this session has already reported as
    /// `More`; later epochs are fresh overflows.
    suspend_seen: u64,
    resume_copy: bool,
    finished: bool,
    /// The requested layout already matches the native order for this
    /// subarray; reads short-circuit to `Array::read_default`.
    delegate: bool,
    buffer_num: usize,
}

impl<T: CoordSlice> TypedSession<T> {
    fn try_new(
        array: Arc<dyn Array>,
        subarray: Subarray,
        requested: Layout,
    ) -> TesseraResult<Self> {
        let schema = array.schema();
        let attribute_ids = array.attribute_ids();

        let mut attrs = Vec::with_capacity(attribute_ids.len());
        let mut buffer = 0;
        for &id in attribute_ids {
            let attribute = schema.attribute(id)?;
            attrs.push(AttributeMeta {
                size: attribute.primary_size(),
                var: attribute.is_var(),
                buffer,
            });
            buffer += attribute.buffer_num();
        }
        let buffer_num = buffer;

        let slab_cells = match requested {
            Layout::RowMajor => schema.tile_slab_cell_num_row(&subarray)?,
            Layout::ColMajor => schema.tile_slab_cell_num_col(&subarray)?,
        } as usize;
        let native = [
            Mutex::new(NativeSlot::allocate(&attrs, slab_cells)),
            Mutex::new(NativeSlot::allocate(&attrs, slab_cells)),
        ];

        let delegate = requested == schema.cell_order() && {
            let stacking = requested.stacking_axis(schema.dim_num());
            let mut contained = true;
            for d in 0..schema.dim_num() {
                if d != stacking && !schema.spans_single_tile(&subarray, d)? {
                    contained = false;
                    break;
                }
            }
            contained
        };

        let planner = TileSlabPlanner::<T>::try_new(
            schema,
            &subarray,
            attrs.iter().map(|m| m.size).collect(),
            requested,
        )?;

        let shared = Arc::new(Shared {
            gate: PipeGate::default(),
            native,
            work: [Mutex::new(None), Mutex::new(None)],
            copy: Mutex::new(CopyState::default()),
            overflow: (0..attrs.len()).map(|_| AtomicBool::new(false)).collect(),
            attrs,
            requested,
        });

        let (submitter, requests) = flume::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("tessera-sorted-copy".to_string())
            .spawn(move || copy_worker(worker_shared, requests))
            .map_err(|e| tessera_err!(Io: "cannot spawn copy worker: {}", e))?;

        Ok(Self {
            array,
            subarray,
            shared,
            planner,
            pending: None,
            submitter: Some(submitter),
            worker: Some(worker),
            aio_slot: 0,
            suspend_seen: 0,
            resume_copy: false,
            finished: false,
            delegate,
            buffer_num,
        })
    }

    fn drive_pipeline(&mut self) -> TesseraResult<ReadOutcome> {
        if self.resume_copy {
            self.resume_copy = false;
            log::debug!("resuming suspended copy");
            self.shared.gate.update(|s| s.resume_pending = true);
        }

        loop {
            let planned = match self.pending.take() {
                Some(planned) => Some(planned),
                None => self.planner.next_slab(),
            };
            let Some(planned) = planned else { break };

            let slot = self.aio_slot;
            let seen = self.suspend_seen;
            let suspended = self.shared.gate.wait_until(|s| {
                // A suspension from a previous call is stale; the worker
                // is about to consume the resume and move on.
                if s.suspended && s.suspend_epoch > seen {
                    Some(Some(s.suspend_epoch))
                } else if s.phases[slot] == SlotPhase::Empty {
                    Some(None)
                } else {
                    None
                }
            })?;
            if let Some(epoch) = suspended {
                // Overflow: keep the slab for the next call. The worker is
                // parked, so nothing else will touch the user buffers.
                self.suspend_seen = epoch;
                self.pending = Some(planned);
                self.resume_copy = true;
                return Ok(ReadOutcome::More);
            }
            self.post(slot, planned)?;
            self.aio_slot = 1 - slot;
        }

        // Let all in-flight copies settle into the user buffers before
        // returning: every slot drained, or the worker parked on overflow.
        let seen = self.suspend_seen;
        let suspended = self.shared.gate.wait_until(|s| {
            if s.suspended && s.suspend_epoch > seen {
                Some(Some(s.suspend_epoch))
            } else if s.phases.iter().all(|p| *p == SlotPhase::Empty) {
                Some(None)
            } else {
                None
            }
        })?;
        if let Some(epoch) = suspended {
            self.suspend_seen = epoch;
            self.resume_copy = true;
            Ok(ReadOutcome::More)
        } else {
            debug_assert!(self.planner.done() && self.pending.is_none());
            self.finished = true;
            Ok(ReadOutcome::Done)
        }
    }

    fn post(&mut self, slot: usize, planned: PlannedSlab<T>) -> TesseraResult<()> {
        let buffers = lock(&self.shared.native[slot])
            .buffers
            .take()
            .tessera_expect("empty slot holds its buffers");
        let subarray = Coords::from_typed(planned.slab.clone());
        *lock(&self.shared.work[slot]) = Some(planned);
        self.shared
            .gate
            .update(|s| s.phases[slot] = SlotPhase::Filling);

        // Queue the copy before posting so the worker sees slots in post
        // order.
        let submit = self
            .submitter
            .as_ref()
            .tessera_expect("submitter lives until drop")
            .send(CopyMessage::Slab(slot));
        if submit.is_err() {
            let err = tessera_err!(Io: "copy worker is gone");
            self.shared
                .gate
                .update(|s| s.failed = Some(err.to_string()));
            return Err(err);
        }

        log::debug!("posting aio on slot {slot} for slab {subarray:?}");
        let shared = Arc::clone(&self.shared);
        let posted = self.array.aio_read(AioRequest {
            slot,
            subarray,
            buffers,
            completion: Box::new(move |completion: AioCompletion| {
                let slot = completion.slot;
                match completion.result {
                    Ok(output) => {
                        log::debug!("aio complete on slot {slot}");
                        let mut native = lock(&shared.native[slot]);
                        native.buffers = Some(output.buffers);
                        native.sizes = output.sizes;
                        drop(native);
                        shared.gate.update(|s| s.phases[slot] = SlotPhase::Ready);
                    }
                    Err(e) => {
                        shared.gate.update(|s| {
                            if s.failed.is_none() {
                                s.failed = Some(e.to_string());
                            }
                        });
                    }
                }
            }),
        });
        if let Err(e) = posted {
            self.shared.gate.update(|s| {
                if s.failed.is_none() {
                    s.failed = Some(e.to_string());
                }
            });
            return Err(e);
        }
        Ok(())
    }
}

impl<T: CoordSlice> SessionOps for TypedSession<T> {
    fn read(&mut self, user: &mut [UserBuffer]) -> TesseraResult<ReadOutcome> {
        if let Some(msg) = self.shared.gate.inspect(|s| s.failed.clone()) {
            tessera_bail!(Io: "{}", msg);
        }
        if user.len() != self.buffer_num {
            tessera_bail!(
                "read carries {} buffers, session expects {}",
                user.len(),
                self.buffer_num
            );
        }
        if self.finished {
            for b in user.iter_mut() {
                let data = b.take_data();
                b.restore(data, 0);
            }
            return Ok(ReadOutcome::Done);
        }
        for flag in &self.shared.overflow {
            flag.store(false, Ordering::SeqCst);
        }

        if self.delegate {
            log::debug!("requested layout matches native order, delegating");
            let flags = self.array.read_default(&self.subarray, user)?;
            let more = flags.iter().any(|f| *f);
            for (flag, got) in self.shared.overflow.iter().zip(&flags) {
                flag.store(*got, Ordering::SeqCst);
            }
            if more {
                return Ok(ReadOutcome::More);
            }
            self.finished = true;
            return Ok(ReadOutcome::Done);
        }

        lock(&self.shared.copy).install(user.iter_mut().map(|b| b.take_data()).collect());

        let outcome = self.drive_pipeline();

        // Hand the storage back to the caller whatever happened; `written`
        // reflects the bytes each buffer actually received this call.
        let (buffers, offsets) = lock(&self.shared.copy).take();
        for (user, data, written) in izip!(user.iter_mut(), buffers, offsets) {
            user.restore(data, written);
        }
        outcome
    }

    fn overflow(&self, a: usize) -> bool {
        self.shared
            .overflow
            .get(a)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn done(&self) -> bool {
        self.finished
    }
}

impl<T: CoordSlice> Drop for TypedSession<T> {
    fn drop(&mut self) {
        if let Some(submitter) = self.submitter.take() {
            let _ = submitter.send(CopyMessage::Shutdown);
        }
        self.shared.gate.update(|s| s.shutdown = true);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("copy worker panicked");
            }
        }
        // In-flight completions hold their own reference to the shared
        // state and settle into it harmlessly after this point.
    }
}

impl NativeSlot {
    /// One full slab's worth of native buffers. Variable-length values get
    /// twice the offsets footprint as a working bound.
    fn allocate(attrs: &[AttributeMeta], slab_cells: usize) -> Self {
        let mut buffers = Vec::new();
        for meta in attrs {
            buffers.push(AlignedBuffer::zeroed_io(slab_cells * meta.size));
            if meta.var {
                buffers.push(AlignedBuffer::zeroed_io(2 * slab_cells * OFFSET_SIZE));
            }
        }
        Self {
            sizes: vec![0; buffers.len()],
            buffers: Some(buffers),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        // The pipeline's shutdown/failed flags keep a poisoned state safe
        // to observe.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The long-lived copy worker: one slab per message, in post order.
fn copy_worker<T: CoordSlice>(shared: Arc<Shared<T>>, requests: flume::Receiver<CopyMessage>) {
    while let Ok(message) = requests.recv() {
        let slot = match message {
            CopyMessage::Shutdown => break,
            CopyMessage::Slab(slot) => slot,
        };
        if handle_slab(&shared, slot).is_err() {
            // Shutdown, or a failure already recorded on the gate; either
            // way the caller sees it through the gate, not through us.
            break;
        }
    }
}

fn handle_slab<T: CoordSlice>(shared: &Shared<T>, slot: usize) -> TesseraResult<()> {
    shared
        .gate
        .wait_until(|s| (s.phases[slot] == SlotPhase::Ready).then_some(()))?;
    shared
        .gate
        .update(|s| s.phases[slot] = SlotPhase::Consuming);
    log::debug!("copy worker consuming slot {slot}");

    let work = lock(&shared.work[slot])
        .take()
        .tessera_expect("slab work set before posting");
    let (native_buffers, native_sizes) = {
        let mut native = lock(&shared.native[slot]);
        let buffers = native
            .buffers
            .take()
            .tessera_expect("completion stored the buffers");
        (buffers, native.sizes.clone())
    };

    let mut cursors: Vec<SlabCursor<T>> = shared
        .attrs
        .iter()
        .map(|meta| SlabCursor::at_origin(&work.info, &work.slab_norm, meta.size))
        .collect();

    loop {
        let overflowed = {
            let mut copy = lock(&shared.copy);
            copy_slab(
                &work.info,
                &work.slab_norm,
                shared.requested,
                &shared.attrs,
                &native_buffers,
                &native_sizes,
                &mut cursors,
                &mut copy,
                &shared.overflow,
            )
        };
        if !overflowed {
            break;
        }
        log::debug!("copy worker suspended on overflow (slot {slot})");
        shared.gate.update(|s| {
            s.suspended = true;
            s.suspend_epoch += 1;
        });
        shared.gate.wait_until(|s| {
            if s.resume_pending {
                s.resume_pending = false;
                s.suspended = false;
                Some(())
            } else {
                None
            }
        })?;
    }

    // Return the buffers so the reader can post the next slab here.
    lock(&shared.native[slot]).buffers = Some(native_buffers);
    shared.gate.update(|s| s.phases[slot] = SlotPhase::Empty);
    Ok(())
}
