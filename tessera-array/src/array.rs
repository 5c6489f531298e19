//! The storage collaborator surface.
//!
//! An [`Array`] provides one primitive: an asynchronous read of an
//! axis-aligned subarray in the array's native tile/cell order into owned,
//! aligned byte buffers. The sorted-read core layers ordering, pipelining
//! and overflow resumption on top of it.

use std::fmt::Debug;

use tessera_buffer::AlignedBuffer;
use tessera_error::TesseraResult;

use crate::coords::Subarray;
use crate::schema::ArraySchema;

/// Outcome of a read call against user buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// All requested cells were emitted.
    Done,
    /// At least one buffer overflowed; the caller may resume with larger
    /// buffers.
    More,
}

/// One caller-owned result buffer.
///
/// The caller sizes `data`; after a read, `written` holds the number of
/// meaningful bytes at the front. Buffers move by value through the read
/// pipeline so that a worker thread may fill them without borrowing from
/// the caller's stack.
#[derive(Debug, Default)]
pub struct UserBuffer {
    data: Vec<u8>,
    written: usize,
}

impl UserBuffer {
    pub fn with_capacity(len: usize) -> Self {
        Self {
            data: vec![0; len],
            written: 0,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, written: 0 }
    }

    /// The caller-provided size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written by the last read.
    pub fn written(&self) -> usize {
        self.written
    }

    /// The meaningful prefix written by the last read.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.written]
    }

    /// Take the backing storage out, leaving this buffer empty.
    pub fn take_data(&mut self) -> Vec<u8> {
        self.written = 0;
        std::mem::take(&mut self.data)
    }

    /// Put backing storage back along with the bytes written into it.
    pub fn restore(&mut self, data: Vec<u8>, written: usize) {
        debug_assert!(written <= data.len());
        self.data = data;
        self.written = written;
    }
}

/// Payload handed back by an [`Array`] when an asynchronous read settles.
pub struct AioOutput {
    /// The buffers that were handed out in the request, now filled.
    pub buffers: Vec<AlignedBuffer>,
    /// Bytes produced per buffer.
    pub sizes: Vec<usize>,
}

/// Completion notice for one [`AioRequest`].
pub struct AioCompletion {
    /// The pipeline slot this read was posted on, echoed back so racing
    /// completions can be told apart.
    pub slot: usize,
    pub result: TesseraResult<AioOutput>,
}

pub type AioCompletionFn = Box<dyn FnOnce(AioCompletion) + Send + 'static>;

/// An at-most-once asynchronous native-order read.
///
/// Buffer ownership moves with the request and returns through the
/// completion, so no buffer can be freed while a read is in flight.
pub struct AioRequest {
    pub slot: usize,
    /// The subarray to read, in global coordinates.
    pub subarray: Subarray,
    /// One buffer per fixed attribute, two (offsets, values) per
    /// variable-length attribute, in attribute-id order.
    pub buffers: Vec<AlignedBuffer>,
    pub completion: AioCompletionFn,
}

impl Debug for AioRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioRequest")
            .field("slot", &self.slot)
            .field("subarray", &self.subarray)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

/// The storage collaborator consumed by the read cores.
pub trait Array: Send + Sync {
    fn schema(&self) -> &ArraySchema;

    /// The attribute ids this array handle was opened with.
    fn attribute_ids(&self) -> &[usize];

    /// Post an asynchronous native-order read. The completion callback
    /// fires exactly once, when the buffers are safe to consume and
    /// `sizes` reflects the bytes produced.
    fn aio_read(&self, request: AioRequest) -> TesseraResult<()>;

    /// Synchronous read of `subarray` in the array's native order,
    /// resumable across calls with the same subarray. Returns
    /// per-attribute overflow flags; all false means every remaining cell
    /// fit.
    fn read_default(
        &self,
        subarray: &Subarray,
        buffers: &mut [UserBuffer],
    ) -> TesseraResult<Vec<bool>>;
}
