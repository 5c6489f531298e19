//! Sorted reads over tiled storage.
//!
//! The storage collaborator serves subarrays in its native tile/cell
//! order; this crate turns that into an ordered stream. A
//! [`SortedReadSession`] plans one-tile-thick slabs over the requested
//! subarray, double-buffers native-order reads, and reorders each slab
//! into the caller's buffers in the requested row- or column-major order,
//! with resumable overflow when a buffer fills mid-stream.

mod copier;
mod domain;
mod planner;
mod session;
mod slots;

pub use copier::*;
pub use domain::*;
pub use planner::*;
pub use session::*;
pub use slots::*;

pub use tessera_array::ReadOutcome;
