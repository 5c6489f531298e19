//! Array schema, subarrays and the storage collaborator surface.

mod array;
pub mod cellmath;
mod coords;
mod memory;
mod schema;

pub use array::*;
pub use coords::*;
pub use memory::*;
pub use schema::*;
