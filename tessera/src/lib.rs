//! Umbrella crate for the Tessera array engine.

pub use tessera_array::*;
pub use {
    tessera_buffer as buffer, tessera_dtype as dtype, tessera_error as error,
    tessera_expr as expr, tessera_scan as scan,
};
