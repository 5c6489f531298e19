//! Error handling for the Tessera array engine.
//!
//! Every fallible operation in the workspace returns [`TesseraResult`]. The
//! [`TesseraError`] variants mirror the conditions a caller can act on;
//! anything else is a programming error and should use [`tessera_panic!`].

use std::fmt::{Debug, Display, Formatter};

/// A `Cow<'static, str>` for error messages.
pub type ErrString = std::borrow::Cow<'static, str>;

#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum TesseraError {
    /// A caller-supplied argument was rejected (bad subarray, unsupported
    /// coordinate type, empty attribute selection, null expression root).
    #[error("invalid argument: {0}")]
    InvalidArgument(ErrString),

    /// The storage collaborator reported a read failure. The session that
    /// observed it is unusable from then on.
    #[error("io error: {0}")]
    Io(ErrString),

    /// An expression operator was applied to operands it does not support.
    #[error("invalid operator: {0}")]
    InvalidOperator(ErrString),

    /// An expression result was requested before a successful evaluation.
    #[error("expression not evaluated: {0}")]
    NotEvaluated(ErrString),

    /// A wait was abandoned because the owning session is shutting down.
    #[error("shutdown: {0}")]
    Shutdown(ErrString),
}

impl Debug for TesseraError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

pub type TesseraResult<T> = Result<T, TesseraError>;

/// Construct a [`TesseraError`] from a format string.
///
/// `tessera_err!(Io: "read failed: {}", path)` selects the variant;
/// the variant defaults to `InvalidArgument` when omitted.
#[macro_export]
macro_rules! tessera_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::TesseraError::$variant(format!($fmt $(, $arg)*).into())
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::tessera_err!(InvalidArgument: $fmt $(, $arg)*)
    };
}

/// Return early with a [`TesseraError`] built like [`tessera_err!`].
#[macro_export]
macro_rules! tessera_bail {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::tessera_err!($variant: $fmt $(, $arg)*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::tessera_err!($fmt $(, $arg)*))
    };
}

/// Panic with a formatted message. Reserved for broken internal invariants,
/// never for conditions a caller can trigger.
#[macro_export]
macro_rules! tessera_panic {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        panic!("{}", format!($fmt $(, $arg)*))
    };
}

/// Extension trait adding `tessera_expect` to `Option` and `Result`.
///
/// Use where an invariant guarantees success and the message names the
/// invariant that would have to break.
pub trait TesseraExpect {
    type Output;

    fn tessera_expect(self, msg: &str) -> Self::Output;
}

impl<T> TesseraExpect for Option<T> {
    type Output = T;

    fn tessera_expect(self, msg: &str) -> T {
        self.unwrap_or_else(|| tessera_panic!("expect failed: {}", msg))
    }
}

impl<T, E: Display> TesseraExpect for Result<T, E> {
    type Output = T;

    fn tessera_expect(self, msg: &str) -> T {
        self.unwrap_or_else(|e| tessera_panic!("expect failed: {}: {}", msg, e))
    }
}

/// Extension trait for unwrapping [`TesseraResult`]s in tests and examples.
pub trait TesseraUnwrap {
    type Output;

    fn tessera_unwrap(self) -> Self::Output;
}

impl<T> TesseraUnwrap for TesseraResult<T> {
    type Output = T;

    fn tessera_unwrap(self) -> T {
        self.unwrap_or_else(|e| tessera_panic!("unwrap failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_macro_selects_variant() {
        let e = tessera_err!(Io: "device {} gone", 3);
        assert!(matches!(e, TesseraError::Io(_)));
        assert_eq!(e.to_string(), "io error: device 3 gone");
    }

    #[test]
    fn err_macro_defaults_to_invalid_argument() {
        let e = tessera_err!("bad subarray");
        assert!(matches!(e, TesseraError::InvalidArgument(_)));
    }

    #[test]
    fn bail_returns_early() {
        fn f() -> TesseraResult<()> {
            tessera_bail!(Shutdown: "session closed");
        }
        assert!(matches!(f(), Err(TesseraError::Shutdown(_))));
    }
}
