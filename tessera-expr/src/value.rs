//! Tagged scalar values and binary arithmetic over them.

use std::fmt::{Display, Formatter};

use num_traits::NumCast;
use paste::paste;
use tessera_dtype::{coerced_type, CoordType};
use tessera_error::{tessera_err, TesseraResult};

use crate::Operator;

/// A scalar expression value, tagged with its type.
///
/// Replaces the usual untyped max-size value slot: every value knows its
/// type, and coercion is explicit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExprValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

macro_rules! value_accessor {
    ($T:ty) => {
        paste! {
            #[doc = concat!("The value cast to `", stringify!($T), "`, if representable.")]
            pub fn [<as_ $T>](&self) -> Option<$T> {
                match *self {
                    ExprValue::I32(v) => <$T as NumCast>::from(v),
                    ExprValue::I64(v) => <$T as NumCast>::from(v),
                    ExprValue::F32(v) => <$T as NumCast>::from(v),
                    ExprValue::F64(v) => <$T as NumCast>::from(v),
                }
            }
        }
    };
}

impl ExprValue {
    pub fn value_type(&self) -> CoordType {
        match self {
            ExprValue::I32(_) => CoordType::I32,
            ExprValue::I64(_) => CoordType::I64,
            ExprValue::F32(_) => CoordType::F32,
            ExprValue::F64(_) => CoordType::F64,
        }
    }

    value_accessor!(i32);
    value_accessor!(i64);
    value_accessor!(f32);
    value_accessor!(f64);

    /// Convert to another type under the expression coercion rules.
    pub fn coerce(self, to: CoordType) -> TesseraResult<ExprValue> {
        let coerced = match to {
            CoordType::I32 => self.as_i32().map(ExprValue::I32),
            CoordType::I64 => self.as_i64().map(ExprValue::I64),
            CoordType::F32 => self.as_f32().map(ExprValue::F32),
            CoordType::F64 => self.as_f64().map(ExprValue::F64),
        };
        coerced.ok_or_else(|| {
            tessera_err!(InvalidOperator: "cannot represent {} as {}", self, to)
        })
    }
}

impl Display for ExprValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExprValue::I32(v) => write!(f, "{v}i32"),
            ExprValue::I64(v) => write!(f, "{v}i64"),
            ExprValue::F32(v) => write!(f, "{v}f32"),
            ExprValue::F64(v) => write!(f, "{v}f64"),
        }
    }
}

impl From<i32> for ExprValue {
    fn from(v: i32) -> Self {
        ExprValue::I32(v)
    }
}

impl From<i64> for ExprValue {
    fn from(v: i64) -> Self {
        ExprValue::I64(v)
    }
}

impl From<f32> for ExprValue {
    fn from(v: f32) -> Self {
        ExprValue::F32(v)
    }
}

impl From<f64> for ExprValue {
    fn from(v: f64) -> Self {
        ExprValue::F64(v)
    }
}

fn apply_int<T>(op: Operator, a: T, b: T) -> TesseraResult<T>
where
    T: Copy
        + PartialEq
        + num_traits::Zero
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + std::ops::Mul<Output = T>
        + std::ops::Div<Output = T>
        + std::ops::Rem<Output = T>,
{
    if matches!(op, Operator::Div | Operator::Rem) && b == T::zero() {
        return Err(tessera_err!(InvalidOperator: "integer division by zero"));
    }
    Ok(match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::Mul => a * b,
        Operator::Div => a / b,
        Operator::Rem => a % b,
    })
}

fn apply_float<T>(op: Operator, a: T, b: T) -> TesseraResult<T>
where
    T: Copy
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + std::ops::Mul<Output = T>
        + std::ops::Div<Output = T>,
{
    match op {
        Operator::Add => Ok(a + b),
        Operator::Sub => Ok(a - b),
        Operator::Mul => Ok(a * b),
        Operator::Div => Ok(a / b),
        Operator::Rem => Err(tessera_err!(
            InvalidOperator: "% requires integer operands"
        )),
    }
}

/// Evaluate `a op b` after coercing both sides to their common type.
pub fn apply(op: Operator, a: ExprValue, b: ExprValue) -> TesseraResult<ExprValue> {
    let ty = coerced_type(a.value_type(), b.value_type());
    match (a.coerce(ty)?, b.coerce(ty)?) {
        (ExprValue::I32(x), ExprValue::I32(y)) => apply_int(op, x, y).map(ExprValue::I32),
        (ExprValue::I64(x), ExprValue::I64(y)) => apply_int(op, x, y).map(ExprValue::I64),
        (ExprValue::F32(x), ExprValue::F32(y)) => apply_float(op, x, y).map(ExprValue::F32),
        (ExprValue::F64(x), ExprValue::F64(y)) => apply_float(op, x, y).map(ExprValue::F64),
        _ => unreachable!("operands coerced to different types"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_widens() {
        let v = apply(Operator::Add, ExprValue::I32(1), ExprValue::F64(0.5)).unwrap();
        assert_eq!(v, ExprValue::F64(1.5));
        let v = apply(Operator::Mul, ExprValue::I32(3), ExprValue::I64(4)).unwrap();
        assert_eq!(v, ExprValue::I64(12));
    }

    #[test]
    fn rem_requires_integers() {
        assert!(apply(Operator::Rem, ExprValue::I32(7), ExprValue::I32(3)).is_ok());
        let err = apply(Operator::Rem, ExprValue::F32(7.0), ExprValue::I32(3)).unwrap_err();
        assert!(matches!(
            err,
            tessera_error::TesseraError::InvalidOperator(_)
        ));
    }

    #[test]
    fn integer_division_by_zero_is_rejected() {
        assert!(apply(Operator::Div, ExprValue::I64(1), ExprValue::I64(0)).is_err());
        // Float division by zero follows IEEE semantics.
        let v = apply(Operator::Div, ExprValue::F64(1.0), ExprValue::F64(0.0)).unwrap();
        assert_eq!(v, ExprValue::F64(f64::INFINITY));
    }
}
