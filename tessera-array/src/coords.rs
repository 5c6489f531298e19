//! Tagged coordinate tuples and boxes.
//!
//! A [`Coords`] owns a flat sequence of coordinates in one of the four
//! coordinate types. A [`Subarray`] is a `Coords` holding `2 * dim_num`
//! values laid out as inclusive `[lo_0, hi_0, .., lo_{D-1}, hi_{D-1}]`
//! pairs.

use std::fmt::{Debug, Formatter};

use tessera_dtype::{CoordType, NativeCoord};
use tessera_error::{tessera_bail, TesseraResult};

/// An axis-aligned box: `2 * dim_num` coordinates as inclusive lo/hi pairs.
pub type Subarray = Coords;

/// A flat, typed sequence of coordinates.
#[derive(Clone, PartialEq)]
pub enum Coords {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Coords {
    pub fn coord_type(&self) -> CoordType {
        match self {
            Coords::I32(_) => CoordType::I32,
            Coords::I64(_) => CoordType::I64,
            Coords::F32(_) => CoordType::F32,
            Coords::F64(_) => CoordType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Coords::I32(v) => v.len(),
            Coords::I64(v) => v.len(),
            Coords::F32(v) => v.len(),
            Coords::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the coordinates as a typed slice.
    pub fn as_typed<T: CoordSlice>(&self) -> TesseraResult<&[T]> {
        match T::unpack(self) {
            Some(slice) => Ok(slice),
            None => tessera_bail!(
                "coordinate type mismatch: have {}, requested {}",
                self.coord_type(),
                T::COORD_TYPE
            ),
        }
    }

    pub fn from_typed<T: CoordSlice>(values: Vec<T>) -> Self {
        T::pack(values)
    }
}

impl Debug for Coords {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Coords::I32(v) => write!(f, "Coords::I32({v:?})"),
            Coords::I64(v) => write!(f, "Coords::I64({v:?})"),
            Coords::F32(v) => write!(f, "Coords::F32({v:?})"),
            Coords::F64(v) => write!(f, "Coords::F64({v:?})"),
        }
    }
}

/// A coordinate type that can be packed into and unpacked from [`Coords`].
pub trait CoordSlice: NativeCoord + 'static {
    fn unpack(coords: &Coords) -> Option<&[Self]>;

    fn pack(values: Vec<Self>) -> Coords;
}

macro_rules! coord_slice {
    ($T:ty, $variant:ident) => {
        impl CoordSlice for $T {
            fn unpack(coords: &Coords) -> Option<&[Self]> {
                match coords {
                    Coords::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn pack(values: Vec<Self>) -> Coords {
                Coords::$variant(values)
            }
        }
    };
}

coord_slice!(i32, I32);
coord_slice!(i64, I64);
coord_slice!(f32, F32);
coord_slice!(f64, F64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_typed_view() {
        let c = Coords::from_typed(vec![0i64, 9, 0, 19]);
        assert_eq!(c.coord_type(), CoordType::I64);
        assert_eq!(c.as_typed::<i64>().unwrap(), &[0, 9, 0, 19]);
        assert!(c.as_typed::<i32>().is_err());
    }
}
