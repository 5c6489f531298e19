//! Array schema and the arithmetic the read paths consume.

use num_traits::{One, Zero};
use tessera_dtype::{match_each_coord_type, CoordType, Layout, NativeCoord};
use tessera_error::{tessera_bail, TesseraResult};

use crate::cellmath::{box_cell_num, dim_span};
use crate::coords::{CoordSlice, Coords, Subarray};

/// Size in bytes of one entry of a variable-length attribute's offsets
/// stream.
pub const OFFSET_SIZE: usize = size_of::<u64>();

/// One named, typed value per cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    kind: AttributeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Every cell stores exactly `cell_size` bytes.
    Fixed { cell_size: usize },
    /// Cells store per-cell byte lengths; materialized as an offsets stream
    /// plus a values stream.
    Var,
}

impl Attribute {
    pub fn fixed(name: impl Into<String>, cell_size: usize) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Fixed { cell_size },
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::Var,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_var(&self) -> bool {
        matches!(self.kind, AttributeKind::Var)
    }

    /// The fixed cell size, or `None` for variable-length attributes.
    pub fn cell_size(&self) -> Option<usize> {
        match self.kind {
            AttributeKind::Fixed { cell_size } => Some(cell_size),
            AttributeKind::Var => None,
        }
    }

    /// The per-cell size in the attribute's primary stream: the fixed cell
    /// size, or the offset width for variable-length attributes.
    pub fn primary_size(&self) -> usize {
        self.cell_size().unwrap_or(OFFSET_SIZE)
    }

    /// Number of caller buffers this attribute consumes: one, or two
    /// (offsets, values) when variable-length.
    pub fn buffer_num(&self) -> usize {
        if self.is_var() {
            2
        } else {
            1
        }
    }
}

/// The shape of an array: domain, tiling and attributes.
///
/// Consumed, not defined, by the read cores; validation happens once at
/// construction so the arithmetic methods can stay infallible.
#[derive(Debug, Clone)]
pub struct ArraySchema {
    name: String,
    domain: Subarray,
    tile_extents: Coords,
    tile_order: Layout,
    cell_order: Layout,
    attributes: Vec<Attribute>,
    dense: bool,
}

impl ArraySchema {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        name: impl Into<String>,
        domain: Subarray,
        tile_extents: Coords,
        tile_order: Layout,
        cell_order: Layout,
        attributes: Vec<Attribute>,
        dense: bool,
    ) -> TesseraResult<Self> {
        if domain.coord_type() != tile_extents.coord_type() {
            tessera_bail!(
                "domain type {} does not match tile extent type {}",
                domain.coord_type(),
                tile_extents.coord_type()
            );
        }
        if domain.is_empty() || domain.len() != 2 * tile_extents.len() {
            tessera_bail!(
                "domain holds {} coordinates, expected 2 per dimension",
                domain.len()
            );
        }
        if attributes.is_empty() {
            tessera_bail!("schema requires at least one attribute");
        }
        if let Some(a) = attributes
            .iter()
            .find(|a| matches!(a.kind, AttributeKind::Fixed { cell_size: 0 }))
        {
            tessera_bail!("attribute {} has a zero cell size", a.name());
        }
        let schema = Self {
            name: name.into(),
            domain,
            tile_extents,
            tile_order,
            cell_order,
            attributes,
            dense,
        };
        match_each_coord_type!(schema.coord_type(), |$T| {
            schema.validate_typed::<$T>()
        })?;
        Ok(schema)
    }

    fn validate_typed<T: CoordSlice>(&self) -> TesseraResult<()> {
        let domain = self.domain.as_typed::<T>()?;
        let extents = self.tile_extents.as_typed::<T>()?;
        for d in 0..self.dim_num() {
            if domain[2 * d + 1] < domain[2 * d] {
                tessera_bail!("domain is inverted along dimension {}", d);
            }
            if extents[d] <= T::zero() {
                tessera_bail!("tile extent along dimension {} is not positive", d);
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coord_type(&self) -> CoordType {
        self.domain.coord_type()
    }

    pub fn dim_num(&self) -> usize {
        self.tile_extents.len()
    }

    pub fn domain(&self) -> &Subarray {
        &self.domain
    }

    pub fn tile_extents(&self) -> &Coords {
        &self.tile_extents
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, id: usize) -> TesseraResult<&Attribute> {
        match self.attributes.get(id) {
            Some(a) => Ok(a),
            None => tessera_bail!("attribute id {} out of range", id),
        }
    }

    pub fn var_size(&self, id: usize) -> TesseraResult<bool> {
        Ok(self.attribute(id)?.is_var())
    }

    pub fn cell_size(&self, id: usize) -> TesseraResult<Option<usize>> {
        Ok(self.attribute(id)?.cell_size())
    }

    /// Total caller buffers for a selection of attributes.
    pub fn buffer_num(&self, attribute_ids: &[usize]) -> TesseraResult<usize> {
        let mut n = 0;
        for &id in attribute_ids {
            n += self.attribute(id)?.buffer_num();
        }
        Ok(n)
    }

    /// Check that `subarray` is well-formed and inside the domain.
    pub fn check_subarray(&self, subarray: &Subarray) -> TesseraResult<()> {
        if subarray.coord_type() != self.coord_type() {
            tessera_bail!(
                "subarray type {} does not match array type {}",
                subarray.coord_type(),
                self.coord_type()
            );
        }
        if subarray.len() != 2 * self.dim_num() {
            tessera_bail!(
                "subarray holds {} coordinates, expected {}",
                subarray.len(),
                2 * self.dim_num()
            );
        }
        match_each_coord_type!(self.coord_type(), |$T| {
            self.check_subarray_typed::<$T>(subarray)
        })
    }

    fn check_subarray_typed<T: CoordSlice>(&self, subarray: &Subarray) -> TesseraResult<()> {
        let sub = subarray.as_typed::<T>()?;
        let domain = self.domain.as_typed::<T>()?;
        for d in 0..self.dim_num() {
            if sub[2 * d + 1] < sub[2 * d] {
                tessera_bail!("subarray is inverted along dimension {}", d);
            }
            if sub[2 * d] < domain[2 * d] || sub[2 * d + 1] > domain[2 * d + 1] {
                tessera_bail!("subarray exceeds the domain along dimension {}", d);
            }
        }
        Ok(())
    }

    /// Number of cells in a subarray.
    pub fn cell_num(&self, subarray: &Subarray) -> TesseraResult<i64> {
        match_each_coord_type!(self.coord_type(), |$T| {
            Ok(box_cell_num(subarray.as_typed::<$T>()?))
        })
    }

    /// Number of tiles overlapping a subarray.
    pub fn tile_num(&self, subarray: &Subarray) -> TesseraResult<i64> {
        match_each_coord_type!(self.coord_type(), |$T| {
            self.tile_num_typed::<$T>(subarray)
        })
    }

    fn tile_num_typed<T: CoordSlice>(&self, subarray: &Subarray) -> TesseraResult<i64> {
        let sub = subarray.as_typed::<T>()?;
        let domain = self.domain.as_typed::<T>()?;
        let extents = self.tile_extents.as_typed::<T>()?;
        let mut n = 1i64;
        for d in 0..self.dim_num() {
            let lo = sub[2 * d].tile_index(domain[2 * d], extents[d]);
            let hi = sub[2 * d + 1].tile_index(domain[2 * d], extents[d]);
            n *= hi - lo + 1;
        }
        Ok(n)
    }

    /// Whether `subarray` spans at most one tile along dimension `d`.
    pub fn spans_single_tile(&self, subarray: &Subarray, d: usize) -> TesseraResult<bool> {
        match_each_coord_type!(self.coord_type(), |$T| {
            let sub = subarray.as_typed::<$T>()?;
            let domain = self.domain.as_typed::<$T>()?;
            let extents = self.tile_extents.as_typed::<$T>()?;
            let lo = sub[2 * d].tile_index(domain[2 * d], extents[d]);
            let hi = sub[2 * d + 1].tile_index(domain[2 * d], extents[d]);
            Ok(lo == hi)
        })
    }

    /// Whether `subarray` fits in a single row tile slab (one tile thick
    /// along the outermost dimension).
    pub fn is_contained_in_tile_slab_row(&self, subarray: &Subarray) -> TesseraResult<bool> {
        self.spans_single_tile(subarray, 0)
    }

    /// Whether `subarray` fits in a single column tile slab (one tile thick
    /// along the innermost dimension).
    pub fn is_contained_in_tile_slab_col(&self, subarray: &Subarray) -> TesseraResult<bool> {
        self.spans_single_tile(subarray, self.dim_num() - 1)
    }

    /// Cells in a full tile slab of `subarray` stacked for row-major
    /// results: one tile extent along dimension 0, the subarray extent
    /// elsewhere.
    pub fn tile_slab_cell_num_row(&self, subarray: &Subarray) -> TesseraResult<i64> {
        self.tile_slab_cell_num(subarray, 0)
    }

    /// Cells in a full tile slab of `subarray` stacked for column-major
    /// results.
    pub fn tile_slab_cell_num_col(&self, subarray: &Subarray) -> TesseraResult<i64> {
        self.tile_slab_cell_num(subarray, self.dim_num() - 1)
    }

    fn tile_slab_cell_num(&self, subarray: &Subarray, stacking: usize) -> TesseraResult<i64> {
        match_each_coord_type!(self.coord_type(), |$T| {
            let sub = subarray.as_typed::<$T>()?;
            let extents = self.tile_extents.as_typed::<$T>()?;
            let mut n = dim_span(sub, stacking).min(<$T as NativeCoord>::span_cells(
                <$T as Zero>::zero(),
                extents[stacking] - <$T as One>::one(),
            ));
            for d in 0..self.dim_num() {
                if d != stacking {
                    n *= dim_span(sub, d);
                }
            }
            Ok(n)
        })
    }
}
