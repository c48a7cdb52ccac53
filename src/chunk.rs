//! Fixed-extent raster tiles in dense or uniform encoding.
//!
//! A chunk is the unit of residency and eviction: a rectangular tile of
//! `f64` cells held either as a row-major buffer (dense) or as a single
//! repeated value (uniform, for homogeneous regions such as untouched or
//! sea-level areas). The logical extent never changes after creation; only
//! the encoding may.
//!
//! Value comparisons are bitwise so a NaN no-data sentinel behaves like any
//! other value in uniform checks and compaction.

use crate::types::CacheError;

/// In-memory encoding of a chunk's cells.
#[derive(Debug, Clone, PartialEq)]
enum Encoding {
    /// One value stands for every cell in the tile.
    Uniform(f64),
    /// Row-major buffer of `height * width` values.
    Dense(Vec<f64>),
}

/// A fixed-size rectangular tile of raster cells.
///
/// Chunks know nothing about other chunks or about caching; residency and
/// persistence are handled by the grid and environment layers.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    height: usize,
    width: usize,
    encoding: Encoding,
}

impl Chunk {
    /// Create a uniform chunk where every cell holds `value`.
    ///
    /// # Panics
    ///
    /// Panics if either extent is zero. A zero-extent chunk has no cells
    /// and would break the dense encoding's non-empty buffer invariant.
    pub fn uniform(height: usize, width: usize, value: f64) -> Self {
        assert!(height > 0 && width > 0, "chunk extent must be non-empty");
        Self {
            height,
            width,
            encoding: Encoding::Uniform(value),
        }
    }

    /// Create a dense chunk from a row-major buffer.
    ///
    /// The extent must be non-empty and the buffer length must equal
    /// `height * width`.
    pub fn from_dense(height: usize, width: usize, cells: Vec<f64>) -> Result<Self, CacheError> {
        if height == 0 || width == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "chunk extent {height}x{width} must be non-empty"
            )));
        }
        if cells.len() != height * width {
            return Err(CacheError::InvalidConfig(format!(
                "dense buffer of {} cells does not match {}x{} extent",
                cells.len(),
                height,
                width
            )));
        }
        Ok(Self {
            height,
            width,
            encoding: Encoding::Dense(cells),
        })
    }

    /// Height of the tile in cells.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Width of the tile in cells.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Whether the chunk is in the uniform encoding.
    pub fn is_uniform(&self) -> bool {
        matches!(self.encoding, Encoding::Uniform(_))
    }

    /// The repeated value, if the chunk is uniform.
    pub fn uniform_value(&self) -> Option<f64> {
        match &self.encoding {
            Encoding::Uniform(value) => Some(*value),
            Encoding::Dense(_) => None,
        }
    }

    /// The row-major cell buffer, if the chunk is dense.
    pub fn cells(&self) -> Option<&[f64]> {
        match &self.encoding {
            Encoding::Uniform(_) => None,
            Encoding::Dense(cells) => Some(cells),
        }
    }

    /// Heap footprint relevant to the memory budget.
    ///
    /// Uniform chunks carry no heap buffer and cost nothing against the
    /// budget.
    pub fn heap_bytes(&self) -> usize {
        match &self.encoding {
            Encoding::Uniform(_) => 0,
            Encoding::Dense(cells) => cells.len() * std::mem::size_of::<f64>(),
        }
    }

    /// Number of bytes a dense buffer for this extent would occupy.
    pub fn dense_bytes(&self) -> usize {
        self.height * self.width * std::mem::size_of::<f64>()
    }

    /// Read the cell at the given in-tile offsets. O(1).
    pub fn get(&self, offset_row: usize, offset_col: usize) -> Result<f64, CacheError> {
        self.check_offsets(offset_row, offset_col)?;
        match &self.encoding {
            Encoding::Uniform(value) => Ok(*value),
            Encoding::Dense(cells) => Ok(cells[offset_row * self.width + offset_col]),
        }
    }

    /// Write the cell at the given in-tile offsets. O(1) amortized.
    ///
    /// A write that diverges from a uniform chunk's value materializes the
    /// chunk first. Writing the uniform value itself is a no-op. The grid
    /// layer charges the memory budget before issuing a diverging write.
    pub fn set(&mut self, offset_row: usize, offset_col: usize, value: f64) -> Result<(), CacheError> {
        self.check_offsets(offset_row, offset_col)?;
        if let Encoding::Uniform(current) = self.encoding {
            if current.to_bits() == value.to_bits() {
                return Ok(());
            }
            self.materialize();
        }
        match &mut self.encoding {
            Encoding::Dense(cells) => cells[offset_row * self.width + offset_col] = value,
            Encoding::Uniform(_) => unreachable!("materialized above"),
        }
        Ok(())
    }

    /// Expand the uniform encoding into a dense buffer.
    ///
    /// No-op when already dense.
    pub fn materialize(&mut self) {
        if let Encoding::Uniform(value) = self.encoding {
            self.encoding = Encoding::Dense(vec![value; self.height * self.width]);
        }
    }

    /// Collapse a dense chunk whose cells are all bit-identical back to the
    /// uniform encoding. Returns whether compaction happened.
    pub fn compact(&mut self) -> bool {
        let Encoding::Dense(cells) = &self.encoding else {
            return false;
        };
        let first = cells[0].to_bits();
        if cells.iter().all(|cell| cell.to_bits() == first) {
            self.encoding = Encoding::Uniform(f64::from_bits(first));
            true
        } else {
            false
        }
    }

    /// Overwrite every cell with `value`, collapsing to uniform.
    pub fn fill(&mut self, value: f64) {
        self.encoding = Encoding::Uniform(value);
    }

    fn check_offsets(&self, offset_row: usize, offset_col: usize) -> Result<(), CacheError> {
        if offset_row >= self.height || offset_col >= self.width {
            return Err(CacheError::OutOfBounds {
                row: offset_row,
                col: offset_col,
                rows: self.height,
                cols: self.width,
            });
        }
        Ok(())
    }
}
