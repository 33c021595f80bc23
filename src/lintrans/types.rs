//! Layer descriptors and block-diagonal containers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::TransformId;
use crate::error::{Error, Result};
use crate::tensor::Shape;

/// Coordinates of one tile of a blocked linear operator.
///
/// Ordering is row-major, which is also the order the backend expects
/// compiled transforms in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockIndex {
    pub row: usize,
    pub col: usize,
}

impl BlockIndex {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl From<(usize, usize)> for BlockIndex {
    fn from((row, col): (usize, usize)) -> Self {
        Self { row, col }
    }
}

/// Formats as the cache key `"{row}_{col}"`.
impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.row, self.col)
    }
}

impl FromStr for BlockIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = s
            .split_once('_')
            .and_then(|(r, c)| Some((r.parse().ok()?, c.parse().ok()?)));
        match parsed {
            Some((row, col)) => Ok(Self { row, col }),
            None => Err(Error::InvalidLayer(format!("invalid block key `{}`", s))),
        }
    }
}

/// Layer names double as cache directory names.
pub(crate) fn validate_layer_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(Error::InvalidLayer(format!(
            "layer name `{}` cannot be used as a cache key",
            name
        )));
    }
    Ok(())
}

/// Diagonal index -> one slot vector of real values
pub type Diagonals = BTreeMap<i64, Vec<f64>>;

/// Sparse 2D grid of diagonal maps, iterated in ascending `(row, col)` order
pub type BlockDiagonals = BTreeMap<BlockIndex, Diagonals>;

/// Rotations the network applies to a layer's packed output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRotations {
    Single(i64),
    Many(Vec<i64>),
}

impl Default for OutputRotations {
    fn default() -> Self {
        OutputRotations::Single(0)
    }
}

impl fmt::Display for OutputRotations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputRotations::Single(r) => write!(f, "{}", r),
            OutputRotations::Many(rs) => write!(f, "{:?}", rs),
        }
    }
}

/// A compiled-or-compilable linear layer.
///
/// Produced once per layer by the network compiler. After construction the
/// only mutations are: the transform ids assigned by
/// [`generate_transforms`](super::generate_transforms), and diagonal payloads
/// emptied by [`TransformCache::save_transforms`](super::TransformCache::save_transforms).
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescriptor {
    /// Unique within a network; also the cache key.
    pub name: String,
    pub diagonals: BlockDiagonals,
    pub level: u32,
    pub bsgs_ratio: f64,
    pub input_shape: Shape,
    pub output_shape: Shape,
    /// Packed output layout; fixes the number of output ciphertexts.
    pub fhe_output_shape: Shape,
    pub on_bias: Vec<f64>,
    pub output_rotations: OutputRotations,
    pub input_min: f64,
    pub input_max: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub transform_ids: BTreeMap<BlockIndex, TransformId>,
}

impl LayerDescriptor {
    pub fn new(
        name: impl Into<String>,
        diagonals: BlockDiagonals,
        level: u32,
        bsgs_ratio: f64,
    ) -> Self {
        Self {
            name: name.into(),
            diagonals,
            level,
            bsgs_ratio,
            input_shape: Shape::default(),
            output_shape: Shape::default(),
            fhe_output_shape: Shape::default(),
            on_bias: Vec::new(),
            output_rotations: OutputRotations::default(),
            input_min: 0.0,
            input_max: 0.0,
            output_min: 0.0,
            output_max: 0.0,
            transform_ids: BTreeMap::new(),
        }
    }

    pub fn with_shapes(mut self, input: Shape, output: Shape, fhe_output: Shape) -> Self {
        self.input_shape = input;
        self.output_shape = output;
        self.fhe_output_shape = fhe_output;
        self
    }

    pub fn with_bias(mut self, on_bias: Vec<f64>) -> Self {
        self.on_bias = on_bias;
        self
    }

    pub fn with_output_rotations(mut self, rotations: OutputRotations) -> Self {
        self.output_rotations = rotations;
        self
    }

    pub fn with_ranges(mut self, input: (f64, f64), output: (f64, f64)) -> Self {
        self.input_min = input.0;
        self.input_max = input.1;
        self.output_min = output.0;
        self.output_max = output.1;
        self
    }

    /// Number of block rows and block columns
    pub fn block_grid(&self) -> (usize, usize) {
        let rows = self.diagonals.keys().map(|b| b.row + 1).max().unwrap_or(0);
        let cols = self.diagonals.keys().map(|b| b.col + 1).max().unwrap_or(0);
        (rows, cols)
    }

    /// Total number of diagonals across all blocks
    pub fn diagonal_count(&self) -> usize {
        self.diagonals.values().map(|d| d.len()).sum()
    }

    /// False once saving has released the diagonal payloads
    pub fn has_diagonal_data(&self) -> bool {
        self.diagonals
            .values()
            .flat_map(|d| d.values())
            .all(|data| !data.is_empty())
    }

    pub fn is_compiled(&self) -> bool {
        !self.transform_ids.is_empty()
    }

    /// Check the descriptor can be compiled and cached
    pub fn validate(&self) -> Result<()> {
        validate_layer_name(&self.name)?;
        if !(self.bsgs_ratio.is_finite() && self.bsgs_ratio > 0.0) {
            return Err(Error::InvalidLayer(format!(
                "layer '{}': bsgs_ratio must be positive, got {}",
                self.name, self.bsgs_ratio
            )));
        }
        if self.diagonals.is_empty() {
            return Err(Error::InvalidLayer(format!(
                "layer '{}' has no diagonal blocks",
                self.name
            )));
        }

        // The backend maps the flat transform list back to a dense grid.
        let (rows, cols) = self.block_grid();
        if self.diagonals.len() != rows * cols {
            return Err(Error::InvalidLayer(format!(
                "layer '{}': {} blocks do not fill a {}x{} grid",
                self.name,
                self.diagonals.len(),
                rows,
                cols
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(entries: &[(i64, &[f64])]) -> Diagonals {
        entries.iter().map(|(i, d)| (*i, d.to_vec())).collect()
    }

    #[test]
    fn test_block_key_roundtrip() {
        let idx = BlockIndex::new(3, 12);
        assert_eq!(idx.to_string(), "3_12");
        assert_eq!("3_12".parse::<BlockIndex>().unwrap(), idx);
    }

    #[test]
    fn test_block_key_rejects_garbage() {
        assert!("3-12".parse::<BlockIndex>().is_err());
        assert!("a_1".parse::<BlockIndex>().is_err());
        assert!("1_".parse::<BlockIndex>().is_err());
    }

    #[test]
    fn test_block_order_is_row_major() {
        let mut diags = BlockDiagonals::new();
        diags.insert(BlockIndex::new(1, 0), Diagonals::new());
        diags.insert(BlockIndex::new(0, 1), Diagonals::new());
        diags.insert(BlockIndex::new(1, 1), Diagonals::new());
        diags.insert(BlockIndex::new(0, 0), Diagonals::new());

        let order: Vec<String> = diags.keys().map(|b| b.to_string()).collect();
        assert_eq!(order, vec!["0_0", "0_1", "1_0", "1_1"]);
    }

    #[test]
    fn test_validate_grid() {
        let mut diags = BlockDiagonals::new();
        diags.insert(BlockIndex::new(0, 0), block(&[(0, &[1.0, 2.0])]));
        diags.insert(BlockIndex::new(1, 1), block(&[(0, &[1.0, 2.0])]));
        let layer = LayerDescriptor::new("fc1", diags.clone(), 3, 2.0);
        assert!(matches!(layer.validate(), Err(Error::InvalidLayer(_))));

        diags.insert(BlockIndex::new(0, 1), block(&[(1, &[3.0, 4.0])]));
        diags.insert(BlockIndex::new(1, 0), block(&[(1, &[5.0, 6.0])]));
        let layer = LayerDescriptor::new("fc1", diags, 3, 2.0);
        assert!(layer.validate().is_ok());
        assert_eq!(layer.block_grid(), (2, 2));
        assert_eq!(layer.diagonal_count(), 4);
    }

    #[test]
    fn test_validate_name() {
        let mut diags = BlockDiagonals::new();
        diags.insert(BlockIndex::new(0, 0), block(&[(0, &[1.0])]));
        for bad in ["", ".hidden", "a/b"] {
            let layer = LayerDescriptor::new(bad, diags.clone(), 1, 1.0);
            assert!(layer.validate().is_err(), "name {:?} accepted", bad);
        }
        let layer = LayerDescriptor::new("layer1.0.conv1", diags, 1, 1.0);
        assert!(layer.validate().is_ok());
    }

    #[test]
    fn test_output_rotations_serde() {
        let json = serde_json::to_string(&OutputRotations::Single(4)).unwrap();
        assert_eq!(json, r#"{"single":4}"#);
        let many: OutputRotations = serde_json::from_str(r#"{"many":[1,2]}"#).unwrap();
        assert_eq!(many, OutputRotations::Many(vec![1, 2]));
        assert_eq!(many.to_string(), "[1, 2]");
    }
}
