//! Plaintext and ciphertext tensor handles
//!
//! A tensor handle is an ordered list of backend ids, one per packed tile,
//! together with two shapes:
//!
//! - `shape`: the logical shape seen by the network
//! - `on_shape`: the packed layout inside the backend, which determines how
//!   many tiles (ids) the tensor occupies
//!
//! Handles are plain values. Cloning one copies the id list, not the backend
//! objects behind it.

mod encryptor;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{CiphertextId, PlaintextId};
use crate::error::{Error, Result};

pub use encryptor::Encryptor;

/// Tensor dimensions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Number of `slots`-sized tiles needed to pack this shape
    pub fn tile_count(&self, slots: usize) -> usize {
        self.numel().div_ceil(slots)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

fn check_tiles(what: &str, ids: usize, on_shape: &Shape, slots: usize) -> Result<()> {
    let expected = on_shape.tile_count(slots);
    if ids != expected {
        return Err(Error::TileCountMismatch {
            what: format!("{} with packed shape {}", what, on_shape),
            expected,
            actual: ids,
        });
    }
    Ok(())
}

/// Handles to encoded (unencrypted) tiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainTensor {
    pub ids: Vec<PlaintextId>,
    pub shape: Shape,
    pub on_shape: Shape,
}

impl PlainTensor {
    pub fn new(ids: Vec<PlaintextId>, shape: Shape, on_shape: Shape) -> Self {
        Self {
            ids,
            shape,
            on_shape,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Verify the id count matches the packed shape
    pub fn check_tiles(&self, slots: usize) -> Result<()> {
        check_tiles("plaintext tensor", self.ids.len(), &self.on_shape, slots)
    }
}

/// Handles to encrypted tiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherTensor {
    pub ids: Vec<CiphertextId>,
    pub shape: Shape,
    pub on_shape: Shape,
}

impl CipherTensor {
    pub fn new(ids: Vec<CiphertextId>, shape: Shape, on_shape: Shape) -> Self {
        Self {
            ids,
            shape,
            on_shape,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True when both tensors have the same shapes and tile count
    pub fn same_structure(&self, other: &CipherTensor) -> bool {
        self.shape == other.shape
            && self.on_shape == other.on_shape
            && self.ids.len() == other.ids.len()
    }

    /// Verify the id count matches the packed shape
    pub fn check_tiles(&self, slots: usize) -> Result<()> {
        check_tiles("ciphertext tensor", self.ids.len(), &self.on_shape, slots)
    }
}
