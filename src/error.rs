//! Error handling for the linear-transform pipeline
//!
//! A single error type is used across compile, cache, evaluation and
//! bootstrapping so callers can match on the failure kind regardless of
//! which component raised it.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;

/// Hint appended to every cache error.
pub const REBUILD_HINT: &str =
    "First set the IO mode to `save` to override existing data. Then loading will work.";

/// A field of a cached layer entry that is checked against the live layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MismatchedField {
    BiasShape,
    BiasValues,
    OutputRotations,
    InputShape,
    OutputShape,
    EmbeddingMethod,
    InputMin,
    InputMax,
    OutputMin,
    OutputMax,
}

impl MismatchedField {
    /// All checked fields, in the order they are compared.
    pub const ALL: [MismatchedField; 10] = [
        MismatchedField::BiasShape,
        MismatchedField::BiasValues,
        MismatchedField::OutputRotations,
        MismatchedField::InputShape,
        MismatchedField::OutputShape,
        MismatchedField::EmbeddingMethod,
        MismatchedField::InputMin,
        MismatchedField::InputMax,
        MismatchedField::OutputMin,
        MismatchedField::OutputMax,
    ];
}

impl fmt::Display for MismatchedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MismatchedField::BiasShape => "on_bias: shape mismatch",
            MismatchedField::BiasValues => "on_bias: values mismatch",
            MismatchedField::OutputRotations => "output_rotations mismatch",
            MismatchedField::InputShape => "input_shape mismatch",
            MismatchedField::OutputShape => "output_shape mismatch",
            MismatchedField::EmbeddingMethod => "embedding_method mismatch",
            MismatchedField::InputMin => "input_min mismatch",
            MismatchedField::InputMax => "input_max mismatch",
            MismatchedField::OutputMin => "output_min mismatch",
            MismatchedField::OutputMax => "output_max mismatch",
        };
        f.write_str(msg)
    }
}

struct FieldList<'a>(&'a [MismatchedField]);

impl fmt::Display for FieldList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}

/// Linear-transform pipeline error
#[derive(Debug, Error)]
pub enum Error {
    /// The cached entry exists but differs from the live layer.
    #[error(
        "saved network does not match currently instantiated network for layer '{layer}': {}. {}",
        FieldList(.fields),
        REBUILD_HINT
    )]
    CacheIncompatible {
        layer: String,
        fields: Vec<MismatchedField>,
    },

    /// The layer was never written to the cache being read.
    #[error("layer '{layer}' not found in cache {}. {}", .path.display(), REBUILD_HINT)]
    CacheMissing { layer: String, path: PathBuf },

    /// The layer directory exists but cannot be read back in full.
    #[error("cache entry for layer '{layer}' is corrupt: {reason}. {}", REBUILD_HINT)]
    CacheCorrupt { layer: String, reason: String },

    /// A backend primitive failed. Never retried.
    #[error("backend operation {op}({args}) failed: {source}")]
    BackendOperationFailed {
        op: &'static str,
        args: String,
        #[source]
        source: BackendError,
    },

    /// A phase was completed without having been started.
    #[error("phase '{0}' was not started")]
    PhaseNotStarted(String),

    /// A tensor's id count disagrees with the tile count of its packed shape.
    #[error("{what}: expected {expected} tiles, found {actual}")]
    TileCountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cache encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Result type for linear-transform operations
pub type Result<T> = std::result::Result<T, Error>;

/// Attach the failing operation and its arguments to a backend failure
pub(crate) trait BackendContext<T> {
    fn with_op<F>(self, op: &'static str, args: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> BackendContext<T> for std::result::Result<T, BackendError> {
    fn with_op<F>(self, op: &'static str, args: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| Error::BackendOperationFailed {
            op,
            args: args(),
            source,
        })
    }
}

impl Error {
    /// Fields reported by a `CacheIncompatible` error, empty otherwise.
    pub fn mismatched_fields(&self) -> &[MismatchedField] {
        match self {
            Error::CacheIncompatible { fields, .. } => fields,
            _ => &[],
        }
    }
}
