//! Backend capability consumed by the linear-transform pipeline
//!
//! The CKKS engine lives outside this crate. It is reached through the
//! [`Backend`] trait: eight primitives addressed by integer handles, plus the
//! slot count of the ring it was instantiated with.
//!
//! Handles are plain integers wrapped in newtypes so that a ciphertext id can
//! never be passed where a transform id is expected. They carry no ownership:
//! whoever created a handle is responsible for releasing it.
//!
//! [`CleartextBackend`] implements the trait with unencrypted slot vectors and
//! is used for verification.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lintrans::BlockIndex;
use crate::params::StorageConfig;

pub use allocator::HandleAllocator;
pub use cleartext::CleartextBackend;

macro_rules! backend_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub usize);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

backend_handle!(
    /// Handle to a backend-held plaintext
    PlaintextId
);
backend_handle!(
    /// Handle to a backend-held ciphertext
    CiphertextId
);
backend_handle!(
    /// Handle to a compiled linear transform
    TransformId
);
backend_handle!(
    /// Handle to a bootstrapper
    BootstrapperId
);

/// Failure reported by a backend primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError(pub String);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

macro_rules! backend_err {
    ($($arg:tt)*) => {
        $crate::backend::BackendError(format!($($arg)*))
    };
}

pub(crate) use backend_err;

mod allocator;
mod cleartext;

/// Everything the backend needs to materialise one block's transform
///
/// `diag_data` is the concatenation of one slot vector per entry of
/// `diag_idxs`, in the same order.
#[derive(Debug, Clone, Copy)]
pub struct TransformRequest<'a> {
    pub diag_idxs: &'a [i64],
    pub diag_data: &'a [f64],
    pub level: u32,
    pub bsgs_ratio: f64,
    pub block: BlockIndex,
    pub layer_name: &'a str,
    pub storage: StorageConfig<'a>,
}

impl fmt::Display for TransformRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layer={}, block={}, diags={:?}, data_len={}, level={}, bsgs_ratio={}, io_mode={}",
            self.layer_name,
            self.block,
            self.diag_idxs,
            self.diag_data.len(),
            self.level,
            self.bsgs_ratio,
            self.storage.io_mode
        )
    }
}

/// Homomorphic engine primitives
///
/// Every call is synchronous. A failed call is terminal for the operation
/// that issued it; callers never retry.
pub trait Backend {
    /// Number of slots in one packed tile.
    fn max_slots(&self) -> usize;

    fn encrypt(&mut self, plaintext: PlaintextId) -> Result<CiphertextId, BackendError>;

    fn decrypt(&mut self, ciphertext: CiphertextId) -> Result<PlaintextId, BackendError>;

    /// Compile one `(row, col)` block into a transform.
    fn generate_linear_transform(
        &mut self,
        request: &TransformRequest<'_>,
    ) -> Result<TransformId, BackendError>;

    /// Apply a blocked transform to a tiled input.
    ///
    /// `transforms` is row-major over the block grid; the number of column
    /// blocks equals `inputs.len()`. Returns one ciphertext per block row.
    fn evaluate_linear_transforms(
        &mut self,
        transforms: &[TransformId],
        inputs: &[CiphertextId],
        layer_name: &str,
        storage: StorageConfig<'_>,
    ) -> Result<Vec<CiphertextId>, BackendError>;

    fn delete_linear_transform(&mut self, transform: TransformId) -> Result<(), BackendError>;

    fn new_bootstrapper(&mut self, logp: &[u32], slots: usize)
        -> Result<BootstrapperId, BackendError>;

    fn bootstrap(
        &mut self,
        ciphertext: CiphertextId,
        slots: usize,
    ) -> Result<CiphertextId, BackendError>;

    /// Release every bootstrapper created so far.
    fn delete_bootstrappers(&mut self) -> Result<(), BackendError>;
}

/// Lets a scheme borrow a backend it does not own.
impl<B: Backend + ?Sized> Backend for &mut B {
    fn max_slots(&self) -> usize {
        (**self).max_slots()
    }

    fn encrypt(&mut self, plaintext: PlaintextId) -> Result<CiphertextId, BackendError> {
        (**self).encrypt(plaintext)
    }

    fn decrypt(&mut self, ciphertext: CiphertextId) -> Result<PlaintextId, BackendError> {
        (**self).decrypt(ciphertext)
    }

    fn generate_linear_transform(
        &mut self,
        request: &TransformRequest<'_>,
    ) -> Result<TransformId, BackendError> {
        (**self).generate_linear_transform(request)
    }

    fn evaluate_linear_transforms(
        &mut self,
        transforms: &[TransformId],
        inputs: &[CiphertextId],
        layer_name: &str,
        storage: StorageConfig<'_>,
    ) -> Result<Vec<CiphertextId>, BackendError> {
        (**self).evaluate_linear_transforms(transforms, inputs, layer_name, storage)
    }

    fn delete_linear_transform(&mut self, transform: TransformId) -> Result<(), BackendError> {
        (**self).delete_linear_transform(transform)
    }

    fn new_bootstrapper(
        &mut self,
        logp: &[u32],
        slots: usize,
    ) -> Result<BootstrapperId, BackendError> {
        (**self).new_bootstrapper(logp, slots)
    }

    fn bootstrap(
        &mut self,
        ciphertext: CiphertextId,
        slots: usize,
    ) -> Result<CiphertextId, BackendError> {
        (**self).bootstrap(ciphertext, slots)
    }

    fn delete_bootstrappers(&mut self) -> Result<(), BackendError> {
        (**self).delete_bootstrappers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display_and_order() {
        assert_eq!(TransformId(7).to_string(), "7");
        assert!(CiphertextId(1) < CiphertextId(2));
    }

    #[test]
    fn test_handle_serializes_as_integer() {
        let json = serde_json::to_string(&vec![TransformId(3), TransformId(4)]).unwrap();
        assert_eq!(json, "[3,4]");
    }

    #[test]
    fn test_backend_err_macro() {
        let err = backend_err!("ciphertext {} not found", 9);
        assert_eq!(err.to_string(), "ciphertext 9 not found");
    }
}
