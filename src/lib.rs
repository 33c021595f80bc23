//! Homomorphic linear transforms for encrypted neural-network inference
//!
//! Linear layers (fully connected, convolutions, pooling) are compiled into
//! blocked diagonal transforms that a CKKS backend evaluates directly on
//! ciphertexts.
//!
//! Key components:
//! - [`lintrans`]: per-block compilation, the on-disk transform cache and
//!   evaluation against ciphertext tensors
//! - [`tensor`]: tensor handles and element-wise encryption
//! - [`bootstrap`]: one bootstrapper per slot count, released with the scheme
//! - [`backend`]: the engine capability, plus a cleartext implementation
//!
//! ```no_run
//! use fhe_lintrans::{CleartextBackend, Scheme, SchemeParams};
//!
//! let params = SchemeParams::toy();
//! let backend = CleartextBackend::new(params.max_slots(), params.max_level());
//! let scheme = Scheme::new(backend, params)?;
//! scheme.close()?;
//! # Ok::<(), fhe_lintrans::Error>(())
//! ```

pub mod backend;
pub mod bootstrap;
pub mod error;
pub mod lintrans;
pub mod params;
pub mod scheme;
pub mod tensor;
pub mod timing;

pub use backend::{
    Backend, BackendError, BootstrapperId, CiphertextId, CleartextBackend, PlaintextId,
    TransformId, TransformRequest,
};
pub use bootstrap::{BootstrapContext, Bootstrapper};
pub use error::{Error, MismatchedField, Result};
pub use lintrans::{
    BlockDiagonals, BlockIndex, Diagonals, LayerDescriptor, LinearTransformEvaluator,
    OutputRotations, TransformCache,
};
pub use params::{EmbeddingMethod, IoMode, SchemeParams, StorageConfig};
pub use scheme::Scheme;
pub use tensor::{CipherTensor, Encryptor, PlainTensor, Shape};
pub use timing::{PhaseRecord, PhaseTimer};
